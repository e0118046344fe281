//! The primitives the convolution pipelines are written against.
//!
//! Matrices are column-major. A `beta` of zero overwrites the destination without reading it.

use std::ops::Range;

use crate::{
    plan::Geometry,
    tensor::{Device, Element, Error, Storage},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transpose {
    No,
    Yes,
}

/// `C = alpha * op(A) * op(B) + beta * C` with `op(A)` m×k, `op(B)` k×n and `C` m×n.
#[derive(Debug, Clone, Copy)]
pub struct GemmConfig<T> {
    pub transa: Transpose,
    pub transb: Transpose,
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub alpha: T,
    pub lda: usize,
    pub ldb: usize,
    pub beta: T,
    pub ldc: usize,
}

/// `y = alpha * op(A) * x + beta * y` with `A` m×n.
#[derive(Debug, Clone, Copy)]
pub struct GemvConfig<T> {
    pub trans: Transpose,
    pub m: usize,
    pub n: usize,
    pub alpha: T,
    pub lda: usize,
    pub incx: usize,
    pub beta: T,
    pub incy: usize,
}

/// Whether a kernel overwrites its destination or adds into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accumulation {
    Overwrite,
    Accumulate,
}

impl Accumulation {
    pub fn beta<T: Element>(self) -> T {
        match self {
            Accumulation::Overwrite => T::zero(),
            Accumulation::Accumulate => T::one(),
        }
    }
}

/// A borrowed sub-block of a device buffer.
#[derive(Debug)]
pub(crate) struct View<'a, B> {
    pub buf: &'a B,
    pub range: Range<usize>,
}

#[derive(Debug)]
pub(crate) struct ViewMut<'a, B> {
    pub buf: &'a mut B,
    pub range: Range<usize>,
}

#[cfg(feature = "cuda")]
impl<B> View<'_, B> {
    pub fn len(&self) -> usize {
        self.range.len()
    }
}

#[cfg(feature = "cuda")]
impl<B> ViewMut<'_, B> {
    pub fn len(&self) -> usize {
        self.range.len()
    }
}

pub(crate) trait Backend<T: Element> {
    type Buf;

    fn device(&self) -> Device;

    fn buf(storage: &Storage) -> Option<&Self::Buf>;

    fn buf_mut(storage: &mut Storage) -> Option<&mut Self::Buf>;

    fn len(buf: &Self::Buf) -> usize;

    fn view(buf: &Self::Buf, range: Range<usize>) -> Result<View<'_, Self::Buf>, Error> {
        let len = Self::len(buf);
        if range.start > range.end || range.end > len {
            return Err(out_of_range(&range, len));
        }
        Ok(View { buf, range })
    }

    fn view_mut(buf: &mut Self::Buf, range: Range<usize>) -> Result<ViewMut<'_, Self::Buf>, Error> {
        let len = Self::len(buf);
        if range.start > range.end || range.end > len {
            return Err(out_of_range(&range, len));
        }
        Ok(ViewMut { buf, range })
    }

    fn gemm(
        &self,
        cfg: &GemmConfig<T>,
        a: View<'_, Self::Buf>,
        b: View<'_, Self::Buf>,
        c: ViewMut<'_, Self::Buf>,
    ) -> Result<(), Error>;

    fn gemv(
        &self,
        cfg: &GemvConfig<T>,
        a: View<'_, Self::Buf>,
        x: View<'_, Self::Buf>,
        y: ViewMut<'_, Self::Buf>,
    ) -> Result<(), Error>;

    /// Unfolds one image into its (output pixels × patch) matrix. Padding reads as zero.
    fn vol2row(
        &self,
        rows: ViewMut<'_, Self::Buf>,
        vol: View<'_, Self::Buf>,
        geometry: &Geometry,
    ) -> Result<(), Error>;

    /// Adjoint of [Backend::vol2row]: overwrites `vol` with the sum of every patch entry
    /// that was read from each position.
    fn row2vol(
        &self,
        vol: ViewMut<'_, Self::Buf>,
        rows: View<'_, Self::Buf>,
        geometry: &Geometry,
    ) -> Result<(), Error>;
}

pub(crate) fn out_of_range(range: &Range<usize>, len: usize) -> Error {
    Error::ShapeMismatch(format!(
        "range {range:?} exceeds storage of {len} elements"
    ))
}

/// Checks that a column-major `rows`×`cols` matrix with leading dimension `ld` fits in `len`.
pub(crate) fn check_matrix(
    name: &str,
    len: usize,
    rows: usize,
    cols: usize,
    ld: usize,
) -> Result<(), Error> {
    if ld < rows.max(1) {
        return Err(Error::Primitive(format!(
            "leading dimension of {name} is {ld}, needs at least {rows}"
        )));
    }
    if rows > 0 && cols > 0 && (cols - 1) * ld + rows > len {
        return Err(Error::Primitive(format!(
            "{name} is {rows}x{cols} with leading dimension {ld}, but only {len} elements are available"
        )));
    }
    Ok(())
}

pub(crate) fn check_vector(name: &str, len: usize, n: usize, inc: usize) -> Result<(), Error> {
    if inc == 0 {
        return Err(Error::Primitive(format!("increment of {name} is zero")));
    }
    if n > 0 && (n - 1) * inc + 1 > len {
        return Err(Error::Primitive(format!(
            "{name} has {n} entries with increment {inc}, but only {len} elements are available"
        )));
    }
    Ok(())
}

impl<T: Element> GemmConfig<T> {
    pub(crate) fn check(&self, a: usize, b: usize, c: usize) -> Result<(), Error> {
        let (ar, ac) = match self.transa {
            Transpose::No => (self.m, self.k),
            Transpose::Yes => (self.k, self.m),
        };
        let (br, bc) = match self.transb {
            Transpose::No => (self.k, self.n),
            Transpose::Yes => (self.n, self.k),
        };
        check_matrix("A", a, ar, ac, self.lda)?;
        check_matrix("B", b, br, bc, self.ldb)?;
        check_matrix("C", c, self.m, self.n, self.ldc)
    }
}

impl<T: Element> GemvConfig<T> {
    pub(crate) fn check(&self, a: usize, x: usize, y: usize) -> Result<(), Error> {
        let (nx, ny) = match self.trans {
            Transpose::No => (self.n, self.m),
            Transpose::Yes => (self.m, self.n),
        };
        check_matrix("A", a, self.m, self.n, self.lda)?;
        check_vector("x", x, nx, self.incx)?;
        check_vector("y", y, ny, self.incy)
    }
}

impl Geometry {
    pub(crate) fn check(&self, rows: usize, vol: usize) -> Result<(), Error> {
        if rows < self.rows_len() || vol < self.volume() {
            return Err(Error::Primitive(format!(
                "patch matrix of {rows} and volume of {vol} elements, need {} and {}",
                self.rows_len(),
                self.volume()
            )));
        }
        Ok(())
    }
}
