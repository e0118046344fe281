use crate::{
    backend::{Backend, GemmConfig, GemvConfig, Transpose, View, ViewMut},
    plan::Geometry,
    tensor::{Device, Element, Error, Storage},
};

/// Host backend. Kernels run on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cpu;

impl<T: Element> Backend<T> for Cpu {
    type Buf = Vec<T>;

    fn device(&self) -> Device {
        Device::Cpu
    }

    fn buf(storage: &Storage) -> Option<&Vec<T>> {
        match storage {
            Storage::Cpu(buf) => T::host(buf),
            _ => None,
        }
    }

    fn buf_mut(storage: &mut Storage) -> Option<&mut Vec<T>> {
        match storage {
            Storage::Cpu(buf) => T::host_mut(buf),
            _ => None,
        }
    }

    fn len(buf: &Vec<T>) -> usize {
        buf.len()
    }

    fn gemm(
        &self,
        cfg: &GemmConfig<T>,
        a: View<'_, Vec<T>>,
        b: View<'_, Vec<T>>,
        c: ViewMut<'_, Vec<T>>,
    ) -> Result<(), Error> {
        let ViewMut { buf, range } = c;
        gemm(cfg, &a.buf[a.range], &b.buf[b.range], &mut buf[range])
    }

    fn gemv(
        &self,
        cfg: &GemvConfig<T>,
        a: View<'_, Vec<T>>,
        x: View<'_, Vec<T>>,
        y: ViewMut<'_, Vec<T>>,
    ) -> Result<(), Error> {
        let ViewMut { buf, range } = y;
        gemv(cfg, &a.buf[a.range], &x.buf[x.range], &mut buf[range])
    }

    fn vol2row(
        &self,
        rows: ViewMut<'_, Vec<T>>,
        vol: View<'_, Vec<T>>,
        geometry: &Geometry,
    ) -> Result<(), Error> {
        let ViewMut { buf, range } = rows;
        vol2row(&mut buf[range], &vol.buf[vol.range], geometry)
    }

    fn row2vol(
        &self,
        vol: ViewMut<'_, Vec<T>>,
        rows: View<'_, Vec<T>>,
        geometry: &Geometry,
    ) -> Result<(), Error> {
        let ViewMut { buf, range } = vol;
        row2vol(&mut buf[range], &rows.buf[rows.range], geometry)
    }
}

#[inline]
fn scale<T: Element>(y: &mut [T], beta: T) {
    if beta == T::zero() {
        y.fill(T::zero());
    } else if beta != T::one() {
        y.iter_mut().for_each(|v| *v = *v * beta);
    }
}

#[inline]
fn axpy<T: Element>(y: &mut [T], alpha: T, x: &[T]) {
    y.iter_mut().zip(x).for_each(|(y, x)| *y = *y + alpha * *x);
}

#[inline]
fn dot<T: Element>(x: &[T], y: &[T]) -> T {
    x.iter().zip(y).fold(T::zero(), |acc, (x, y)| acc + *x * *y)
}

/// Column-major `C = alpha * op(A) * op(B) + beta * C`.
pub fn gemm<T: Element>(cfg: &GemmConfig<T>, a: &[T], b: &[T], c: &mut [T]) -> Result<(), Error> {
    cfg.check(a.len(), b.len(), c.len())?;
    let GemmConfig {
        transa,
        transb,
        m,
        n,
        k,
        alpha,
        lda,
        ldb,
        beta,
        ldc,
    } = *cfg;
    if m == 0 || n == 0 {
        return Ok(());
    }

    for j in 0..n {
        scale(&mut c[j * ldc..j * ldc + m], beta);
    }
    if alpha == T::zero() || k == 0 {
        return Ok(());
    }

    match (transa, transb) {
        (Transpose::No, _) => {
            for j in 0..n {
                let c_col = &mut c[j * ldc..j * ldc + m];
                for l in 0..k {
                    let b_lj = match transb {
                        Transpose::No => b[l + j * ldb],
                        Transpose::Yes => b[j + l * ldb],
                    };
                    axpy(c_col, alpha * b_lj, &a[l * lda..l * lda + m]);
                }
            }
        }
        (Transpose::Yes, Transpose::No) => {
            for j in 0..n {
                let b_col = &b[j * ldb..j * ldb + k];
                for i in 0..m {
                    let acc = dot(&a[i * lda..i * lda + k], b_col);
                    c[i + j * ldc] = c[i + j * ldc] + alpha * acc;
                }
            }
        }
        (Transpose::Yes, Transpose::Yes) => {
            for j in 0..n {
                for i in 0..m {
                    let a_col = &a[i * lda..i * lda + k];
                    let acc = (0..k).fold(T::zero(), |acc, l| acc + a_col[l] * b[j + l * ldb]);
                    c[i + j * ldc] = c[i + j * ldc] + alpha * acc;
                }
            }
        }
    }
    Ok(())
}

/// Column-major `y = alpha * op(A) * x + beta * y`.
pub fn gemv<T: Element>(cfg: &GemvConfig<T>, a: &[T], x: &[T], y: &mut [T]) -> Result<(), Error> {
    cfg.check(a.len(), x.len(), y.len())?;
    let GemvConfig {
        trans,
        m,
        n,
        alpha,
        lda,
        incx,
        beta,
        incy,
    } = *cfg;
    let ny = match trans {
        Transpose::No => m,
        Transpose::Yes => n,
    };

    for i in 0..ny {
        y[i * incy] = if beta == T::zero() {
            T::zero()
        } else {
            beta * y[i * incy]
        };
    }
    if alpha == T::zero() {
        return Ok(());
    }

    match trans {
        Transpose::No => {
            for j in 0..n {
                let t = alpha * x[j * incx];
                for i in 0..m {
                    y[i * incy] = y[i * incy] + t * a[i + j * lda];
                }
            }
        }
        Transpose::Yes => {
            for j in 0..n {
                let a_col = &a[j * lda..j * lda + m];
                let acc = (0..m).fold(T::zero(), |acc, i| acc + a_col[i] * x[i * incx]);
                y[j * incy] = y[j * incy] + alpha * acc;
            }
        }
    }
    Ok(())
}

/// Calls `f(entry, source)` for every entry of the patch matrix, where `source` is the
/// volume index read by that entry or `None` inside the padding.
#[inline]
fn for_each_tap<F: FnMut(usize, Option<usize>)>(g: &Geometry, mut f: F) {
    let pixels = g.num_output_pixels();
    let mut col = 0;
    for c in 0..g.channels {
        for ft in 0..g.filter_depth {
            for fx in 0..g.filter_width {
                for fy in 0..g.filter_height {
                    for z in 0..g.out_depth {
                        let t = (z * g.stride_t + ft)
                            .checked_sub(g.pad_t)
                            .filter(|&t| t < g.depth);
                        for x in 0..g.out_width {
                            let u = (x * g.stride_x + fx)
                                .checked_sub(g.pad_left)
                                .filter(|&u| u < g.width);
                            for y in 0..g.out_height {
                                let v = (y * g.stride_y + fy)
                                    .checked_sub(g.pad_top)
                                    .filter(|&v| v < g.height);
                                let row = y + g.out_height * (x + g.out_width * z);
                                let src = match (v, u, t) {
                                    (Some(v), Some(u), Some(t)) => {
                                        Some(v + g.height * (u + g.width * (t + g.depth * c)))
                                    }
                                    _ => None,
                                };
                                f(row + col * pixels, src);
                            }
                        }
                    }
                    col += 1;
                }
            }
        }
    }
}

/// Unfolds one (height, width, depth, channels) image into the column-major
/// (output pixels × patch) matrix.
///
/// Column `fy + fh * (fx + fw * (ft + fd * c))` holds filter tap (fy, fx, ft) of channel
/// `c`, matching the layout of a filter bank.
pub fn vol2row<T: Element>(rows: &mut [T], vol: &[T], geometry: &Geometry) -> Result<(), Error> {
    geometry.check(rows.len(), vol.len())?;
    for_each_tap(geometry, |i, src| {
        rows[i] = src.map_or(T::zero(), |s| vol[s]);
    });
    Ok(())
}

/// Folds a patch matrix back into a volume, summing overlapping taps.
pub fn row2vol<T: Element>(vol: &mut [T], rows: &[T], geometry: &Geometry) -> Result<(), Error> {
    geometry.check(rows.len(), vol.len())?;
    vol[..geometry.volume()].fill(T::zero());
    for_each_tap(geometry, |i, src| {
        if let Some(s) = src {
            vol[s] = vol[s] + rows[i];
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Conv3dParams;

    fn naive_gemm(
        transa: Transpose,
        transb: Transpose,
        m: usize,
        n: usize,
        k: usize,
        a: &[f64],
        lda: usize,
        b: &[f64],
        ldb: usize,
    ) -> Vec<f64> {
        let mut c = vec![0.0; m * n];
        for i in 0..m {
            for j in 0..n {
                for l in 0..k {
                    let a_il = match transa {
                        Transpose::No => a[i + l * lda],
                        Transpose::Yes => a[l + i * lda],
                    };
                    let b_lj = match transb {
                        Transpose::No => b[l + j * ldb],
                        Transpose::Yes => b[j + l * ldb],
                    };
                    c[i + j * m] += a_il * b_lj;
                }
            }
        }
        c
    }

    fn ramp(n: usize, scale: f64) -> Vec<f64> {
        (0..n).map(|i| ((i * 7 % 11) as f64 - 5.0) * scale).collect()
    }

    #[test]
    fn test_gemm_all_transposes() -> Result<(), Error> {
        let (m, n, k) = (4, 3, 5);
        for transa in [Transpose::No, Transpose::Yes] {
            for transb in [Transpose::No, Transpose::Yes] {
                let lda = if transa == Transpose::No { m } else { k };
                let ldb = if transb == Transpose::No { k } else { n };
                let a = ramp(m * k, 0.5);
                let b = ramp(k * n, 0.25);
                let prior = ramp(m * n, 1.0);
                let mut c = prior.clone();
                let cfg = GemmConfig {
                    transa,
                    transb,
                    m,
                    n,
                    k,
                    alpha: 2.0,
                    lda,
                    ldb,
                    beta: 0.5,
                    ldc: m,
                };
                gemm(&cfg, &a, &b, &mut c)?;
                let product = naive_gemm(transa, transb, m, n, k, &a, lda, &b, ldb);
                for i in 0..m * n {
                    let expected = 2.0 * product[i] + 0.5 * prior[i];
                    assert!((c[i] - expected).abs() < 1e-12, "{transa:?} {transb:?}");
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_gemm_beta_zero_ignores_destination() -> Result<(), Error> {
        let a = [1.0f32, 2.0];
        let b = [3.0f32];
        let mut c = [f32::NAN, f32::INFINITY];
        let cfg = GemmConfig {
            transa: Transpose::No,
            transb: Transpose::No,
            m: 2,
            n: 1,
            k: 1,
            alpha: 1.0,
            lda: 2,
            ldb: 1,
            beta: 0.0,
            ldc: 2,
        };
        gemm(&cfg, &a, &b, &mut c)?;
        assert_eq!(c, [3.0, 6.0]);
        Ok(())
    }

    #[test]
    fn test_gemm_rejects_short_buffers() {
        let cfg = GemmConfig {
            transa: Transpose::No,
            transb: Transpose::No,
            m: 2,
            n: 2,
            k: 2,
            alpha: 1.0f64,
            lda: 2,
            ldb: 2,
            beta: 0.0,
            ldc: 2,
        };
        let mut c = [0.0; 4];
        let res = gemm(&cfg, &[1.0; 3], &[1.0; 4], &mut c);
        assert!(matches!(res, Err(Error::Primitive(_))));
    }

    #[test]
    fn test_gemv() -> Result<(), Error> {
        // A = [[1, 3, 5], [2, 4, 6]] column-major.
        let a = [1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut y = [f64::NAN, f64::NAN, f64::NAN];
        let cfg = GemvConfig {
            trans: Transpose::Yes,
            m: 2,
            n: 3,
            alpha: 1.0,
            lda: 2,
            incx: 1,
            beta: 0.0,
            incy: 1,
        };
        gemv(&cfg, &a, &[1.0, 1.0], &mut y)?;
        assert_eq!(y, [3.0, 7.0, 11.0]);

        gemv(&GemvConfig { beta: 1.0, ..cfg }, &a, &[1.0, 0.0], &mut y)?;
        assert_eq!(y, [4.0, 10.0, 16.0]);

        let mut y = [1.0, 1.0];
        let cfg = GemvConfig {
            trans: Transpose::No,
            m: 2,
            n: 3,
            alpha: 2.0,
            lda: 2,
            incx: 1,
            beta: 1.0,
            incy: 1,
        };
        gemv(&cfg, &a, &[1.0, 0.0, 1.0], &mut y)?;
        assert_eq!(y, [13.0, 17.0]);
        Ok(())
    }

    #[test]
    fn test_vol2row_layout() -> Result<(), Error> {
        // 3x2x1 image, one channel, 2x1x1 filter, stride 1, one row of top padding.
        let params = Conv3dParams::default().with_padding(1, 0, 0, 0, 0);
        let g = Geometry::new([3, 2, 1, 1], [2, 1, 1], &params)?;
        assert_eq!((g.out_height, g.out_width, g.out_depth), (3, 2, 1));
        let vol = [1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut rows = vec![f64::NAN; g.rows_len()];
        vol2row(&mut rows, &vol, &g)?;
        // first column: tap fy = 0 reads the row above each output pixel.
        assert_eq!(&rows[..6], &[0.0, 1.0, 2.0, 0.0, 4.0, 5.0]);
        assert_eq!(&rows[6..], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        Ok(())
    }

    #[test]
    fn test_row2vol_is_adjoint_of_vol2row() -> Result<(), Error> {
        let params = Conv3dParams::default()
            .with_stride(2, 1, 2)
            .with_padding(1, 2, 0, 1, 1);
        let g = Geometry::new([5, 4, 3, 2], [3, 2, 2], &params)?;
        let x = ramp(g.volume(), 0.1);
        let y = ramp(g.rows_len(), 0.3);

        let mut rows = vec![0.0; g.rows_len()];
        vol2row(&mut rows, &x, &g)?;
        let mut vol = vec![f64::NAN; g.volume()];
        row2vol(&mut vol, &y, &g)?;

        let lhs: f64 = rows.iter().zip(&y).map(|(a, b)| a * b).sum();
        let rhs: f64 = x.iter().zip(&vol).map(|(a, b)| a * b).sum();
        assert!((lhs - rhs).abs() < 1e-9 * lhs.abs().max(1.0));
        Ok(())
    }

    #[test]
    fn test_row2vol_counts_coverage() -> Result<(), Error> {
        // 4x1x1 volume with a 2x1x1 filter and stride 1: inner positions are read twice.
        let g = Geometry::new([4, 1, 1, 1], [2, 1, 1], &Conv3dParams::default())?;
        let ones = vec![1.0f32; g.rows_len()];
        let mut vol = vec![0.0f32; 4];
        row2vol(&mut vol, &ones, &g)?;
        assert_eq!(vol, [1.0, 2.0, 2.0, 1.0]);
        Ok(())
    }
}
