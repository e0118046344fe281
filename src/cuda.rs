use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use cudarc::{
    cublas::{result::CublasError, sys::cublasOperation_t, CudaBlas, Gemm, Gemv},
    driver::{
        sys::CUresult, CudaDevice, CudaSlice, CudaView, CudaViewMut, DeviceSlice, DriverError,
        LaunchAsync,
    },
    nvrtc::{compile_ptx, CompileError},
};

use crate::{
    backend::{out_of_range, Backend, GemmConfig, GemvConfig, Transpose, View, ViewMut},
    plan::Geometry,
    tensor::{CudaStorage, Device, Element, Error, Storage},
};

/// Kernels loop over the grid, so clamping `n` still covers every element.
pub(crate) fn launch_cfg<const NUM_THREADS: u32>(n: usize) -> cudarc::driver::LaunchConfig {
    let num_blocks = u32::try_from(n).unwrap_or(u32::MAX).div_ceil(NUM_THREADS);
    cudarc::driver::LaunchConfig {
        grid_dim: (num_blocks.max(1), 1, 1),
        block_dim: (NUM_THREADS, 1, 1),
        shared_mem_bytes: 0,
    }
}

thread_local!(pub static CUDA_INSTANCES: RefCell<HashMap<usize, Arc<CudaDevice>>> = RefCell::new(HashMap::new()));

thread_local!(static BLAS_INSTANCES: RefCell<HashMap<usize, Rc<CudaBlas>>> = RefCell::new(HashMap::new()));

#[inline(always)]
pub(crate) fn thread_cuda(ordinal: usize) -> Result<Arc<CudaDevice>, Error> {
    CUDA_INSTANCES.with(|t| {
        let mut instances = t.borrow_mut();
        if let Some(dev) = instances.get(&ordinal) {
            return Ok(dev.clone());
        }
        let dev = CudaDevice::new(ordinal)?;
        tracing::debug!(ordinal, "opened cuda device");
        instances.insert(ordinal, dev.clone());
        Ok(dev)
    })
}

pub(crate) fn thread_blas(ordinal: usize) -> Result<Rc<CudaBlas>, Error> {
    BLAS_INSTANCES.with(|t| {
        let mut instances = t.borrow_mut();
        if let Some(blas) = instances.get(&ordinal) {
            return Ok(blas.clone());
        }
        let blas = Rc::new(CudaBlas::new(thread_cuda(ordinal)?)?);
        instances.insert(ordinal, blas.clone());
        Ok(blas)
    })
}

pub(crate) fn is_out_of_memory(err: &DriverError) -> bool {
    err.0 == CUresult::CUDA_ERROR_OUT_OF_MEMORY
}

impl From<CublasError> for Error {
    fn from(value: CublasError) -> Self {
        Self::Primitive(format!("{value:?}"))
    }
}

impl From<DriverError> for Error {
    fn from(value: DriverError) -> Self {
        Self::Primitive(format!("{value:?}"))
    }
}

impl From<CompileError> for Error {
    fn from(value: CompileError) -> Self {
        Self::Primitive(format!("{value:?}"))
    }
}

#[cfg(feature = "cudnn")]
impl From<cudarc::cudnn::CudnnError> for Error {
    fn from(value: cudarc::cudnn::CudnnError) -> Self {
        Self::Primitive(format!("{value:?}"))
    }
}

fn int(name: &str, value: usize) -> Result<i32, Error> {
    i32::try_from(value)
        .map_err(|_| Error::Primitive(format!("{name} = {value} does not fit in a blas int")))
}

fn slice<'a, T>(view: View<'a, CudaSlice<T>>) -> Result<CudaView<'a, T>, Error> {
    let View { buf, range } = view;
    let err = out_of_range(&range, buf.len());
    buf.try_slice(range).ok_or(err)
}

fn slice_mut<'a, T>(view: ViewMut<'a, CudaSlice<T>>) -> Result<CudaViewMut<'a, T>, Error> {
    let ViewMut { buf, range } = view;
    let err = out_of_range(&range, buf.len());
    buf.try_slice_mut(range).ok_or(err)
}

fn op(trans: Transpose) -> cublasOperation_t {
    match trans {
        Transpose::No => cublasOperation_t::CUBLAS_OP_N,
        Transpose::Yes => cublasOperation_t::CUBLAS_OP_T,
    }
}

/// One CUDA device plus the cuBLAS handle bound to it.
#[derive(Clone)]
pub struct Cuda {
    ordinal: usize,
    dev: Arc<CudaDevice>,
    blas: Rc<CudaBlas>,
}

impl std::fmt::Debug for Cuda {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cuda").field("ordinal", &self.ordinal).finish()
    }
}

impl Cuda {
    pub fn new(ordinal: usize) -> Result<Self, Error> {
        Ok(Self {
            ordinal,
            dev: thread_cuda(ordinal)?,
            blas: thread_blas(ordinal)?,
        })
    }

    fn load<T: Element>(&self, name: &str, src: &str) -> Result<cudarc::driver::CudaFunction, Error> {
        let module_name = std::format!("{name}{}", T::DTYPE.short_name());
        if !self.dev.has_func(&module_name, "kernel") {
            let ty = T::DTYPE.cuda_type_name();
            let kernel_src = src.replace("$T", ty);
            let ptx = compile_ptx(kernel_src)?;
            self.dev.load_ptx(ptx, &module_name, &["kernel"])?;
            tracing::debug!(%module_name, "compiled kernel");
        }
        self.dev
            .get_func(&module_name, "kernel")
            .ok_or_else(|| Error::Primitive(format!("kernel {module_name} failed to load")))
    }
}

const VOL2ROW_SRC: &str = r#"
extern "C" __global__ void kernel(const size_t *info, $T *rows, const $T *vol) {
    const size_t h = info[0], w = info[1], d = info[2], c = info[3];
    const size_t fh = info[4], fw = info[5], fd = info[6];
    const size_t sy = info[7], sx = info[8], st = info[9];
    const size_t py = info[10], px = info[11], pt = info[12];
    const size_t oh = info[13], ow = info[14], od = info[15];
    const size_t pixels = oh * ow * od;
    const size_t numel = pixels * fh * fw * fd * c;
    for (size_t i = blockIdx.x * blockDim.x + threadIdx.x; i < numel; i += blockDim.x * gridDim.x) {
        size_t row = i % pixels;
        size_t col = i / pixels;
        const size_t y = row % oh; row /= oh;
        const size_t x = row % ow;
        const size_t z = row / ow;
        const size_t fy = col % fh; col /= fh;
        const size_t fx = col % fw; col /= fw;
        const size_t ft = col % fd;
        const size_t ch = col / fd;
        const size_t v = y * sy + fy;
        const size_t u = x * sx + fx;
        const size_t t = z * st + ft;
        $T value = 0;
        if (v >= py && v - py < h && u >= px && u - px < w && t >= pt && t - pt < d) {
            value = vol[(v - py) + h * ((u - px) + w * ((t - pt) + d * ch))];
        }
        rows[i] = value;
    }
}
"#;

const ROW2VOL_SRC: &str = r#"
extern "C" __global__ void kernel(const size_t *info, $T *vol, const $T *rows) {
    const size_t h = info[0], w = info[1], d = info[2], c = info[3];
    const size_t fh = info[4], fw = info[5], fd = info[6];
    const size_t sy = info[7], sx = info[8], st = info[9];
    const size_t py = info[10], px = info[11], pt = info[12];
    const size_t oh = info[13], ow = info[14], od = info[15];
    const size_t pixels = oh * ow * od;
    const size_t numel = h * w * d * c;
    for (size_t i = blockIdx.x * blockDim.x + threadIdx.x; i < numel; i += blockDim.x * gridDim.x) {
        size_t j = i;
        const size_t v = j % h + py; j /= h;
        const size_t u = j % w + px; j /= w;
        const size_t t = j % d + pt;
        const size_t ch = j / d;
        $T acc = 0;
        for (size_t ft = 0; ft < fd && ft <= t; ft++) {
            if ((t - ft) % st != 0) continue;
            const size_t z = (t - ft) / st;
            if (z >= od) continue;
            for (size_t fx = 0; fx < fw && fx <= u; fx++) {
                if ((u - fx) % sx != 0) continue;
                const size_t x = (u - fx) / sx;
                if (x >= ow) continue;
                for (size_t fy = 0; fy < fh && fy <= v; fy++) {
                    if ((v - fy) % sy != 0) continue;
                    const size_t y = (v - fy) / sy;
                    if (y >= oh) continue;
                    const size_t col = fy + fh * (fx + fw * (ft + fd * ch));
                    acc += rows[(y + oh * (x + ow * z)) + pixels * col];
                }
            }
        }
        vol[i] = acc;
    }
}
"#;

impl<T: Element> Backend<T> for Cuda
where
    CudaBlas: Gemm<T> + Gemv<T>,
{
    type Buf = CudaSlice<T>;

    fn device(&self) -> Device {
        Device::Cuda(self.ordinal)
    }

    fn buf(storage: &Storage) -> Option<&CudaSlice<T>> {
        match storage {
            Storage::Cuda(buf) => T::device(buf),
            _ => None,
        }
    }

    fn buf_mut(storage: &mut Storage) -> Option<&mut CudaSlice<T>> {
        match storage {
            Storage::Cuda(buf) => T::device_mut(buf),
            _ => None,
        }
    }

    fn len(buf: &CudaSlice<T>) -> usize {
        buf.len()
    }

    fn gemm(
        &self,
        cfg: &GemmConfig<T>,
        a: View<'_, CudaSlice<T>>,
        b: View<'_, CudaSlice<T>>,
        c: ViewMut<'_, CudaSlice<T>>,
    ) -> Result<(), Error> {
        cfg.check(a.len(), b.len(), c.len())?;
        if cfg.m == 0 || cfg.n == 0 {
            return Ok(());
        }
        let blas_cfg = cudarc::cublas::GemmConfig {
            transa: op(cfg.transa),
            transb: op(cfg.transb),
            m: int("m", cfg.m)?,
            n: int("n", cfg.n)?,
            k: int("k", cfg.k)?,
            alpha: cfg.alpha,
            lda: int("lda", cfg.lda)?,
            ldb: int("ldb", cfg.ldb)?,
            beta: cfg.beta,
            ldc: int("ldc", cfg.ldc)?,
        };
        let a_view = slice(a)?;
        let b_view = slice(b)?;
        let mut c_view = slice_mut(c)?;
        unsafe { self.blas.gemm(blas_cfg, &a_view, &b_view, &mut c_view) }?;
        Ok(())
    }

    fn gemv(
        &self,
        cfg: &GemvConfig<T>,
        a: View<'_, CudaSlice<T>>,
        x: View<'_, CudaSlice<T>>,
        y: ViewMut<'_, CudaSlice<T>>,
    ) -> Result<(), Error> {
        cfg.check(a.len(), x.len(), y.len())?;
        let blas_cfg = cudarc::cublas::GemvConfig {
            trans: op(cfg.trans),
            m: int("m", cfg.m)?,
            n: int("n", cfg.n)?,
            alpha: cfg.alpha,
            lda: int("lda", cfg.lda)?,
            incx: int("incx", cfg.incx)?,
            beta: cfg.beta,
            incy: int("incy", cfg.incy)?,
        };
        let a_view = slice(a)?;
        let x_view = slice(x)?;
        let mut y_view = slice_mut(y)?;
        unsafe { self.blas.gemv(blas_cfg, &a_view, &x_view, &mut y_view) }?;
        Ok(())
    }

    fn vol2row(
        &self,
        rows: ViewMut<'_, CudaSlice<T>>,
        vol: View<'_, CudaSlice<T>>,
        geometry: &Geometry,
    ) -> Result<(), Error> {
        geometry.check(rows.len(), vol.len())?;
        let numel = geometry.rows_len();
        if numel == 0 {
            return Ok(());
        }
        let f = self.load::<T>("vol2row", VOL2ROW_SRC)?;
        let info = self.dev.htod_copy(geometry.info())?;
        let mut rows_view = slice_mut(rows)?;
        let vol_view = slice(vol)?;
        unsafe { f.launch(launch_cfg::<128>(numel), (&info, &mut rows_view, &vol_view)) }?;
        Ok(())
    }

    fn row2vol(
        &self,
        vol: ViewMut<'_, CudaSlice<T>>,
        rows: View<'_, CudaSlice<T>>,
        geometry: &Geometry,
    ) -> Result<(), Error> {
        geometry.check(rows.len(), vol.len())?;
        let numel = geometry.volume();
        if numel == 0 {
            return Ok(());
        }
        let f = self.load::<T>("row2vol", ROW2VOL_SRC)?;
        let info = self.dev.htod_copy(geometry.info())?;
        let mut vol_view = slice_mut(vol)?;
        let rows_view = slice(rows)?;
        unsafe { f.launch(launch_cfg::<128>(numel), (&info, &mut vol_view, &rows_view)) }?;
        Ok(())
    }
}

/// Allocates `len` elements of `T` on `ordinal`, every one set to `value`.
pub(crate) fn alloc_filled<T: Element>(
    ordinal: usize,
    len: usize,
    value: T,
    what: &'static str,
) -> Result<CudaStorage, Error> {
    let dev = thread_cuda(ordinal)?;
    let oom = |e: DriverError| {
        if is_out_of_memory(&e) {
            Error::OutOfMemory {
                device: Device::Cuda(ordinal),
                requested: len * T::DTYPE.num_bytes(),
                what,
            }
        } else {
            e.into()
        }
    };
    let buf = if value == T::zero() {
        dev.alloc_zeros::<T>(len).map_err(oom)?
    } else {
        dev.htod_sync_copy(&vec![value; len]).map_err(oom)?
    };
    Ok(T::into_device(buf))
}
