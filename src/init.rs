use std::ops::Deref;
use std::{cell::RefCell, rc::Rc};

use rand::Rng;
use rand_distr::{Distribution, Standard, StandardNormal};

use crate::tensor::*;

thread_local! {
    pub(crate) static DEFAULT_DTYPE: RefCell<Dtype> = const {
        RefCell::new(Dtype::Float32)
    }
}

impl Default for Dtype {
    fn default() -> Self {
        DEFAULT_DTYPE.with_borrow(|dtype| *dtype)
    }
}

pub fn set_default_dtype(dtype: Dtype) {
    DEFAULT_DTYPE.with_borrow_mut(|default_dtype| *default_dtype = dtype);
}

pub struct WithDtypeGuard {
    prev: Dtype,
}

pub fn with_dtype(dtype: Dtype) -> WithDtypeGuard {
    WithDtypeGuard {
        prev: DEFAULT_DTYPE.with_borrow_mut(|curr| std::mem::replace(curr, dtype)),
    }
}

impl Drop for WithDtypeGuard {
    fn drop(&mut self) {
        DEFAULT_DTYPE.with_borrow_mut(|x| *x = self.prev);
    }
}

thread_local! {
    pub(crate) static DEFAULT_DEVICE: RefCell<Device> = const {
        RefCell::new(Device::Cpu)
    }
}

pub fn set_default_device(device: Device) {
    DEFAULT_DEVICE.with_borrow_mut(|default_device| *default_device = device);
}

impl Default for Device {
    fn default() -> Self {
        DEFAULT_DEVICE.with_borrow(|device| *device)
    }
}

pub struct WithDeviceGuard {
    prev: Device,
}

pub fn with_device(device: Device) -> WithDeviceGuard {
    WithDeviceGuard {
        prev: DEFAULT_DEVICE.with_borrow_mut(|curr| std::mem::replace(curr, device)),
    }
}

impl Drop for WithDeviceGuard {
    fn drop(&mut self) {
        DEFAULT_DEVICE.with_borrow_mut(|x| *x = self.prev);
    }
}

pub(crate) fn build_tensor(dtype: Dtype, shape: Vec<usize>, storage: Storage) -> Tensor {
    Tensor {
        dtype,
        shape,
        storage: Rc::new(RefCell::new(storage)),
    }
}

fn host_filled<T: Element>(len: usize, value: T, what: &'static str) -> Result<CpuStorage, Error> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| Error::OutOfMemory {
            device: Device::Cpu,
            requested: len * T::DTYPE.num_bytes(),
            what,
        })?;
    buf.resize(len, value);
    Ok(T::into_host(buf))
}

/// Allocates `len` elements of `dtype` on `device`, each set to `value`.
pub(crate) fn alloc_storage(
    device: Device,
    dtype: Dtype,
    len: usize,
    value: Scalar,
    what: &'static str,
) -> Result<Storage, Error> {
    Ok(match (device, dtype) {
        (Device::Phantom, _) => Storage::Phantom,
        (Device::Cpu, Dtype::Float32) => {
            Storage::Cpu(host_filled(len, f32::from_scalar(value), what)?)
        }
        (Device::Cpu, Dtype::Float64) => {
            Storage::Cpu(host_filled(len, f64::from_scalar(value), what)?)
        }
        #[cfg(feature = "cuda")]
        (Device::Cuda(ordinal), Dtype::Float32) => Storage::Cuda(crate::cuda::alloc_filled(
            ordinal,
            len,
            f32::from_scalar(value),
            what,
        )?),
        #[cfg(feature = "cuda")]
        (Device::Cuda(ordinal), Dtype::Float64) => Storage::Cuda(crate::cuda::alloc_filled(
            ordinal,
            len,
            f64::from_scalar(value),
            what,
        )?),
        #[cfg(not(feature = "cuda"))]
        (Device::Cuda(_), _) => return Err(Error::DeviceUnavailable(device)),
    })
}

/// Moves a host buffer onto `device`.
pub(crate) fn upload<T: Element>(device: Device, buf: Vec<T>) -> Result<Storage, Error> {
    Ok(match device {
        Device::Phantom => Storage::Phantom,
        Device::Cpu => Storage::Cpu(T::into_host(buf)),
        #[cfg(feature = "cuda")]
        Device::Cuda(ordinal) => {
            let cuda = crate::cuda::thread_cuda(ordinal)?;
            Storage::Cuda(T::into_device(cuda.htod_sync_copy(&buf)?))
        }
        #[cfg(not(feature = "cuda"))]
        Device::Cuda(_) => return Err(Error::DeviceUnavailable(device)),
    })
}

fn upload_f64(device: Device, dtype: Dtype, values: Vec<f64>) -> Result<Storage, Error> {
    match dtype {
        Dtype::Float32 => upload(device, values.into_iter().map(|x| x as f32).collect()),
        Dtype::Float64 => upload(device, values),
    }
}

pub fn zeros<Shape>(shape: Shape) -> Result<Tensor, Error>
where
    Shape: Into<Vec<usize>>,
{
    zeros_on(shape, Default::default(), Default::default())
}

pub fn zeros_on<Shape>(shape: Shape, dtype: Dtype, device: Device) -> Result<Tensor, Error>
where
    Shape: Into<Vec<usize>>,
{
    let shape = Into::<Vec<usize>>::into(shape);
    let numel: usize = shape.iter().product();
    let storage = alloc_storage(device, dtype, numel, dtype.zero(), "tensor")?;
    Ok(build_tensor(dtype, shape, storage))
}

pub fn zeros_like(x: &Tensor) -> Result<Tensor, Error> {
    zeros_on(x.shape.clone(), x.dtype(), x.device())
}

pub fn full<Shape, S>(shape: Shape, value: S) -> Result<Tensor, Error>
where
    Shape: Into<Vec<usize>>,
    S: Into<Scalar>,
{
    let shape = Into::<Vec<usize>>::into(shape);
    let value = Into::<Scalar>::into(value);
    let dtype = value.dtype();
    let numel: usize = shape.iter().product();
    let storage = alloc_storage(Default::default(), dtype, numel, value, "tensor")?;
    Ok(build_tensor(dtype, shape, storage))
}

pub fn copy_slice<T, Shape>(buf: &[T], shape: Shape) -> Result<Tensor, Error>
where
    Shape: Into<Vec<usize>>,
    T: Element,
{
    let shape = Into::<Vec<usize>>::into(shape);
    let numel: usize = shape.iter().product();
    if numel != buf.len() {
        return Err(Error::ShapeMismatch(format!(
            "shape {shape:?} has {numel} elements, but found {} elements in src slice",
            buf.len()
        )));
    }
    let storage = upload(Default::default(), buf.to_vec())?;
    Ok(build_tensor(T::DTYPE, shape, storage))
}

pub fn sample_uniform<Shape>(shape: Shape) -> Result<Tensor, Error>
where
    Shape: Into<Vec<usize>>,
{
    sample_dist(shape, &Standard)
}

pub fn sample_normal<Shape>(shape: Shape) -> Result<Tensor, Error>
where
    Shape: Into<Vec<usize>>,
{
    sample_dist(shape, &StandardNormal)
}

/// Samples in double precision and rounds to the default dtype.
pub fn sample_dist<Shape, D>(shape: Shape, distr: &D) -> Result<Tensor, Error>
where
    Shape: Into<Vec<usize>>,
    D: Distribution<f64>,
{
    let shape = Into::<Vec<usize>>::into(shape);
    let dtype: Dtype = Default::default();
    let numel: usize = shape.iter().product();
    let mut rng = rand::thread_rng();
    let values: Vec<f64> = (0..numel).map(|_| rng.sample(distr)).collect();
    let storage = upload_f64(Default::default(), dtype, values)?;
    Ok(build_tensor(dtype, shape, storage))
}

impl Tensor {
    /// Copies the elements back to the host.
    pub fn into_vec<T: Element>(self) -> Result<Vec<T>, Error> {
        if self.dtype != T::DTYPE {
            return Err(Error::DtypeMismatch {
                expected: T::DTYPE,
                found: self.dtype,
            });
        }
        let storage = self.storage.borrow();
        match storage.deref() {
            Storage::Cpu(buf) => T::host(buf).cloned().ok_or(Error::DtypeMismatch {
                expected: T::DTYPE,
                found: buf.dtype(),
            }),
            #[cfg(feature = "cuda")]
            Storage::Cuda(buf) => {
                let slice = T::device(buf).ok_or(Error::DtypeMismatch {
                    expected: T::DTYPE,
                    found: self.dtype,
                })?;
                Ok(crate::cuda::thread_cuda(buf.ordinal())?.dtoh_sync_copy(slice)?)
            }
            Storage::Phantom => Err(Error::DeviceMismatch {
                expected: Device::Cpu,
                found: Device::Phantom,
            }),
        }
    }

    /// Copies the elements back to the host, widened to `f64`.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>, Error> {
        match self.dtype {
            Dtype::Float32 => Ok(self
                .clone()
                .into_vec::<f32>()?
                .into_iter()
                .map(f64::from)
                .collect()),
            Dtype::Float64 => self.clone().into_vec::<f64>(),
        }
    }
}
