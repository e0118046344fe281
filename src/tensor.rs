use std::{cell::RefCell, ops::Deref, rc::Rc};

pub use crate::dtype::{Dtype, Element, Scalar};

/// A dense column-major tensor: the first dimension varies fastest.
///
/// Convolution tensors are read as (height, width, depth, channels, batch); missing trailing
/// dimensions count as 1. Clones share storage.
#[derive(Debug, Clone)]
pub struct Tensor {
    pub(crate) dtype: Dtype,
    pub(crate) shape: Vec<usize>,
    pub(crate) storage: Rc<RefCell<Storage>>,
}

#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum Storage {
    Phantom,
    Cpu(CpuStorage),
    #[cfg(feature = "cuda")]
    Cuda(CudaStorage),
}

#[derive(Debug, Clone)]
pub enum CpuStorage {
    Float32(Vec<f32>),
    Float64(Vec<f64>),
}

#[cfg(feature = "cuda")]
#[derive(Debug, Clone)]
pub enum CudaStorage {
    Float32(cudarc::driver::CudaSlice<f32>),
    Float64(cudarc::driver::CudaSlice<f64>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    /// Shape-only tensors. Operations validate shapes and skip the arithmetic.
    Phantom,
    Cpu,
    Cuda(usize),
}

impl CpuStorage {
    pub fn len(&self) -> usize {
        match self {
            CpuStorage::Float32(buf) => buf.len(),
            CpuStorage::Float64(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> Dtype {
        match self {
            CpuStorage::Float32(_) => Dtype::Float32,
            CpuStorage::Float64(_) => Dtype::Float64,
        }
    }
}

#[cfg(feature = "cuda")]
impl CudaStorage {
    pub fn len(&self) -> usize {
        use cudarc::driver::DeviceSlice;
        match self {
            CudaStorage::Float32(buf) => buf.len(),
            CudaStorage::Float64(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ordinal(&self) -> usize {
        use cudarc::driver::DeviceSlice;
        match self {
            CudaStorage::Float32(buf) => buf.device().ordinal(),
            CudaStorage::Float64(buf) => buf.device().ordinal(),
        }
    }
}

impl Storage {
    pub fn device(&self) -> Device {
        match self {
            Storage::Phantom => Device::Phantom,
            Storage::Cpu(_) => Device::Cpu,
            #[cfg(feature = "cuda")]
            Storage::Cuda(buf) => Device::Cuda(buf.ordinal()),
        }
    }

    /// Number of elements held, `None` for phantom storage.
    pub fn len(&self) -> Option<usize> {
        match self {
            Storage::Phantom => None,
            Storage::Cpu(buf) => Some(buf.len()),
            #[cfg(feature = "cuda")]
            Storage::Cuda(buf) => Some(buf.len()),
        }
    }
}

impl Tensor {
    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn device(&self) -> Device {
        self.storage.borrow().deref().device()
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_same_as(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.storage, &other.storage)
    }
}

/// Where in a convolution call a failure surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Plan,
    Workspace,
    Unfold,
    Multiply,
    BiasBroadcast,
    BiasReduce,
    Fold,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Stage::Plan => "plan",
            Stage::Workspace => "workspace",
            Stage::Unfold => "vol2row",
            Stage::Multiply => "gemm",
            Stage::BiasBroadcast => "bias gemm",
            Stage::BiasReduce => "bias gemv",
            Stage::Fold => "row2vol",
        })
    }
}

#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("dtype mismatch: expected {expected:?}, found {found:?}")]
    DtypeMismatch { expected: Dtype, found: Dtype },
    #[error("device mismatch: expected {expected:?}, found {found:?}")]
    DeviceMismatch { expected: Device, found: Device },
    #[error("`{0}` shares storage with an input tensor")]
    Aliased(&'static str),
    #[error("out of memory: {what} needs {requested} bytes on {device:?}")]
    OutOfMemory {
        device: Device,
        requested: usize,
        what: &'static str,
    },
    #[error("{stage} failed: {reason}")]
    Compute { stage: Stage, reason: String },
    #[error("{0:?} is not available in this build")]
    DeviceUnavailable(Device),
    /// A primitive failure not yet attributed to a [Stage].
    #[error("primitive failed: {0}")]
    Primitive(String),
}

impl Error {
    pub(crate) fn compute<R: Into<String>>(stage: Stage, reason: R) -> Self {
        Self::Compute {
            stage,
            reason: reason.into(),
        }
    }

    /// Attributes a raw device error to the stage it surfaced in.
    pub fn at(self, stage: Stage) -> Self {
        match self {
            Error::Primitive(reason) => Error::Compute { stage, reason },
            other => other,
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::Compute { stage, .. } => Some(*stage),
            Error::OutOfMemory { .. } => Some(Stage::Workspace),
            Error::ShapeMismatch(_)
            | Error::DtypeMismatch { .. }
            | Error::DeviceMismatch { .. }
            | Error::Aliased(_) => Some(Stage::Plan),
            _ => None,
        }
    }
}
