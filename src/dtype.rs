use std::fmt::{Debug, Display};

use num_traits::Float;

use crate::tensor::CpuStorage;

#[non_exhaustive]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dtype {
    Float32,
    Float64,
}

impl Dtype {
    pub fn short_name(&self) -> &str {
        match self {
            Dtype::Float32 => "f32",
            Dtype::Float64 => "f64",
        }
    }

    pub fn cuda_type_name(&self) -> &str {
        match self {
            Dtype::Float32 => "float",
            Dtype::Float64 => "double",
        }
    }

    pub fn num_bytes(&self) -> usize {
        match self {
            Dtype::Float32 => 4,
            Dtype::Float64 => 8,
        }
    }

    pub fn zero(&self) -> Scalar {
        match self {
            Dtype::Float32 => Scalar::Float32(0.0),
            Dtype::Float64 => Scalar::Float64(0.0),
        }
    }

    pub fn one(&self) -> Scalar {
        match self {
            Dtype::Float32 => Scalar::Float32(1.0),
            Dtype::Float64 => Scalar::Float64(1.0),
        }
    }
}

#[non_exhaustive]
#[derive(Clone, Copy, PartialEq, PartialOrd)]
pub enum Scalar {
    Float32(f32),
    Float64(f64),
}

impl Debug for Scalar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Float32(arg0) => f.write_str(&arg0.to_string()),
            Self::Float64(arg0) => f.write_str(&arg0.to_string()),
        }
    }
}

impl Scalar {
    #[inline]
    pub fn dtype(&self) -> Dtype {
        match self {
            Scalar::Float32(_) => Dtype::Float32,
            Scalar::Float64(_) => Dtype::Float64,
        }
    }

    /// Rounds to the requested precision. Scale factors handed to the kernels go through
    /// here so they always match the tensor's element type.
    #[inline]
    pub fn to_dtype(self, dtype: Dtype) -> Self {
        match (self, dtype) {
            (Scalar::Float32(a), Dtype::Float64) => Scalar::Float64(a as f64),
            (Scalar::Float64(a), Dtype::Float32) => Scalar::Float32(a as f32),
            _ => self,
        }
    }

    #[inline(always)]
    pub fn as_f32(&self) -> f32 {
        match self {
            Self::Float32(a) => *a,
            _ => unreachable!(),
        }
    }

    #[inline(always)]
    pub fn as_f64(&self) -> f64 {
        match self {
            Self::Float64(a) => *a,
            _ => unreachable!(),
        }
    }
}

macro_rules! scalar_from {
    ($src:ty, $dst:tt) => {
        impl From<$src> for Scalar {
            #[inline(always)]
            fn from(value: $src) -> Self {
                Scalar::$dst(value)
            }
        }
    };
}

scalar_from!(f32, Float32);
scalar_from!(f64, Float64);

#[cfg(feature = "cuda")]
pub trait DeviceElement:
    cudarc::driver::DeviceRepr + cudarc::driver::ValidAsZeroBits + Unpin
{
}

#[cfg(feature = "cuda")]
impl<T: cudarc::driver::DeviceRepr + cudarc::driver::ValidAsZeroBits + Unpin> DeviceElement
    for T
{
}

#[cfg(not(feature = "cuda"))]
pub trait DeviceElement {}

#[cfg(not(feature = "cuda"))]
impl<T> DeviceElement for T {}

/// Element types the convolution kernels are instantiated for.
pub trait Element:
    Float + Default + Debug + Display + Into<Scalar> + DeviceElement + 'static
{
    const DTYPE: Dtype;

    fn from_scalar(value: Scalar) -> Self;

    fn host(storage: &CpuStorage) -> Option<&Vec<Self>>;

    fn host_mut(storage: &mut CpuStorage) -> Option<&mut Vec<Self>>;

    fn into_host(buf: Vec<Self>) -> CpuStorage;

    #[cfg(feature = "cuda")]
    fn device(storage: &crate::tensor::CudaStorage) -> Option<&cudarc::driver::CudaSlice<Self>>;

    #[cfg(feature = "cuda")]
    fn device_mut(
        storage: &mut crate::tensor::CudaStorage,
    ) -> Option<&mut cudarc::driver::CudaSlice<Self>>;

    #[cfg(feature = "cuda")]
    fn into_device(buf: cudarc::driver::CudaSlice<Self>) -> crate::tensor::CudaStorage;
}

macro_rules! element {
    ($ty:ty, $variant:tt, $as:ident) => {
        impl Element for $ty {
            const DTYPE: Dtype = Dtype::$variant;

            #[inline(always)]
            fn from_scalar(value: Scalar) -> Self {
                value.to_dtype(Self::DTYPE).$as()
            }

            fn host(storage: &CpuStorage) -> Option<&Vec<Self>> {
                match storage {
                    CpuStorage::$variant(buf) => Some(buf),
                    _ => None,
                }
            }

            fn host_mut(storage: &mut CpuStorage) -> Option<&mut Vec<Self>> {
                match storage {
                    CpuStorage::$variant(buf) => Some(buf),
                    _ => None,
                }
            }

            fn into_host(buf: Vec<Self>) -> CpuStorage {
                CpuStorage::$variant(buf)
            }

            #[cfg(feature = "cuda")]
            fn device(
                storage: &crate::tensor::CudaStorage,
            ) -> Option<&cudarc::driver::CudaSlice<Self>> {
                match storage {
                    crate::tensor::CudaStorage::$variant(buf) => Some(buf),
                    _ => None,
                }
            }

            #[cfg(feature = "cuda")]
            fn device_mut(
                storage: &mut crate::tensor::CudaStorage,
            ) -> Option<&mut cudarc::driver::CudaSlice<Self>> {
                match storage {
                    crate::tensor::CudaStorage::$variant(buf) => Some(buf),
                    _ => None,
                }
            }

            #[cfg(feature = "cuda")]
            fn into_device(buf: cudarc::driver::CudaSlice<Self>) -> crate::tensor::CudaStorage {
                crate::tensor::CudaStorage::$variant(buf)
            }
        }
    };
}

element!(f32, Float32, as_f32);
element!(f64, Float64, as_f64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_factors_round_to_element_type() {
        let x = Scalar::from(0.1f64);
        assert_eq!(x.to_dtype(Dtype::Float32), Scalar::Float32(0.1f32));
        assert_eq!(f32::from_scalar(x), 0.1f32);
        assert_eq!(f64::from_scalar(Scalar::from(2.0f32)), 2.0);
        assert_eq!(Dtype::Float64.one().as_f64(), 1.0);
    }
}
