use std::ops::DerefMut;

use crate::tensor::*;

impl Tensor {
    pub fn fill_with_zeros(&mut self) -> Result<(), Error> {
        self.fill_storage_with_zeros()
    }

    /// Zeroes the shared storage in place; every clone of this tensor observes it.
    pub(crate) fn fill_storage_with_zeros(&self) -> Result<(), Error> {
        let mut storage = self
            .storage
            .try_borrow_mut()
            .map_err(|_| Error::Aliased("tensor"))?;
        match storage.deref_mut() {
            Storage::Phantom => (),
            Storage::Cpu(CpuStorage::Float32(buf)) => buf.fill(0.0),
            Storage::Cpu(CpuStorage::Float64(buf)) => buf.fill(0.0),
            #[cfg(feature = "cuda")]
            Storage::Cuda(CudaStorage::Float32(buf)) => buf.device().memset_zeros(buf)?,
            #[cfg(feature = "cuda")]
            Storage::Cuda(CudaStorage::Float64(buf)) => buf.device().memset_zeros(buf)?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{init::*, tensor::*};

    #[test]
    fn test_fill_with_zeros_is_seen_by_clones() -> Result<(), Error> {
        let _device = with_device(Device::Cpu);
        let mut x = full([3], 2.0f32)?;
        let y = x.clone();
        x.fill_with_zeros()?;
        assert_eq!(y.into_vec::<f32>()?, vec![0.0; 3]);
        Ok(())
    }
}
