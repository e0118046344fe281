use crate::{
    init::{build_tensor, upload, zeros_on},
    tensor::*,
};

impl Tensor {
    /// Copies the tensor onto `device`. Phantom tensors hold no values and arrive as zeros.
    pub fn to_device(self, device: Device) -> Result<Self, Error> {
        if self.device() == device {
            return Ok(self);
        }
        if self.device() == Device::Phantom {
            return zeros_on(self.shape, self.dtype, device);
        }
        let storage = match device {
            Device::Phantom => Storage::Phantom,
            _ => match self.dtype {
                Dtype::Float32 => upload(device, self.clone().into_vec::<f32>()?)?,
                Dtype::Float64 => upload(device, self.clone().into_vec::<f64>()?)?,
            },
        };
        Ok(build_tensor(self.dtype, self.shape, storage))
    }
}

#[cfg(test)]
mod tests {
    use crate::{init::*, tensor::*};

    #[test]
    fn test_phantom_round_trip_keeps_shape() -> Result<(), Error> {
        let _device = with_device(Device::Cpu);
        let x = copy_slice(&[1.0f64, 2.0, 3.0, 4.0], [2, 2])?;
        let ghost = x.to_device(Device::Phantom)?;
        assert_eq!(ghost.device(), Device::Phantom);
        assert_eq!(ghost.shape(), &[2, 2]);
        let back = ghost.to_device(Device::Cpu)?;
        assert_eq!(back.into_vec::<f64>()?, vec![0.0; 4]);
        Ok(())
    }
}
