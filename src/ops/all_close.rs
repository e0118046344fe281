use crate::tensor::*;

impl Tensor {
    /// Whether `|self - other| <= atol + rtol * |other|` holds elementwise.
    pub fn all_close(
        &self,
        other: &Tensor,
        rtol: f64,
        atol: f64,
        nans_equal: bool,
    ) -> Result<bool, Error> {
        if self.shape() != other.shape() {
            return Err(Error::ShapeMismatch(format!(
                "cannot compare {:?} with {:?}",
                self.shape(),
                other.shape()
            )));
        }
        let a = self.to_f64_vec()?;
        let b = other.to_f64_vec()?;
        Ok(a.iter().zip(b.iter()).all(|(&a, &b)| {
            if a.is_nan() || b.is_nan() {
                nans_equal && a.is_nan() && b.is_nan()
            } else {
                (a - b).abs() <= atol + rtol * b.abs()
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use crate::{init::*, tensor::*};

    #[test]
    fn test_all_close() -> Result<(), Error> {
        let _device = with_device(Device::Cpu);
        let a = copy_slice(&[1.0f32, f32::NAN], [2])?;
        let b = copy_slice(&[1.0001f32, f32::NAN], [2])?;
        assert!(a.all_close(&b, 1e-3, 0.0, true)?);
        assert!(!a.all_close(&b, 1e-3, 0.0, false)?);
        assert!(!a.all_close(&b, 1e-6, 0.0, true)?);
        Ok(())
    }
}
