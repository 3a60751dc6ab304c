//! Spectrogram standardisation

use candle_core::{DType, Device, Tensor};

use crate::error::{OverFlowError, Result};

/// `(x - mean) / std` and its exact inverse. `mean` and `std` broadcast
/// against the tensors they are applied to.
#[derive(Debug, Clone)]
pub struct Normaliser {
    mean: Tensor,
    std: Tensor,
}

impl Normaliser {
    pub fn new(mean: Tensor, std: Tensor) -> Result<Self> {
        let min_std = std.flatten_all()?.min(0)?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        if !(min_std > 0.0) {
            return Err(OverFlowError::InvalidConfig(format!(
                "normalisation std must be positive, got {}",
                min_std
            )));
        }
        Ok(Self { mean, std })
    }

    /// Single global mean and standard deviation, stored as `dtype`
    pub fn scalar(mean: f64, std: f64, dtype: DType, device: &Device) -> Result<Self> {
        Self::new(
            Tensor::new(mean, device)?.to_dtype(dtype)?,
            Tensor::new(std, device)?.to_dtype(dtype)?,
        )
    }

    pub fn normalise(&self, x: &Tensor) -> Result<Tensor> {
        Ok(x.broadcast_sub(&self.mean)?.broadcast_div(&self.std)?)
    }

    pub fn inverse_normalise(&self, x: &Tensor) -> Result<Tensor> {
        Ok(x.broadcast_mul(&self.std)?.broadcast_add(&self.mean)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inverse_normalise_undoes_normalise() {
        let dev = Device::Cpu;
        let norm = Normaliser::scalar(-4.5, 2.25, DType::F32, &dev).unwrap();
        let x = Tensor::randn(0f32, 3.0, (2, 5, 7), &dev).unwrap();
        let back = norm.inverse_normalise(&norm.normalise(&x).unwrap()).unwrap();
        let err = (back - &x).unwrap().abs().unwrap().flatten_all().unwrap().max(0).unwrap();
        assert!(err.to_scalar::<f32>().unwrap() < 1e-5);
    }

    #[test]
    fn test_per_channel_statistics() {
        let dev = Device::Cpu;
        let mean = Tensor::new(&[[[1f32], [-1.0]]], &dev).unwrap();
        let std = Tensor::new(&[[[2f32], [0.5]]], &dev).unwrap();
        let norm = Normaliser::new(mean, std).unwrap();
        let x = Tensor::new(&[[[3f32, 5.0], [-1.0, 0.0]]], &dev).unwrap();
        let y: Vec<Vec<f32>> = norm.normalise(&x).unwrap().squeeze(0).unwrap().to_vec2().unwrap();
        assert_eq!(y, vec![vec![1.0, 2.0], vec![0.0, 2.0]]);
    }

    #[test]
    fn test_rejects_non_positive_std() {
        assert!(Normaliser::scalar(0.0, 0.0, DType::F32, &Device::Cpu).is_err());
    }
}
