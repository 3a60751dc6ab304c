//! Dropout with host-drawn masks
//!
//! Masks come from a caller-owned RNG so that every stochastic pass, including
//! dropout kept active during sampling, is reproducible from a seed.

use candle_core::{Result, Tensor};
use rand::Rng;
use rand_distr::{Bernoulli, Distribution};

#[derive(Debug, Clone, Copy)]
pub struct Dropout {
    p: f32,
}

impl Dropout {
    pub fn new(p: f32) -> Self {
        Self { p }
    }

    /// Zero each element with probability `p` and rescale survivors by
    /// `1 / (1 - p)`.
    pub fn forward<R: Rng + ?Sized>(&self, x: &Tensor, rng: &mut R) -> Result<Tensor> {
        if self.p <= 0.0 {
            return Ok(x.clone());
        }
        let keep = Bernoulli::new(1.0 - self.p as f64)
            .map_err(|e| candle_core::Error::Msg(format!("invalid dropout rate {}: {}", self.p, e)))?;
        let scale = 1.0 / (1.0 - self.p);
        let mask: Vec<f32> = (0..x.elem_count())
            .map(|_| if keep.sample(rng) { scale } else { 0.0 })
            .collect();
        let mask = Tensor::from_vec(mask, x.dims(), x.device())?.to_dtype(x.dtype())?;
        x.mul(&mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_dropout_is_seed_reproducible() {
        let x = Tensor::ones((4, 64), candle_core::DType::F32, &Device::Cpu).unwrap();
        let drop = Dropout::new(0.5);

        let a: Vec<Vec<f32>> = drop.forward(&x, &mut ChaCha8Rng::seed_from_u64(3)).unwrap().to_vec2().unwrap();
        let b: Vec<Vec<f32>> = drop.forward(&x, &mut ChaCha8Rng::seed_from_u64(3)).unwrap().to_vec2().unwrap();
        assert_eq!(a, b);

        let values: Vec<f32> = a.into_iter().flatten().collect();
        assert!(values.iter().all(|&v| v == 0.0 || (v - 2.0).abs() < 1e-6));
        assert!(values.iter().any(|&v| v == 0.0));
        assert!(values.iter().any(|&v| v > 0.0));
    }

    #[test]
    fn test_zero_rate_is_identity() {
        let x = Tensor::new(&[1.0f32, -2.0, 3.0], &Device::Cpu).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let y: Vec<f32> = Dropout::new(0.0).forward(&x, &mut rng).unwrap().to_vec1().unwrap();
        assert_eq!(y, vec![1.0, -2.0, 3.0]);
    }
}
