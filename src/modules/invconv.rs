//! Invertible channel mixing over `n_split` channel groups
//!
//! The channel axis is cut into `n_split` groups (half taken from each
//! coupling half) and every time step is multiplied by one small square
//! matrix `W`. `log|det W|` and `W⁻¹` are computed on the host.
//!
//! The inverse is cached explicitly: `store_inverse` builds it and records the
//! parameter generation and a snapshot of `W`. Reverse passes refuse a cache
//! whose generation or snapshot no longer matches the live weight.

use candle_core::{Result as CandleResult, Tensor};
use candle_nn::{Init, VarBuilder};

use super::linalg::HostMatrix;
use crate::error::{OverFlowError, Result};

/// Inverse of a mixing matrix plus the state it was built from
#[derive(Debug, Clone)]
pub struct InverseCache {
    inverse: Tensor,
    snapshot: HostMatrix,
    generation: u64,
}

#[derive(Debug)]
pub struct InvConvNear {
    weight: Tensor,
    channels: usize,
    n_split: usize,
    generation: u64,
    cache: Option<InverseCache>,
}

impl InvConvNear {
    pub fn new(channels: usize, n_split: usize, vb: VarBuilder) -> CandleResult<Self> {
        // A Gaussian draw is invertible with probability one; loaded
        // checkpoints ignore the hint.
        let weight = vb.get_with_hints(
            (n_split, n_split),
            "weight",
            Init::Randn {
                mean: 0.0,
                stdev: 1.0,
            },
        )?;
        Ok(Self {
            weight,
            channels,
            n_split,
            generation: 0,
            cache: None,
        })
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Parameter generation, bumped by every `set_weight`
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Replace the mixing matrix. Any stored inverse becomes stale.
    pub fn set_weight(&mut self, weight: Tensor) -> Result<()> {
        if weight.dims() != [self.n_split, self.n_split] {
            return Err(OverFlowError::ShapeMismatch(format!(
                "mixing weight must be {}x{}, got {:?}",
                self.n_split,
                self.n_split,
                weight.dims()
            )));
        }
        self.weight = weight.to_dtype(self.weight.dtype())?;
        self.generation += 1;
        Ok(())
    }

    /// Rebuild the cached inverse from the current weight.
    pub fn store_inverse(&mut self) -> Result<()> {
        let snapshot = HostMatrix::from_tensor(&self.weight)?;
        let inverse = snapshot
            .inverse()?
            .to_tensor(self.weight.dtype(), self.weight.device())?;
        self.cache = Some(InverseCache {
            inverse,
            snapshot,
            generation: self.generation,
        });
        Ok(())
    }

    pub fn invalidate_inverse(&mut self) {
        self.cache = None;
    }

    /// `log|det W|` scaled by the group width and the valid length per item.
    pub fn log_det(&self, x_len: &Tensor) -> Result<Tensor> {
        let w = HostMatrix::from_tensor(&self.weight)?;
        let per_step = w.log_abs_det()? * (self.channels / self.n_split) as f64;
        Ok(x_len.affine(per_step, 0.0)?)
    }

    pub fn forward(&self, x: &Tensor, mask: &Tensor, x_len: &Tensor) -> Result<(Tensor, Tensor)> {
        let logdet = self.log_det(x_len)?;
        let z = self.mix(x, &self.weight, mask)?;
        Ok((z, logdet))
    }

    /// Inverse mixing. Returns the cache generation used, or `None` when the
    /// inverse was computed on demand.
    pub fn reverse(&self, z: &Tensor, mask: &Tensor, block: usize) -> Result<(Tensor, Option<u64>)> {
        let (inverse, used) = self.inverse_weight(block)?;
        Ok((self.mix(z, &inverse, mask)?, used))
    }

    fn inverse_weight(&self, block: usize) -> Result<(Tensor, Option<u64>)> {
        match &self.cache {
            Some(cache) => {
                if cache.generation != self.generation {
                    return Err(OverFlowError::StaleInverseCache {
                        block,
                        cached: cache.generation,
                        current: self.generation,
                    });
                }
                // Catches in-place updates that bypassed `set_weight`
                let live = HostMatrix::from_tensor(&self.weight)?;
                if live.max_abs_diff(&cache.snapshot) > 0.0 {
                    return Err(OverFlowError::StaleInverseCache {
                        block,
                        cached: cache.generation,
                        current: self.generation,
                    });
                }
                Ok((cache.inverse.clone(), Some(cache.generation)))
            }
            None => {
                let inverse = HostMatrix::from_tensor(&self.weight)?
                    .inverse()?
                    .to_tensor(self.weight.dtype(), self.weight.device())?;
                Ok((inverse, None))
            }
        }
    }

    fn mix(&self, x: &Tensor, weight: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let (b, c, t) = x.dims3()?;
        if c != self.channels {
            return Err(OverFlowError::ShapeMismatch(format!(
                "mixing layer expects {} channels, got {}",
                self.channels, c
            )));
        }
        let n = self.n_split;
        let group = c / n;

        // [b, c, t] -> [b, 2, group, n/2, t] -> [b, 2, n/2, group, t] -> [b, n, group * t]
        let x = x
            .reshape((b, 2, group, n / 2, t))?
            .permute((0, 1, 3, 2, 4))?
            .contiguous()?
            .reshape((b, n, group * t))?;

        let z = weight.broadcast_matmul(&x)?;

        let z = z
            .reshape((b, 2, n / 2, group, t))?
            .permute((0, 1, 3, 2, 4))?
            .contiguous()?
            .reshape((b, c, t))?;
        Ok(z.broadcast_mul(mask)?)
    }
}
