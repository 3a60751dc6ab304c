//! Sequence encoder contract
//!
//! The encoder turns embedded input features `(B, D, N)` into the
//! conditioning sequence consumed by the alignment model. Its architecture
//! lives outside this crate; anything implementing [`SequenceEncoder`] can be
//! plugged into [`crate::models::OverFlow`].

use candle_core::Tensor;

use crate::error::{OverFlowError, Result};

pub trait SequenceEncoder {
    /// `x`: `(B, D_in, N)` with per-item valid lengths. Returns the
    /// conditioning `(B, output_dim, N')` and its lengths.
    fn encode(&self, x: &Tensor, lengths: &[usize]) -> Result<(Tensor, Vec<usize>)>;

    /// Channel count of the produced conditioning
    fn output_dim(&self) -> usize;
}

/// Hands pre-encoded conditioning through unchanged
#[derive(Debug, Clone, Copy)]
pub struct PassthroughEncoder {
    dim: usize,
}

impl PassthroughEncoder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl SequenceEncoder for PassthroughEncoder {
    fn encode(&self, x: &Tensor, lengths: &[usize]) -> Result<(Tensor, Vec<usize>)> {
        let (_, d, _) = x.dims3()?;
        if d != self.dim {
            return Err(OverFlowError::ShapeMismatch(format!(
                "passthrough encoder expects {} channels, got {}",
                self.dim, d
            )));
        }
        Ok((x.clone(), lengths.to_vec()))
    }

    fn output_dim(&self) -> usize {
        self.dim
    }
}
