//! Activation normalisation: a per-channel affine map with learned log-scale

use candle_core::{Result, Tensor};
use candle_nn::{Init, VarBuilder};

#[derive(Debug)]
pub struct ActNorm {
    logs: Tensor,
    bias: Tensor,
}

impl ActNorm {
    pub fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let logs = vb.get_with_hints((1, channels, 1), "logs", Init::Const(0.0))?;
        let bias = vb.get_with_hints((1, channels, 1), "bias", Init::Const(0.0))?;
        Ok(Self { logs, bias })
    }

    /// Returns the transformed tensor and `Σ logs · len` per item.
    pub fn forward(&self, x: &Tensor, mask: &Tensor, x_len: &Tensor) -> Result<(Tensor, Tensor)> {
        let y = x
            .broadcast_mul(&self.logs.exp()?)?
            .broadcast_add(&self.bias)?
            .broadcast_mul(mask)?;
        let logdet = x_len.broadcast_mul(&self.logs.sum_all()?)?;
        Ok((y, logdet))
    }

    pub fn reverse(&self, y: &Tensor, mask: &Tensor) -> Result<Tensor> {
        y.broadcast_sub(&self.bias)?
            .broadcast_mul(&self.logs.neg()?.exp()?)?
            .broadcast_mul(mask)
    }
}
