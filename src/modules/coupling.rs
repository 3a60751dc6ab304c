//! Affine coupling layer
//!
//! The first half of the channels passes through unchanged and drives a
//! WaveNet that predicts a shift `m` and log-scale `logs` for the second half.

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;
use rand_chacha::ChaCha8Rng;

use super::conv::Conv1d;
use super::wavenet::WaveNet;

#[derive(Debug, Clone, Copy)]
pub struct CouplingConfig {
    pub channels: usize,
    pub hidden_channels: usize,
    pub kernel_size: usize,
    pub dilation_rate: usize,
    pub n_layers: usize,
    pub gin_channels: usize,
    pub p_dropout: f32,
    pub sigmoid_scale: bool,
}

#[derive(Debug)]
pub struct CouplingBlock {
    start: Conv1d,
    wn: WaveNet,
    end: Conv1d,
    half: usize,
    sigmoid_scale: bool,
}

impl CouplingBlock {
    pub fn new(cfg: CouplingConfig, vb: VarBuilder) -> Result<Self> {
        let half = cfg.channels / 2;
        let start = Conv1d::new(half, cfg.hidden_channels, 1, 1, vb.pp("start"))?;
        let wn = WaveNet::new(
            cfg.hidden_channels,
            cfg.kernel_size,
            cfg.dilation_rate,
            cfg.n_layers,
            cfg.gin_channels,
            cfg.p_dropout,
            vb.pp("wn"),
        )?;
        // Fresh blocks start as the identity map
        let end = Conv1d::zeroed(cfg.hidden_channels, 2 * (cfg.channels - half), vb.pp("end"))?;
        Ok(Self {
            start,
            wn,
            end,
            half,
            sigmoid_scale: cfg.sigmoid_scale,
        })
    }

    fn shift_and_log_scale(
        &self,
        x0: &Tensor,
        mask: &Tensor,
        g: Option<&Tensor>,
        rng: Option<&mut ChaCha8Rng>,
    ) -> Result<(Tensor, Tensor)> {
        let h = self.start.forward(x0)?.broadcast_mul(mask)?;
        let h = self.wn.forward(&h, mask, g, rng)?;
        let out = self.end.forward(&h)?;
        let width = out.dim(1)? / 2;
        let m = out.narrow(1, 0, width)?;
        let mut logs = out.narrow(1, width, width)?;
        if self.sigmoid_scale {
            logs = (candle_nn::ops::sigmoid(&(logs + 2.0)?)? + 1e-6)?.log()?;
        }
        Ok((m, logs))
    }

    /// Returns the transformed tensor and `Σ logs · mask` per item.
    pub fn forward(
        &self,
        x: &Tensor,
        mask: &Tensor,
        g: Option<&Tensor>,
        rng: Option<&mut ChaCha8Rng>,
    ) -> Result<(Tensor, Tensor)> {
        let c = x.dim(1)?;
        let x0 = x.narrow(1, 0, self.half)?;
        let x1 = x.narrow(1, self.half, c - self.half)?;
        let (m, logs) = self.shift_and_log_scale(&x0, mask, g, rng)?;

        let z1 = (m + logs.exp()?.mul(&x1)?)?.broadcast_mul(mask)?;
        let z = Tensor::cat(&[&x0, &z1], 1)?;
        let logdet = logs.broadcast_mul(mask)?.sum(2)?.sum(1)?;
        Ok((z, logdet))
    }

    pub fn reverse(&self, z: &Tensor, mask: &Tensor, g: Option<&Tensor>) -> Result<Tensor> {
        let c = z.dim(1)?;
        let z0 = z.narrow(1, 0, self.half)?;
        let z1 = z.narrow(1, self.half, c - self.half)?;
        let (m, logs) = self.shift_and_log_scale(&z0, mask, g, None)?;

        let x1 = (z1 - m)?.mul(&logs.neg()?.exp()?)?.broadcast_mul(mask)?;
        Tensor::cat(&[&z0, &x1], 1)
    }
}
