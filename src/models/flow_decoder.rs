//! Flow decoder
//!
//! A stack of invertible blocks mapping spectrogram frames to a latent space
//! with tractable log-determinant:
//!
//! ```text
//! squeeze(n_sqz) → [ActNorm → InvConvNear → Coupling] × n_blocks → unsqueeze
//! ```
//!
//! `forward` goes spectrogram → latent and accumulates the log-determinant per
//! item. `reverse` runs the blocks backwards, using each mixing layer's cached
//! inverse when one has been stored.

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use rand_chacha::ChaCha8Rng;

use crate::config::OverFlowConfig;
use crate::error::{OverFlowError, Result};
use crate::modules::{ActNorm, CouplingBlock, CouplingConfig, InvConvNear};

/// One ActNorm / channel mixing / coupling triple
#[derive(Debug)]
pub struct FlowBlock {
    actnorm: ActNorm,
    invconv: InvConvNear,
    coupling: CouplingBlock,
}

impl FlowBlock {
    fn new(channels: usize, n_split: usize, coupling: CouplingConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            actnorm: ActNorm::new(channels, vb.pp("actnorm"))?,
            invconv: InvConvNear::new(channels, n_split, vb.pp("invconv"))?,
            coupling: CouplingBlock::new(coupling, vb.pp("coupling"))?,
        })
    }

    pub fn invconv(&self) -> &InvConvNear {
        &self.invconv
    }

    fn forward(
        &self,
        x: &Tensor,
        mask: &Tensor,
        x_len: &Tensor,
        g: Option<&Tensor>,
        rng: Option<&mut ChaCha8Rng>,
    ) -> Result<(Tensor, Tensor)> {
        let (x, ld_norm) = self.actnorm.forward(x, mask, x_len)?;
        let (x, ld_mix) = self.invconv.forward(&x, mask, x_len)?;
        let (x, ld_coupling) = self.coupling.forward(&x, mask, g, rng)?;
        let logdet = ((ld_norm + ld_mix)? + ld_coupling)?;
        Ok((x, logdet))
    }

    fn reverse(&self, z: &Tensor, mask: &Tensor, g: Option<&Tensor>, index: usize) -> Result<(Tensor, Option<u64>)> {
        let z = self.coupling.reverse(z, mask, g)?;
        let (z, used) = self.invconv.reverse(&z, mask, index)?;
        let z = self.actnorm.reverse(&z, mask)?;
        Ok((z, used))
    }
}

/// Result of a spectrogram → latent pass
#[derive(Debug, Clone)]
pub struct FlowOutput {
    /// `(B, C, T')` with `T'` trimmed to a multiple of `n_sqz`
    pub latent: Tensor,
    pub lengths: Vec<usize>,
    /// Per-item log-determinant, `(B,)`
    pub logdet: Tensor,
    /// Per-block contributions to `logdet`, in block order
    pub block_logdets: Vec<Tensor>,
}

/// Result of a latent → spectrogram pass
#[derive(Debug, Clone)]
pub struct ReverseOutput {
    pub spectrogram: Tensor,
    pub lengths: Vec<usize>,
    /// Cache generation used by every mixing layer, `None` when at least one
    /// inverse was computed on demand
    pub inverse_generation: Option<u64>,
}

#[derive(Debug)]
pub struct FlowDecoder {
    blocks: Vec<FlowBlock>,
    n_mel_channels: usize,
    n_sqz: usize,
    inverse_generation: u64,
}

impl FlowDecoder {
    pub fn new(config: &OverFlowConfig, vb: VarBuilder) -> Result<Self> {
        let dec = &config.decoder;
        let channels = config.flow_channels();
        let coupling = CouplingConfig {
            channels,
            hidden_channels: dec.flow_hidden_channels,
            kernel_size: dec.kernel_size_dec,
            dilation_rate: dec.dilation_rate,
            n_layers: dec.n_block_layers,
            gin_channels: dec.gin_channels,
            p_dropout: dec.p_dropout_dec,
            sigmoid_scale: dec.sigmoid_scale,
        };
        let mut blocks = Vec::with_capacity(dec.n_blocks_dec);
        for i in 0..dec.n_blocks_dec {
            blocks.push(FlowBlock::new(
                channels,
                dec.n_split,
                coupling,
                vb.pp(format!("blocks.{}", i)),
            )?);
        }
        Ok(Self {
            blocks,
            n_mel_channels: config.data.n_mel_channels,
            n_sqz: dec.n_sqz,
            inverse_generation: 0,
        })
    }

    pub fn blocks(&self) -> &[FlowBlock] {
        &self.blocks
    }

    /// Decoder-level cache generation, bumped by `store_inverse`
    pub fn inverse_generation(&self) -> u64 {
        self.inverse_generation
    }

    /// Spectrogram → latent without dropout.
    pub fn forward(&self, x: &Tensor, lengths: &[usize], g: Option<&Tensor>) -> Result<FlowOutput> {
        self.run_forward(x, lengths, g, None)
    }

    /// Spectrogram → latent with coupling dropout drawn from `rng`.
    pub fn forward_train(
        &self,
        x: &Tensor,
        lengths: &[usize],
        g: Option<&Tensor>,
        rng: &mut ChaCha8Rng,
    ) -> Result<FlowOutput> {
        self.run_forward(x, lengths, g, Some(rng))
    }

    fn run_forward(
        &self,
        x: &Tensor,
        lengths: &[usize],
        g: Option<&Tensor>,
        mut rng: Option<&mut ChaCha8Rng>,
    ) -> Result<FlowOutput> {
        let (x, lengths) = self.trim(x, lengths)?;
        let mask = sequence_mask(&lengths, x.dim(2)?, x.dtype(), x.device())?;
        let (mut x, mask) = squeeze(&x.broadcast_mul(&mask)?, &mask, self.n_sqz)?;
        let x_len = squeezed_lengths(&lengths, self.n_sqz, x.dtype(), x.device())?;

        let mut logdet = Tensor::zeros(lengths.len(), x.dtype(), x.device())?;
        let mut block_logdets = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            let (y, ld) = block.forward(&x, &mask, &x_len, g, rng.as_deref_mut())?;
            x = y;
            logdet = (logdet + &ld)?;
            block_logdets.push(ld);
        }

        let (latent, _) = unsqueeze(&x, &mask, self.n_sqz)?;
        Ok(FlowOutput {
            latent,
            lengths,
            logdet,
            block_logdets,
        })
    }

    /// Latent → spectrogram.
    pub fn reverse(&self, z: &Tensor, lengths: &[usize], g: Option<&Tensor>) -> Result<ReverseOutput> {
        let (z, lengths) = self.trim(z, lengths)?;
        if z.dim(2)? == 0 {
            return Err(OverFlowError::ShapeMismatch(format!(
                "latent shorter than the squeeze factor {}",
                self.n_sqz
            )));
        }
        let mask = sequence_mask(&lengths, z.dim(2)?, z.dtype(), z.device())?;
        let (mut z, mask) = squeeze(&z.broadcast_mul(&mask)?, &mask, self.n_sqz)?;

        let mut all_cached = true;
        for (index, block) in self.blocks.iter().enumerate().rev() {
            let (x, used) = block.reverse(&z, &mask, g, index)?;
            z = x;
            all_cached &= used.is_some();
        }

        let (spectrogram, _) = unsqueeze(&z, &mask, self.n_sqz)?;
        Ok(ReverseOutput {
            spectrogram,
            lengths,
            inverse_generation: all_cached.then_some(self.inverse_generation),
        })
    }

    /// Rebuild every mixing layer's inverse from its current weight.
    pub fn store_inverse(&mut self) -> Result<u64> {
        for block in self.blocks.iter_mut() {
            block.invconv.store_inverse()?;
        }
        self.inverse_generation += 1;
        log::debug!(
            "stored flow inverses for {} blocks (generation {})",
            self.blocks.len(),
            self.inverse_generation
        );
        Ok(self.inverse_generation)
    }

    pub fn invalidate_inverse(&mut self) {
        for block in self.blocks.iter_mut() {
            block.invconv.invalidate_inverse();
        }
    }

    /// Replace the mixing matrix of one block. Its stored inverse turns stale.
    pub fn set_mixing_weight(&mut self, block: usize, weight: Tensor) -> Result<()> {
        let n = self.blocks.len();
        let target = self.blocks.get_mut(block).ok_or_else(|| {
            OverFlowError::ShapeMismatch(format!("flow block {} out of range ({} blocks)", block, n))
        })?;
        target.invconv.set_weight(weight)
    }

    fn trim(&self, x: &Tensor, lengths: &[usize]) -> Result<(Tensor, Vec<usize>)> {
        let (b, c, t) = x.dims3()?;
        if c != self.n_mel_channels {
            return Err(OverFlowError::ShapeMismatch(format!(
                "flow decoder expects {} channels, got {}",
                self.n_mel_channels, c
            )));
        }
        check_lengths(lengths, b, t, "spectrogram")?;
        let t = t - t % self.n_sqz;
        let x = x.narrow(2, 0, t)?;
        let lengths = lengths.iter().map(|&l| l - l % self.n_sqz).collect();
        Ok((x, lengths))
    }
}

/// Reject length vectors that disagree with the batch or exceed the time axis
pub(crate) fn check_lengths(lengths: &[usize], batch: usize, max_len: usize, what: &str) -> Result<()> {
    if lengths.len() != batch {
        return Err(OverFlowError::ShapeMismatch(format!(
            "{} batch has {} items but {} lengths",
            what,
            batch,
            lengths.len()
        )));
    }
    if let Some((item, &len)) = lengths.iter().enumerate().find(|&(_, &l)| l > max_len) {
        return Err(OverFlowError::ShapeMismatch(format!(
            "{} item {} has length {} beyond the tensor extent {}",
            what, item, len, max_len
        )));
    }
    Ok(())
}

/// `(B, 1, T)` mask of `dtype`, one where `t < length`
pub fn sequence_mask(lengths: &[usize], max_len: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let data: Vec<f32> = lengths
        .iter()
        .flat_map(|&len| (0..max_len).map(move |t| if t < len { 1.0 } else { 0.0 }))
        .collect();
    Ok(Tensor::from_vec(data, (lengths.len(), 1, max_len), device)?.to_dtype(dtype)?)
}

fn squeezed_lengths(lengths: &[usize], n_sqz: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let data: Vec<f32> = lengths.iter().map(|&l| (l / n_sqz) as f32).collect();
    Ok(Tensor::from_vec(data, lengths.len(), device)?.to_dtype(dtype)?)
}

/// `(B, C, T) → (B, C·n, T/n)`; the mask keeps every n-th step.
///
/// `T` must already be a multiple of `n`.
pub fn squeeze(x: &Tensor, mask: &Tensor, n: usize) -> Result<(Tensor, Tensor)> {
    if n == 1 {
        return Ok((x.clone(), mask.clone()));
    }
    let (b, c, t) = x.dims3()?;
    let steps = t / n;
    let x = x
        .reshape((b, c, steps, n))?
        .permute((0, 3, 1, 2))?
        .contiguous()?
        .reshape((b, c * n, steps))?;
    let mask = mask
        .reshape((b, 1, steps, n))?
        .narrow(3, n - 1, 1)?
        .squeeze(3)?
        .contiguous()?;
    let x = x.broadcast_mul(&mask)?;
    Ok((x, mask))
}

/// Inverse of [`squeeze`]
pub fn unsqueeze(x: &Tensor, mask: &Tensor, n: usize) -> Result<(Tensor, Tensor)> {
    if n == 1 {
        return Ok((x.clone(), mask.clone()));
    }
    let (b, c, steps) = x.dims3()?;
    let x = x
        .reshape((b, n, c / n, steps))?
        .permute((0, 2, 3, 1))?
        .contiguous()?
        .reshape((b, c / n, steps * n))?;
    let mask = mask
        .unsqueeze(3)?
        .repeat((1, 1, 1, n))?
        .reshape((b, 1, steps * n))?;
    let x = x.broadcast_mul(&mask)?;
    Ok((x, mask))
}
