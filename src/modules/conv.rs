//! 1-D convolution used throughout the flow decoder

use candle_core::{Result, Tensor};
use candle_nn::{Init, VarBuilder};

/// Conv1d with "same" padding and optional dilation.
///
/// Checkpoints exported with weight normalisation store `weight_g` /
/// `weight_v` instead of `weight`; both layouts load.
#[derive(Debug, Clone)]
pub struct Conv1d {
    weight: Tensor,
    bias: Tensor,
    padding: usize,
    dilation: usize,
}

impl Conv1d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        dilation: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let shape = (out_channels, in_channels, kernel_size);
        let weight = if !vb.contains_tensor("weight") && vb.contains_tensor("weight_v") {
            let weight_v = vb.get(shape, "weight_v")?;
            let weight_g = vb.get((out_channels, 1, 1), "weight_g")?;
            weight_norm(&weight_v, &weight_g)?
        } else {
            vb.get_with_hints(shape, "weight", candle_nn::init::DEFAULT_KAIMING_NORMAL)?
        };
        let bias = vb.get_with_hints(out_channels, "bias", Init::Const(0.0))?;
        Ok(Self {
            weight,
            bias,
            padding: (kernel_size * dilation - dilation) / 2,
            dilation,
        })
    }

    /// 1×1 projection whose fresh parameters start at zero, so a new
    /// coupling layer begins as the identity.
    pub fn zeroed(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints((out_channels, in_channels, 1), "weight", Init::Const(0.0))?;
        let bias = vb.get_with_hints(out_channels, "bias", Init::Const(0.0))?;
        Ok(Self {
            weight,
            bias,
            padding: 0,
            dilation: 1,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = x.contiguous()?.conv1d(&self.weight, self.padding, 1, self.dilation, 1)?;
        let bias = self.bias.unsqueeze(0)?.unsqueeze(2)?;
        x.broadcast_add(&bias)
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }
}

/// `w = g · v / ||v||`, norm over everything but the output channel
fn weight_norm(weight_v: &Tensor, weight_g: &Tensor) -> Result<Tensor> {
    let norm = weight_v.sqr()?.sum_keepdim(2)?.sum_keepdim(1)?.sqrt()?;
    weight_v.broadcast_mul(&weight_g.broadcast_div(&norm)?)
}
