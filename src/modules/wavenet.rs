//! WaveNet-style stack used inside each coupling layer
//!
//! Dilated convolutions with gated tanh/sigmoid activations and residual/skip
//! projections. Optional global conditioning `g` is added to every layer's
//! pre-activation.

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;
use rand_chacha::ChaCha8Rng;

use super::conv::Conv1d;
use super::dropout::Dropout;

#[derive(Debug)]
struct WaveNetLayer {
    in_conv: Conv1d,
    res_skip_conv: Conv1d,
    is_last: bool,
}

#[derive(Debug)]
pub struct WaveNet {
    layers: Vec<WaveNetLayer>,
    cond_layer: Option<Conv1d>,
    hidden_channels: usize,
    dropout: Dropout,
}

impl WaveNet {
    pub fn new(
        hidden_channels: usize,
        kernel_size: usize,
        dilation_rate: usize,
        n_layers: usize,
        gin_channels: usize,
        p_dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        let cond_layer = if gin_channels > 0 {
            Some(Conv1d::new(
                gin_channels,
                2 * hidden_channels * n_layers,
                1,
                1,
                vb.pp("cond_layer"),
            )?)
        } else {
            None
        };

        let mut layers = Vec::with_capacity(n_layers);
        for i in 0..n_layers {
            let dilation = dilation_rate.pow(i as u32);
            let in_conv = Conv1d::new(
                hidden_channels,
                2 * hidden_channels,
                kernel_size,
                dilation,
                vb.pp(format!("in_layers.{}", i)),
            )?;
            // The last layer only feeds the skip path
            let is_last = i + 1 == n_layers;
            let res_skip_channels = if is_last { hidden_channels } else { 2 * hidden_channels };
            let res_skip_conv = Conv1d::new(
                hidden_channels,
                res_skip_channels,
                1,
                1,
                vb.pp(format!("res_skip_layers.{}", i)),
            )?;
            layers.push(WaveNetLayer {
                in_conv,
                res_skip_conv,
                is_last,
            });
        }

        Ok(Self {
            layers,
            cond_layer,
            hidden_channels,
            dropout: Dropout::new(p_dropout),
        })
    }

    /// `x`: [batch, hidden, time], `mask`: [batch, 1, time],
    /// `g`: optional [batch, gin, 1]. Dropout is applied only when `rng` is set.
    pub fn forward(
        &self,
        x: &Tensor,
        mask: &Tensor,
        g: Option<&Tensor>,
        mut rng: Option<&mut ChaCha8Rng>,
    ) -> Result<Tensor> {
        let h = self.hidden_channels;
        let g = match (&self.cond_layer, g) {
            (Some(cond), Some(g)) => Some(cond.forward(g)?),
            _ => None,
        };

        let mut x = x.clone();
        let mut output = x.zeros_like()?;
        for (i, layer) in self.layers.iter().enumerate() {
            let mut x_in = layer.in_conv.forward(&x)?;
            if let Some(rng) = rng.as_deref_mut() {
                x_in = self.dropout.forward(&x_in, rng)?;
            }
            if let Some(g) = &g {
                let g_l = g.narrow(1, i * 2 * h, 2 * h)?;
                x_in = x_in.broadcast_add(&g_l)?;
            }

            let acts = fused_tanh_sigmoid(&x_in, h)?;
            let res_skip = layer.res_skip_conv.forward(&acts)?;

            if layer.is_last {
                output = (output + res_skip)?;
            } else {
                let res = res_skip.narrow(1, 0, h)?;
                let skip = res_skip.narrow(1, h, h)?;
                x = (x + res)?.broadcast_mul(mask)?;
                output = (output + skip)?;
            }
        }
        output.broadcast_mul(mask)
    }
}

/// `tanh(a[:h]) * sigmoid(a[h:])` across the channel axis
fn fused_tanh_sigmoid(a: &Tensor, h: usize) -> Result<Tensor> {
    let t = a.narrow(1, 0, h)?.tanh()?;
    let s = candle_nn::ops::sigmoid(&a.narrow(1, h, h)?)?;
    t * s
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use rand::SeedableRng;

    fn build(gin: usize) -> WaveNet {
        let dev = Device::Cpu;
        let varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        WaveNet::new(8, 3, 2, 3, gin, 0.1, vb).unwrap()
    }

    #[test]
    fn test_output_is_masked() {
        let dev = Device::Cpu;
        let wn = build(0);
        let x = Tensor::randn(0f32, 1.0, (1, 8, 6), &dev).unwrap();
        let mask = Tensor::new(&[[[1f32, 1.0, 1.0, 1.0, 0.0, 0.0]]], &dev).unwrap();
        let y = wn.forward(&x, &mask, None, None).unwrap();
        assert_eq!(y.dims(), &[1, 8, 6]);
        let tail: Vec<f32> = y.narrow(2, 4, 2).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(tail.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_conditioning_and_dropout_paths() {
        let dev = Device::Cpu;
        let wn = build(3);
        let x = Tensor::randn(0f32, 1.0, (2, 8, 5), &dev).unwrap();
        let mask = Tensor::ones((2, 1, 5), DType::F32, &dev).unwrap();
        let g = Tensor::randn(0f32, 1.0, (2, 3, 1), &dev).unwrap();

        let mut rng_a = ChaCha8Rng::seed_from_u64(11);
        let mut rng_b = ChaCha8Rng::seed_from_u64(11);
        let a = wn.forward(&x, &mask, Some(&g), Some(&mut rng_a)).unwrap();
        let b = wn.forward(&x, &mask, Some(&g), Some(&mut rng_b)).unwrap();
        let diff = (a - b).unwrap().abs().unwrap().flatten_all().unwrap().max(0).unwrap();
        assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);
    }
}
