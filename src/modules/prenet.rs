//! Autoregressive prenet: bias-free linear layers with ReLU and dropout

use candle_core::{Result, Tensor};
use candle_nn::{Linear, Module, VarBuilder};
use rand_chacha::ChaCha8Rng;

use super::dropout::Dropout;

#[derive(Debug)]
pub struct Prenet {
    layers: Vec<Linear>,
    dropout: Dropout,
}

impl Prenet {
    pub fn new(in_dim: usize, dim: usize, n_layers: usize, p_dropout: f32, vb: VarBuilder) -> Result<Self> {
        let mut layers = Vec::with_capacity(n_layers);
        let mut width = in_dim;
        for i in 0..n_layers {
            layers.push(candle_nn::linear_no_bias(width, dim, vb.pp(format!("layers.{}", i)))?);
            width = dim;
        }
        Ok(Self {
            layers,
            dropout: Dropout::new(p_dropout),
        })
    }

    /// Dropout runs whenever `rng` is given.
    pub fn forward(&self, x: &Tensor, mut rng: Option<&mut ChaCha8Rng>) -> Result<Tensor> {
        let mut x = x.clone();
        for layer in &self.layers {
            x = layer.forward(&x)?.relu()?;
            if let Some(rng) = rng.as_deref_mut() {
                x = self.dropout.forward(&x, rng)?;
            }
        }
        Ok(x)
    }
}
