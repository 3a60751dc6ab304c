//! Autoregressive emission and transition network
//!
//! One step takes the previous frame and the conditioning vectors of a set of
//! HMM states and returns, for each of those states, the Gaussian emission
//! parameters and the transition logit. The likelihood pass, fed ground-truth frames,
//! calls it with every state at once; generation calls it with the current
//! state only.

use candle_core::Tensor;
use candle_nn::rnn::{LSTMConfig, LSTMState, LSTM, RNN};
use candle_nn::{Init, Linear, Module, VarBuilder};
use rand_chacha::ChaCha8Rng;

use crate::config::OverFlowConfig;
use crate::error::{OverFlowError, Result};
use crate::modules::logmath::softplus;
use crate::modules::Prenet;

/// Emission and transition parameters for a set of states at one time step
#[derive(Debug, Clone)]
pub struct EmissionStep {
    /// `(B, S, n_mel)`
    pub mean: Tensor,
    /// `(B, S, n_mel)`, already floored
    pub std: Tensor,
    /// `(B, S)`; `sigmoid` of it is the probability of advancing
    pub transition_logit: Tensor,
}

/// MLP over `[rnn output ; state conditioning]` with a Gaussian head
/// (`2·n_mel` outputs) and a transition head (one logit)
#[derive(Debug)]
struct ParameterNetwork {
    hidden: Vec<Linear>,
    output: Linear,
    transition: Linear,
}

impl ParameterNetwork {
    fn new(
        in_dim: usize,
        widths: &[usize],
        n_mel: usize,
        init_transition_probability: Option<f64>,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let mut hidden = Vec::with_capacity(widths.len());
        let mut width = in_dim;
        for (i, &w) in widths.iter().enumerate() {
            hidden.push(candle_nn::linear(width, w, vb.pp(format!("layers.{}", i)))?);
            width = w;
        }
        let output = candle_nn::linear(width, 2 * n_mel, vb.pp("output"))?;
        let transition = match init_transition_probability {
            // Flat start: every state advances with probability p until trained
            Some(p) => {
                let vb = vb.pp("transition");
                let weight = vb.get_with_hints((1, width), "weight", Init::Const(0.0))?;
                let bias = vb.get_with_hints(1, "bias", Init::Const((p / (1.0 - p)).ln()))?;
                Linear::new(weight, Some(bias))
            }
            None => candle_nn::linear(width, 1, vb.pp("transition"))?,
        };
        Ok(Self {
            hidden,
            output,
            transition,
        })
    }

    /// Returns `(gaussian parameters, transition logit)`
    fn forward(&self, x: &Tensor) -> candle_core::Result<(Tensor, Tensor)> {
        let mut x = x.clone();
        for layer in &self.hidden {
            x = layer.forward(&x)?.relu()?;
        }
        Ok((self.output.forward(&x)?, self.transition.forward(&x)?))
    }
}

#[derive(Debug)]
pub struct EmissionNetwork {
    expansion: Linear,
    prenet: Prenet,
    memory_rnn: LSTM,
    parameter_net: ParameterNetwork,
    go_token: Tensor,
    n_mel: usize,
    embedding_dim: usize,
    state_per_phone: usize,
    variance_floor: f64,
}

impl EmissionNetwork {
    pub fn new(config: &OverFlowConfig, vb: VarBuilder) -> Result<Self> {
        let n_mel = config.data.n_mel_channels;
        let dim = config.encoder.embedding_dim;
        let spp = config.encoder.state_per_phone;
        let hmm = &config.hmm;

        let expansion = candle_nn::linear(dim, dim * spp, vb.pp("state_expansion"))?;
        let prenet = Prenet::new(
            n_mel,
            config.prenet.dim,
            config.prenet.n_layers,
            config.prenet.dropout,
            vb.pp("prenet"),
        )?;
        let memory_rnn = candle_nn::rnn::lstm(
            config.prenet.dim,
            hmm.post_prenet_rnn_dim,
            LSTMConfig::default(),
            vb.pp("memory_rnn"),
        )?;
        let parameter_net = ParameterNetwork::new(
            hmm.post_prenet_rnn_dim + dim,
            &hmm.parameternetwork,
            n_mel,
            hmm.init_transition_probability,
            vb.pp("parameter_net"),
        )?;
        let go_value = hmm.go_token_init_value.unwrap_or(0.0);
        let go_token = if hmm.train_go {
            vb.get_with_hints((1, n_mel), "go_token", Init::Const(go_value))?
        } else {
            Tensor::full(go_value as f32, (1, n_mel), vb.device())?.to_dtype(vb.dtype())?
        };

        Ok(Self {
            expansion,
            prenet,
            memory_rnn,
            parameter_net,
            go_token,
            n_mel,
            embedding_dim: dim,
            state_per_phone: spp,
            variance_floor: hmm.variance_floor,
        })
    }

    pub fn n_mel(&self) -> usize {
        self.n_mel
    }

    /// `(B, D, N)` conditioning → `(B, N·spp, D)` per-state vectors
    pub fn expand_states(&self, conditioning: &Tensor) -> Result<Tensor> {
        let (b, d, n) = conditioning.dims3()?;
        if d != self.embedding_dim {
            return Err(OverFlowError::ShapeMismatch(format!(
                "conditioning has {} channels, expected {}",
                d, self.embedding_dim
            )));
        }
        let per_step = self.expansion.forward(&conditioning.transpose(1, 2)?.contiguous()?)?;
        Ok(per_step.reshape((b, n * self.state_per_phone, d))?)
    }

    /// Start token repeated over the batch, `(B, n_mel)`
    pub fn go_frame(&self, batch: usize) -> Result<Tensor> {
        Ok(self.go_token.broadcast_as((batch, self.n_mel))?.contiguous()?)
    }

    pub fn zero_state(&self, batch: usize) -> Result<LSTMState> {
        Ok(self.memory_rnn.zero_state(batch)?)
    }

    /// Advance the recurrent memory by one frame and produce parameters for
    /// every state in `states`.
    ///
    /// `previous`: `(B, n_mel)`, `states`: `(B, S, D)`. Prenet dropout runs
    /// when `rng` is given.
    pub fn step(
        &self,
        previous: &Tensor,
        memory: &LSTMState,
        states: &Tensor,
        rng: Option<&mut ChaCha8Rng>,
    ) -> Result<(EmissionStep, LSTMState)> {
        let (b, s, _) = states.dims3()?;
        let x = self.prenet.forward(previous, rng)?;
        let memory = self.memory_rnn.step(&x, memory)?;

        let h = memory.h();
        let h = h.unsqueeze(1)?.broadcast_as((b, s, h.dim(1)?))?;
        let input = Tensor::cat(&[&h, states], 2)?;
        let (params, logit) = self.parameter_net.forward(&input)?;

        let mean = params.narrow(2, 0, self.n_mel)?;
        let std = softplus(&params.narrow(2, self.n_mel, self.n_mel)?)?.maximum(self.variance_floor)?;
        let transition_logit = logit.squeeze(2)?;

        Ok((
            EmissionStep {
                mean,
                std,
                transition_logit,
            },
            memory,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn small_config() -> OverFlowConfig {
        let mut config = OverFlowConfig::default();
        config.data.n_mel_channels = 3;
        config.encoder.embedding_dim = 4;
        config.prenet.dim = 5;
        config.hmm.post_prenet_rnn_dim = 6;
        config.hmm.parameternetwork = vec![7];
        config
    }

    #[test]
    fn test_zero_weights_give_flat_parameters() {
        let dev = Device::Cpu;
        let config = small_config();
        let net = EmissionNetwork::new(&config, VarBuilder::zeros(DType::F32, &dev)).unwrap();

        let cond = Tensor::randn(0f32, 1.0, (2, 4, 3), &dev).unwrap();
        let states = net.expand_states(&cond).unwrap();
        assert_eq!(states.dims(), &[2, 6, 4]);

        let prev = net.go_frame(2).unwrap();
        let memory = net.zero_state(2).unwrap();
        let (step, _) = net.step(&prev, &memory, &states, None).unwrap();
        assert_eq!(step.mean.dims(), &[2, 6, 3]);
        assert_eq!(step.transition_logit.dims(), &[2, 6]);

        let std: Vec<f32> = step.std.flatten_all().unwrap().to_vec1().unwrap();
        assert!(std.iter().all(|&s| (s - std::f32::consts::LN_2).abs() < 1e-6));
        let logit: Vec<f32> = step.transition_logit.flatten_all().unwrap().to_vec1().unwrap();
        assert!(logit.iter().all(|&l| l == 0.0));
    }

    #[test]
    fn test_variance_floor_applies() {
        let dev = Device::Cpu;
        let mut config = small_config();
        config.hmm.variance_floor = 2.0;
        let net = EmissionNetwork::new(&config, VarBuilder::zeros(DType::F32, &dev)).unwrap();
        let states = Tensor::zeros((1, 2, 4), DType::F32, &dev).unwrap();
        let (step, _) = net
            .step(&net.go_frame(1).unwrap(), &net.zero_state(1).unwrap(), &states, None)
            .unwrap();
        let std: Vec<f32> = step.std.flatten_all().unwrap().to_vec1().unwrap();
        assert!(std.iter().all(|&s| s == 2.0));
    }

    #[test]
    fn test_data_property_initialisers() {
        let dev = Device::Cpu;
        let mut config = small_config();
        config.hmm.train_go = false;
        config.hmm.go_token_init_value = Some(0.5);
        config.hmm.init_transition_probability = Some(0.2);
        let varmap = candle_nn::VarMap::new();
        let net = EmissionNetwork::new(&config, VarBuilder::from_varmap(&varmap, DType::F32, &dev)).unwrap();

        let go: Vec<Vec<f32>> = net.go_frame(2).unwrap().to_vec2().unwrap();
        assert!(go.iter().flatten().all(|&v| v == 0.5));

        let states = net.expand_states(&Tensor::randn(0f32, 1.0, (1, 4, 2), &dev).unwrap()).unwrap();
        let (step, _) = net
            .step(&net.go_frame(1).unwrap(), &net.zero_state(1).unwrap(), &states, None)
            .unwrap();
        let logit: Vec<f32> = step.transition_logit.flatten_all().unwrap().to_vec1().unwrap();
        let expected = (0.2f32 / 0.8).ln();
        assert!(logit.iter().all(|&l| (l - expected).abs() < 1e-6));
    }

    #[test]
    fn test_wrong_conditioning_width() {
        let dev = Device::Cpu;
        let net = EmissionNetwork::new(&small_config(), VarBuilder::zeros(DType::F32, &dev)).unwrap();
        let cond = Tensor::zeros((1, 5, 2), DType::F32, &dev).unwrap();
        assert!(matches!(net.expand_states(&cond), Err(OverFlowError::ShapeMismatch(_))));
    }
}
