//! Neural HMM alignment model
//!
//! Left-to-right HMM whose emission and transition distributions are produced
//! by [`EmissionNetwork`]. Two passes share that network:
//!
//! - `forward`: exact marginal log-likelihood of a latent sequence over all
//!   monotonic alignments (ground-truth frames in, forward recursion)
//! - `sample`: free-running generation, one state at a time
//!
//! Every random draw (dropout masks, stochastic transitions, Gaussian noise)
//! comes from the model's own seeded RNG.

use candle_core::{DType, IndexOp, Tensor};
use candle_nn::VarBuilder;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use super::emission::EmissionNetwork;
use super::flow_decoder::check_lengths;
use super::forward_algorithm::ForwardTable;
use crate::config::{HmmConfig, OverFlowConfig, TerminationPolicy};
use crate::error::{OverFlowError, Result};
use crate::modules::logmath::{gaussian_log_prob, log_sigmoid};
use crate::modules::Dropout;

/// Result for one batch item of a likelihood pass
#[derive(Debug, Clone)]
pub enum LikelihoodOutcome {
    /// Rank-0 log-likelihood tensor
    Scored(Tensor),
    /// Too few frames to visit every state; never scored
    Infeasible {
        item: usize,
        required_states: usize,
        frames: usize,
    },
}

impl LikelihoodOutcome {
    pub fn value(&self) -> Option<&Tensor> {
        match self {
            Self::Scored(t) => Some(t),
            Self::Infeasible { .. } => None,
        }
    }
}

/// Per-item outcomes of [`AlignmentModel::forward`]
#[derive(Debug, Clone)]
pub struct Likelihoods {
    outcomes: Vec<LikelihoodOutcome>,
}

impl Likelihoods {
    pub fn outcomes(&self) -> &[LikelihoodOutcome] {
        &self.outcomes
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// `(B,)` tensor of every item's log-likelihood. Fails on the first
    /// infeasible item.
    pub fn total(&self) -> Result<Tensor> {
        let mut values = Vec::with_capacity(self.outcomes.len());
        for outcome in &self.outcomes {
            match outcome {
                LikelihoodOutcome::Scored(t) => values.push(t.unsqueeze(0)?),
                LikelihoodOutcome::Infeasible {
                    item,
                    required_states,
                    frames,
                } => {
                    return Err(OverFlowError::InfeasibleAlignment {
                        item: *item,
                        required_states: *required_states,
                        frames: *frames,
                    })
                }
            }
        }
        if values.is_empty() {
            return Err(OverFlowError::ShapeMismatch("empty batch".to_string()));
        }
        Ok(Tensor::cat(&values, 0)?)
    }
}

/// What the network saw at one generation step
#[derive(Debug, Clone)]
pub struct InputParameters {
    /// `(n_mel,)`
    pub previous_frame: Tensor,
    pub state: usize,
}

/// What the network produced at one generation step
#[derive(Debug, Clone)]
pub struct OutputParameters {
    /// `(n_mel,)`
    pub mean: Tensor,
    /// `(n_mel,)`, after temperature scaling
    pub std: Tensor,
    pub transition_probability: f64,
}

#[derive(Debug, Clone)]
pub struct SampleTrace {
    /// `(T, n_mel)`
    pub latent: Tensor,
    pub states: Vec<usize>,
    pub input_parameters: Vec<InputParameters>,
    pub output_parameters: Vec<OutputParameters>,
    pub num_states: usize,
}

impl SampleTrace {
    pub fn frames(&self) -> usize {
        self.states.len()
    }
}

#[derive(Debug, Clone)]
pub enum SampleOutcome {
    Completed(SampleTrace),
    /// Step budget exhausted before termination; carries the partial trace
    Truncated(SampleTrace),
}

impl SampleOutcome {
    pub fn trace(&self) -> &SampleTrace {
        match self {
            Self::Completed(t) | Self::Truncated(t) => t,
        }
    }

    pub fn into_trace(self) -> SampleTrace {
        match self {
            Self::Completed(t) | Self::Truncated(t) => t,
        }
    }

    pub fn is_truncated(&self) -> bool {
        matches!(self, Self::Truncated(_))
    }

    /// Completed trace, or `Truncated` as an error
    pub fn into_result(self) -> Result<SampleTrace> {
        match self {
            Self::Completed(t) => Ok(t),
            Self::Truncated(t) => Err(OverFlowError::Truncated {
                steps: t.frames(),
                state: t.states.last().copied().unwrap_or(0),
                num_states: t.num_states,
            }),
        }
    }
}

#[derive(Debug)]
pub struct AlignmentModel {
    emission: EmissionNetwork,
    config: HmmConfig,
    state_per_phone: usize,
    prenet_dropout_while_eval: bool,
    data_dropout: Dropout,
    training: bool,
    rng: ChaCha8Rng,
}

impl AlignmentModel {
    pub fn new(config: &OverFlowConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            emission: EmissionNetwork::new(config, vb)?,
            config: config.hmm.clone(),
            state_per_phone: config.encoder.state_per_phone,
            prenet_dropout_while_eval: config.prenet.dropout_while_eval,
            data_dropout: Dropout::new(config.hmm.data_dropout),
            training: false,
            rng: ChaCha8Rng::seed_from_u64(config.seed),
        })
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Restart the random stream; equal seeds give equal traces.
    pub fn reseed(&mut self, seed: u64) {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
    }

    pub fn emission(&self) -> &EmissionNetwork {
        &self.emission
    }

    fn prenet_dropout_active(&self) -> bool {
        self.training || self.prenet_dropout_while_eval
    }

    /// Exact log-likelihood of `latent` given `conditioning`, per item.
    ///
    /// `conditioning`: `(B, D, N)`, `latent`: `(B, n_mel, T)`.
    pub fn forward(
        &mut self,
        conditioning: &Tensor,
        cond_lengths: &[usize],
        latent: &Tensor,
        latent_lengths: &[usize],
    ) -> Result<Likelihoods> {
        let (b, _, n) = conditioning.dims3()?;
        let (zb, c, t) = latent.dims3()?;
        if zb != b {
            return Err(OverFlowError::ShapeMismatch(format!(
                "conditioning batch {} vs latent batch {}",
                b, zb
            )));
        }
        if c != self.emission.n_mel() {
            return Err(OverFlowError::ShapeMismatch(format!(
                "latent has {} channels, expected {}",
                c,
                self.emission.n_mel()
            )));
        }
        check_lengths(cond_lengths, b, n, "conditioning")?;
        check_lengths(latent_lengths, b, t, "latent")?;
        if let Some(item) = cond_lengths.iter().position(|&l| l == 0) {
            return Err(OverFlowError::ShapeMismatch(format!(
                "item {} has empty conditioning",
                item
            )));
        }
        let states = self.emission.expand_states(conditioning)?;

        let mut outcomes: Vec<Option<LikelihoodOutcome>> = cond_lengths
            .iter()
            .zip(latent_lengths)
            .enumerate()
            .map(|(item, (&cl, &zl))| {
                let required_states = cl * self.state_per_phone;
                (zl < required_states).then_some(LikelihoodOutcome::Infeasible {
                    item,
                    required_states,
                    frames: zl,
                })
            })
            .collect();

        if outcomes.iter().any(Option::is_none) {
            let table = self.forward_table(&states, latent)?;
            for (item, slot) in outcomes.iter_mut().enumerate() {
                if slot.is_some() {
                    continue;
                }
                let required_states = cond_lengths[item] * self.state_per_phone;
                let ll = table.log_likelihood(item, latent_lengths[item], required_states)?;
                let value = ll.to_dtype(DType::F64)?.to_scalar::<f64>()?;
                if !value.is_finite() {
                    return Err(OverFlowError::NumericalDegeneracy(format!(
                        "item {} log-likelihood is {}",
                        item, value
                    )));
                }
                *slot = Some(LikelihoodOutcome::Scored(ll));
            }
        }

        let outcomes = outcomes.into_iter().flatten().collect::<Vec<_>>();
        for outcome in &outcomes {
            if let LikelihoodOutcome::Infeasible {
                item,
                required_states,
                frames,
            } = outcome
            {
                log::warn!(
                    "item {}: {} frames cannot cover {} states, skipped",
                    item,
                    frames,
                    required_states
                );
            }
        }
        Ok(Likelihoods { outcomes })
    }

    /// Run the network on the ground-truth frames, then the forward recursion.
    fn forward_table(&mut self, states: &Tensor, latent: &Tensor) -> Result<ForwardTable> {
        let (b, _, t) = latent.dims3()?;
        let frames = latent.transpose(1, 2)?.contiguous()?;

        // Start token followed by frames 0..T-1
        let go = self.emission.go_frame(b)?.unsqueeze(1)?;
        let mut ar_inputs = if t > 1 {
            Tensor::cat(&[&go, &frames.narrow(1, 0, t - 1)?], 1)?
        } else {
            go
        };
        if self.training || self.config.data_dropout_while_eval {
            ar_inputs = self.data_dropout.forward(&ar_inputs, &mut self.rng)?;
        }

        let prenet_dropout = self.prenet_dropout_active();
        let mut memory = self.emission.zero_state(b)?;
        let mut emissions = Vec::with_capacity(t);
        let mut log_stay = Vec::with_capacity(t);
        let mut log_move = Vec::with_capacity(t);
        for step in 0..t {
            let previous = ar_inputs.narrow(1, step, 1)?.squeeze(1)?;
            let rng = prenet_dropout.then_some(&mut self.rng);
            let (params, next) = self.emission.step(&previous, &memory, states, rng)?;
            memory = next;

            let frame = frames.narrow(1, step, 1)?;
            emissions.push(gaussian_log_prob(&frame, &params.mean, &params.std)?);
            log_move.push(log_sigmoid(&params.transition_logit)?);
            log_stay.push(log_sigmoid(&params.transition_logit.neg()?)?);
        }

        let emissions = Tensor::stack(&emissions, 1)?;
        let log_stay = Tensor::stack(&log_stay, 1)?;
        let log_move = Tensor::stack(&log_move, 1)?;
        ForwardTable::compute(&emissions, &log_stay, &log_move)
    }

    /// Generate latent frames for one conditioning sequence `(1, D, N)`.
    ///
    /// `sampling_temp` scales the emission variance.
    pub fn sample(&mut self, conditioning: &Tensor, sampling_temp: f64) -> Result<SampleOutcome> {
        let (b, _, n) = conditioning.dims3()?;
        if b != 1 || n == 0 {
            return Err(OverFlowError::ShapeMismatch(format!(
                "sampling takes one non-empty sequence, got {:?}",
                conditioning.dims()
            )));
        }
        if !(sampling_temp >= 0.0) {
            return Err(OverFlowError::InvalidConfig(format!(
                "sampling temperature must be non-negative, got {}",
                sampling_temp
            )));
        }
        let states = self.emission.expand_states(conditioning)?;
        let num_states = states.dim(1)?;
        let final_state = num_states - 1;
        let temp_scale = sampling_temp.sqrt();
        let prenet_dropout = self.prenet_dropout_active();

        let mut previous = self.emission.go_frame(1)?;
        let mut memory = self.emission.zero_state(1)?;
        let mut state = 0usize;
        let mut survival = 1.0f64;

        let mut frames = Vec::new();
        let mut trace_states = Vec::new();
        let mut input_parameters = Vec::new();
        let mut output_parameters = Vec::new();
        let mut completed = false;

        for _ in 0..self.config.max_sampling_time {
            let input = if self.config.data_dropout_while_sampling {
                self.data_dropout.forward(&previous, &mut self.rng)?
            } else {
                previous.clone()
            };
            let current = states.narrow(1, state, 1)?;
            let rng = prenet_dropout.then_some(&mut self.rng);
            let (params, next) = self.emission.step(&input, &memory, &current, rng)?;
            memory = next;

            let mean = params.mean.flatten_all()?;
            let std = (params.std.flatten_all()? * temp_scale)?;
            let frame = if self.config.predict_means {
                mean.clone()
            } else {
                let noise: Vec<f32> = (0..mean.elem_count())
                    .map(|_| self.rng.sample::<f32, _>(StandardNormal))
                    .collect();
                let noise = Tensor::from_vec(noise, mean.dims(), mean.device())?.to_dtype(mean.dtype())?;
                (&mean + std.mul(&noise)?)?
            };

            let logit = params
                .transition_logit
                .i((0, 0))?
                .to_dtype(DType::F64)?
                .to_scalar::<f64>()?;
            let p = 1.0 / (1.0 + (-logit).exp());
            let advance = if self.config.deterministic_transition {
                survival *= 1.0 - p;
                let advance = 1.0 - survival > self.config.duration_quantile_threshold;
                if advance {
                    survival = 1.0;
                }
                advance
            } else {
                self.rng.gen::<f64>() < p
            };

            trace_states.push(state);
            input_parameters.push(InputParameters {
                previous_frame: previous.flatten_all()?,
                state,
            });
            output_parameters.push(OutputParameters {
                mean,
                std,
                transition_probability: p,
            });
            previous = frame.unsqueeze(0)?;
            frames.push(frame);

            if state == final_state {
                let done = match self.config.termination {
                    TerminationPolicy::ExitTransition => advance,
                    TerminationPolicy::FinalStateVisit => true,
                };
                if done {
                    completed = true;
                    break;
                }
            } else if advance {
                state += 1;
            }
        }

        let trace = SampleTrace {
            latent: Tensor::stack(&frames, 0)?,
            states: trace_states,
            input_parameters,
            output_parameters,
            num_states,
        };
        if completed {
            log::debug!("sampled {} frames over {} states", trace.frames(), num_states);
            Ok(SampleOutcome::Completed(trace))
        } else {
            log::warn!(
                "sampling stopped after {} steps in state {} of {}",
                trace.frames(),
                state,
                num_states
            );
            Ok(SampleOutcome::Truncated(trace))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn small_config() -> OverFlowConfig {
        let mut config = OverFlowConfig::default();
        config.data.n_mel_channels = 3;
        config.encoder.embedding_dim = 4;
        config.encoder.state_per_phone = 2;
        config.prenet.dim = 5;
        config.hmm.post_prenet_rnn_dim = 6;
        config.hmm.parameternetwork = vec![7];
        config.seed = 1234;
        config
    }

    fn zero_model(config: &OverFlowConfig) -> AlignmentModel {
        AlignmentModel::new(config, VarBuilder::zeros(DType::F32, &Device::Cpu)).unwrap()
    }

    fn random_model(config: &OverFlowConfig) -> (AlignmentModel, candle_nn::VarMap) {
        let varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        (AlignmentModel::new(config, vb).unwrap(), varmap)
    }

    #[test]
    fn test_zero_model_matches_closed_form() {
        // Zero weights: mean 0, std ln 2, every transition 0.5.
        let config = small_config();
        let mut model = zero_model(&config);
        let dev = Device::Cpu;
        let cond = Tensor::randn(0f32, 1.0, (1, 4, 1), &dev).unwrap();
        let latent = Tensor::randn(0f32, 1.0, (1, 3, 3), &dev).unwrap();

        let out = model.forward(&cond, &[1], &latent, &[3]).unwrap();
        let ll = out.total().unwrap().to_vec1::<f32>().unwrap()[0] as f64;

        let std = std::f64::consts::LN_2;
        let frames: Vec<f64> = latent.flatten_all().unwrap().to_dtype(DType::F64).unwrap().to_vec1().unwrap();
        let emission: f64 = frames
            .iter()
            .map(|x| -0.5 * (x / std).powi(2) - std.ln() - 0.5 * (2.0 * std::f64::consts::PI).ln())
            .sum();
        // Two states, three frames: two paths, each with two 0.5 transitions.
        let expected = emission + 2.0f64.ln() + 2.0 * 0.5f64.ln();
        assert!((ll - expected).abs() < 1e-4, "{} vs {}", ll, expected);
    }

    #[test]
    fn test_infeasible_items_are_reported_not_scored() {
        let config = small_config();
        let (mut model, _varmap) = random_model(&config);
        let dev = Device::Cpu;
        // 3 steps x 2 sub-states = 6 states for item 0, only 3 frames.
        let cond = Tensor::randn(0f32, 1.0, (2, 4, 3), &dev).unwrap();
        let latent = Tensor::randn(0f32, 1.0, (2, 3, 8), &dev).unwrap();
        let out = model.forward(&cond, &[3, 2], &latent, &[3, 8]).unwrap();

        assert!(matches!(
            out.outcomes()[0],
            LikelihoodOutcome::Infeasible { item: 0, required_states: 6, frames: 3 }
        ));
        let scored = out.outcomes()[1].value().unwrap().to_scalar::<f32>().unwrap();
        assert!(scored.is_finite());
        assert!(matches!(
            out.total(),
            Err(OverFlowError::InfeasibleAlignment { item: 0, .. })
        ));
    }

    #[test]
    fn test_five_states_three_frames_is_infeasible() {
        let mut config = small_config();
        config.encoder.state_per_phone = 1;
        let mut model = zero_model(&config);
        let dev = Device::Cpu;
        let cond = Tensor::zeros((1, 4, 5), DType::F32, &dev).unwrap();
        let latent = Tensor::zeros((1, 3, 3), DType::F32, &dev).unwrap();
        let out = model.forward(&cond, &[5], &latent, &[3]).unwrap();
        assert!(matches!(
            out.total(),
            Err(OverFlowError::InfeasibleAlignment { required_states: 5, frames: 3, .. })
        ));
    }

    #[test]
    fn test_shape_mismatches() {
        let config = small_config();
        let mut model = zero_model(&config);
        let dev = Device::Cpu;
        let cond = Tensor::zeros((1, 4, 2), DType::F32, &dev).unwrap();
        let latent = Tensor::zeros((1, 3, 6), DType::F32, &dev).unwrap();

        let wrong_dim = Tensor::zeros((1, 5, 2), DType::F32, &dev).unwrap();
        assert!(matches!(model.forward(&wrong_dim, &[2], &latent, &[6]), Err(OverFlowError::ShapeMismatch(_))));
        let wrong_mel = Tensor::zeros((1, 2, 6), DType::F32, &dev).unwrap();
        assert!(matches!(model.forward(&cond, &[2], &wrong_mel, &[6]), Err(OverFlowError::ShapeMismatch(_))));
        assert!(matches!(model.forward(&cond, &[3], &latent, &[6]), Err(OverFlowError::ShapeMismatch(_))));
        assert!(matches!(model.forward(&cond, &[2], &latent, &[6, 6]), Err(OverFlowError::ShapeMismatch(_))));
        let two = Tensor::zeros((2, 3, 6), DType::F32, &dev).unwrap();
        assert!(matches!(model.forward(&cond, &[2], &two, &[6]), Err(OverFlowError::ShapeMismatch(_))));
    }

    #[test]
    fn test_non_finite_latent_is_degenerate() {
        let config = small_config();
        let mut model = zero_model(&config);
        let dev = Device::Cpu;
        let cond = Tensor::zeros((1, 4, 1), DType::F32, &dev).unwrap();
        for bad in [f32::INFINITY, f32::NAN] {
            // Last frame is scored but never fed back as input.
            let latent = Tensor::new(&[[[0f32, 0.1, bad], [0.2, -0.1, 0.0], [0.0, 0.3, 0.5]]], &dev).unwrap();
            assert!(matches!(
                model.forward(&cond, &[1], &latent, &[3]),
                Err(OverFlowError::NumericalDegeneracy(_))
            ));
        }
    }

    #[test]
    fn test_exit_transition_termination() {
        let config = small_config();
        let mut model = zero_model(&config);
        let cond = Tensor::zeros((1, 4, 2), DType::F32, &Device::Cpu).unwrap();
        let outcome = model.sample(&cond, 1.0).unwrap();
        assert!(!outcome.is_truncated());
        let trace = outcome.into_result().unwrap();
        assert_eq!(trace.states, vec![0, 0, 1, 1, 2, 2, 3, 3]);
        assert_eq!(trace.latent.dims(), &[8, 3]);
        assert_eq!(trace.input_parameters.len(), 8);
        assert!(trace.output_parameters.iter().all(|o| (o.transition_probability - 0.5).abs() < 1e-12));
    }

    #[test]
    fn test_final_state_visit_termination() {
        let mut config = small_config();
        config.hmm.termination = TerminationPolicy::FinalStateVisit;
        let mut model = zero_model(&config);
        let cond = Tensor::zeros((1, 4, 2), DType::F32, &Device::Cpu).unwrap();
        let trace = model.sample(&cond, 1.0).unwrap().into_result().unwrap();
        assert_eq!(trace.states, vec![0, 0, 1, 1, 2, 2, 3]);
    }

    #[test]
    fn test_step_budget_truncates_with_partial_trace() {
        let mut config = small_config();
        config.hmm.max_sampling_time = 1;
        let mut model = zero_model(&config);
        let cond = Tensor::zeros((1, 4, 2), DType::F32, &Device::Cpu).unwrap();
        let outcome = model.sample(&cond, 1.0).unwrap();
        assert!(outcome.is_truncated());
        assert_eq!(outcome.trace().frames(), 1);
        assert!(matches!(
            outcome.into_result(),
            Err(OverFlowError::Truncated { steps: 1, state: 0, num_states: 4 })
        ));
    }

    #[test]
    fn test_sampling_is_deterministic_under_seed() {
        let mut config = small_config();
        config.hmm.predict_means = false;
        config.hmm.deterministic_transition = false;
        config.hmm.max_sampling_time = 50;
        let (mut model, _varmap) = random_model(&config);
        let cond = Tensor::randn(0f32, 1.0, (1, 4, 3), &Device::Cpu).unwrap();

        model.reseed(7);
        let a = model.sample(&cond, 0.667).unwrap().into_trace();
        model.reseed(7);
        let b = model.sample(&cond, 0.667).unwrap().into_trace();

        assert_eq!(a.states, b.states);
        let diff = (a.latent - b.latent).unwrap().abs().unwrap().flatten_all().unwrap().max(0).unwrap();
        assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn test_temperature_scales_deviation() {
        let config = small_config();
        let mut model = zero_model(&config);
        let cond = Tensor::zeros((1, 4, 1), DType::F32, &Device::Cpu).unwrap();
        let trace = model.sample(&cond, 0.25).unwrap().into_trace();
        let std: Vec<f32> = trace.output_parameters[0].std.to_vec1().unwrap();
        assert!(std.iter().all(|&s| (s - 0.5 * std::f32::consts::LN_2).abs() < 1e-6));
    }
}
