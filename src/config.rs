//! Model configuration
//!
//! One immutable structure handed to every constructor. Defaults follow the
//! reference OverFlow hyper-parameters (80-band mel, 2 states per phone,
//! 12 flow blocks).

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{OverFlowError, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverFlowConfig {
    pub data: DataConfig,
    pub encoder: EncoderConfig,
    pub prenet: PrenetConfig,
    pub hmm: HmmConfig,
    pub decoder: FlowDecoderConfig,
    /// Seed for every random draw (dropout masks, sampling)
    pub seed: u64,
}

/// Spectrogram and input feature dimensions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub n_mel_channels: usize,
    pub n_features: usize,
    /// Size of the symbol table; `None` builds a feature-only model
    pub n_symbols: Option<usize>,
    /// Normalisation statistics; `None` disables denormalisation on output
    pub data_mean: Option<f64>,
    pub data_std: Option<f64>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            n_mel_channels: 80,
            n_features: 17,
            n_symbols: None,
            data_mean: None,
            data_std: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Width of each conditioning vector
    pub embedding_dim: usize,
    /// HMM sub-states per conditioning step
    pub state_per_phone: usize,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 512,
            state_per_phone: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrenetConfig {
    pub n_layers: usize,
    pub dim: usize,
    pub dropout: f32,
    /// Keep prenet dropout active outside training (also during sampling)
    pub dropout_while_eval: bool,
}

impl Default for PrenetConfig {
    fn default() -> Self {
        Self {
            n_layers: 2,
            dim: 256,
            dropout: 0.5,
            dropout_while_eval: true,
        }
    }
}

/// When generation counts as finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationPolicy {
    /// The final state has to take an advancing transition
    #[default]
    ExitTransition,
    /// Stop once the final state has emitted a single frame
    FinalStateVisit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HmmConfig {
    /// Learn the autoregressive start token (fixed otherwise)
    pub train_go: bool,
    /// Start token value; usually the mean of the normalised training frames
    pub go_token_init_value: Option<f64>,
    /// Flat-start probability of advancing, applied to fresh transition weights
    pub init_transition_probability: Option<f64>,
    /// Lower bound on the emission standard deviation
    pub variance_floor: f64,
    pub data_dropout: f32,
    pub data_dropout_while_eval: bool,
    pub data_dropout_while_sampling: bool,
    /// Emit the predicted mean instead of drawing from the emission
    pub predict_means: bool,
    /// Step budget for generation
    pub max_sampling_time: usize,
    pub deterministic_transition: bool,
    pub duration_quantile_threshold: f64,
    pub termination: TerminationPolicy,
    pub post_prenet_rnn_dim: usize,
    /// Hidden widths of the parameter network
    pub parameternetwork: Vec<usize>,
}

impl Default for HmmConfig {
    fn default() -> Self {
        Self {
            train_go: true,
            go_token_init_value: None,
            init_transition_probability: None,
            variance_floor: 0.001,
            data_dropout: 0.0,
            data_dropout_while_eval: true,
            data_dropout_while_sampling: false,
            predict_means: true,
            max_sampling_time: 1000,
            deterministic_transition: true,
            duration_quantile_threshold: 0.5,
            termination: TerminationPolicy::ExitTransition,
            post_prenet_rnn_dim: 1024,
            parameternetwork: vec![1024],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowDecoderConfig {
    pub flow_hidden_channels: usize,
    pub kernel_size_dec: usize,
    pub dilation_rate: usize,
    pub n_blocks_dec: usize,
    pub n_block_layers: usize,
    pub p_dropout_dec: f32,
    pub n_split: usize,
    pub n_sqz: usize,
    pub sigmoid_scale: bool,
    pub gin_channels: usize,
}

impl Default for FlowDecoderConfig {
    fn default() -> Self {
        Self {
            flow_hidden_channels: 150,
            kernel_size_dec: 5,
            dilation_rate: 1,
            n_blocks_dec: 12,
            n_block_layers: 4,
            p_dropout_dec: 0.05,
            n_split: 4,
            n_sqz: 2,
            sigmoid_scale: false,
            gin_channels: 0,
        }
    }
}

impl OverFlowConfig {
    /// Read a JSON configuration; missing fields take their defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate().map_err(OverFlowError::InvalidConfig)?;
        Ok(config)
    }

    /// Total HMM states for a conditioning sequence of `steps` entries
    pub fn num_states(&self, steps: usize) -> usize {
        steps * self.encoder.state_per_phone
    }

    /// Channel count seen by the flow blocks after squeezing
    pub fn flow_channels(&self) -> usize {
        self.data.n_mel_channels * self.decoder.n_sqz
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.data.n_mel_channels == 0 {
            return Err("n_mel_channels must be positive".to_string());
        }
        if self.data.n_features == 0 {
            return Err("n_features must be positive".to_string());
        }
        if let Some(std) = self.data.data_std {
            if !(std > 0.0) {
                return Err(format!("data_std must be positive, got {}", std));
            }
        }
        if self.data.n_symbols == Some(0) {
            return Err("n_symbols must be positive when given".to_string());
        }
        if self.data.data_mean.is_some() != self.data.data_std.is_some() {
            return Err("data_mean and data_std must be given together".to_string());
        }
        if self.encoder.embedding_dim == 0 || self.encoder.state_per_phone == 0 {
            return Err("encoder dimensions must be positive".to_string());
        }
        if self.prenet.n_layers == 0 || self.prenet.dim == 0 {
            return Err("prenet needs at least one non-empty layer".to_string());
        }
        check_probability("prenet.dropout", self.prenet.dropout)?;
        check_probability("hmm.data_dropout", self.hmm.data_dropout)?;
        check_probability("decoder.p_dropout_dec", self.decoder.p_dropout_dec)?;
        if !(self.hmm.variance_floor > 0.0) {
            return Err(format!(
                "variance_floor must be positive, got {}",
                self.hmm.variance_floor
            ));
        }
        if let Some(p) = self.hmm.init_transition_probability {
            if !(p > 0.0 && p < 1.0) {
                return Err(format!("init_transition_probability must be in (0, 1), got {}", p));
            }
        }
        if let Some(v) = self.hmm.go_token_init_value {
            if !v.is_finite() {
                return Err(format!("go_token_init_value must be finite, got {}", v));
            }
        }
        if self.hmm.max_sampling_time == 0 {
            return Err("max_sampling_time must be at least 1".to_string());
        }
        if !(0.0..1.0).contains(&self.hmm.duration_quantile_threshold) {
            return Err(format!(
                "duration_quantile_threshold must be in [0, 1), got {}",
                self.hmm.duration_quantile_threshold
            ));
        }
        if self.hmm.post_prenet_rnn_dim == 0 || self.hmm.parameternetwork.iter().any(|&w| w == 0) {
            return Err("HMM network widths must be positive".to_string());
        }

        let dec = &self.decoder;
        if dec.n_blocks_dec == 0 || dec.n_block_layers == 0 || dec.flow_hidden_channels == 0 {
            return Err("flow decoder needs blocks, layers and hidden channels".to_string());
        }
        if dec.kernel_size_dec % 2 == 0 {
            return Err(format!("kernel_size_dec must be odd, got {}", dec.kernel_size_dec));
        }
        if dec.dilation_rate == 0 || dec.n_sqz == 0 {
            return Err("dilation_rate and n_sqz must be positive".to_string());
        }
        if dec.n_split < 2 || dec.n_split % 2 != 0 {
            return Err(format!("n_split must be even and >= 2, got {}", dec.n_split));
        }
        let channels = self.flow_channels();
        if channels % dec.n_split != 0 {
            return Err(format!(
                "squeezed channel count {} is not divisible by n_split {}",
                channels, dec.n_split
            ));
        }
        if channels % 2 != 0 {
            return Err(format!("squeezed channel count {} must be even for coupling", channels));
        }
        Ok(())
    }
}

fn check_probability(name: &str, p: f32) -> std::result::Result<(), String> {
    if (0.0..1.0).contains(&p) {
        Ok(())
    } else {
        Err(format!("{} must be in [0, 1), got {}", name, p))
    }
}
