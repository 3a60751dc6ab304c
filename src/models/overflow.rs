//! Complete OverFlow acoustic model
//!
//! Wires the input embeddings, an external sequence encoder, the neural HMM
//! and the flow decoder into the training objective and the generation path.
//! Inputs are either frame-level features (through a linear embedding) or
//! symbol ids (through an optional lookup table).
//!
//! Training: `input → embedding → encoder → HMM log-likelihood of the flow
//! latent`, normalised by the number of input steps plus frames.
//! Generation: `input → embedding → encoder → HMM sample → flow reverse →
//! inverse normalisation`.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{Embedding, Linear, Module, VarBuilder};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use super::flow_decoder::FlowDecoder;
use super::hmm::{AlignmentModel, Likelihoods, SampleOutcome};
use crate::config::OverFlowConfig;
use crate::encoder::SequenceEncoder;
use crate::error::{OverFlowError, Result};
use crate::normaliser::Normaliser;

/// Training objective for one batch
#[derive(Debug, Clone)]
pub struct TrainingLoss {
    /// `-(Σ log-likelihood + Σ logdet) / (Σ input steps + Σ frames)`, rank 0
    pub loss: Tensor,
    pub log_likelihood_per_frame: f64,
    /// `(B,)` HMM log-likelihood of each item's latent
    pub log_likelihoods: Tensor,
    /// `(B,)` flow log-determinant
    pub logdet: Tensor,
}

/// One generated utterance
#[derive(Debug, Clone)]
pub struct Synthesis {
    /// `(T, n_mel)`, denormalised when statistics are configured. Empty when
    /// the trace is shorter than the flow squeeze factor.
    pub spectrogram: Tensor,
    /// HMM trace; `Truncated` when the step budget ran out
    pub outcome: SampleOutcome,
    pub inverse_generation: Option<u64>,
}

impl Synthesis {
    pub fn is_truncated(&self) -> bool {
        self.outcome.is_truncated()
    }
}

/// A single conditioning sequence for generation
#[derive(Debug, Clone)]
pub enum InputSequence {
    /// `(N, n_features)` frame-level features
    Features(Tensor),
    /// `(N,)` integer symbol ids
    Symbols(Tensor),
}

pub struct OverFlow<E: SequenceEncoder> {
    feat_embedding: Linear,
    symbol_embedding: Option<Embedding>,
    encoder: E,
    hmm: AlignmentModel,
    decoder: FlowDecoder,
    normaliser: Option<Normaliser>,
    config: OverFlowConfig,
    training: bool,
    rng: ChaCha8Rng,
    device: Device,
}

impl<E: SequenceEncoder> OverFlow<E> {
    pub fn new(config: OverFlowConfig, encoder: E, vb: VarBuilder) -> Result<Self> {
        config.validate().map_err(OverFlowError::InvalidConfig)?;
        if encoder.output_dim() != config.encoder.embedding_dim {
            return Err(OverFlowError::InvalidConfig(format!(
                "encoder produces {} channels, HMM expects {}",
                encoder.output_dim(),
                config.encoder.embedding_dim
            )));
        }
        let device = vb.device().clone();
        let feat_embedding = candle_nn::linear(
            config.data.n_features,
            config.encoder.embedding_dim,
            vb.pp("feat_embedding"),
        )?;
        let symbol_embedding = match config.data.n_symbols {
            Some(n) => Some(candle_nn::embedding(
                n,
                config.encoder.embedding_dim,
                vb.pp("embedding"),
            )?),
            None => None,
        };
        let hmm = AlignmentModel::new(&config, vb.pp("hmm"))?;
        let decoder = FlowDecoder::new(&config, vb.pp("decoder"))?;
        let normaliser = match (config.data.data_mean, config.data.data_std) {
            (Some(mean), Some(std)) => Some(Normaliser::scalar(mean, std, vb.dtype(), &device)?),
            _ => None,
        };
        Ok(Self {
            feat_embedding,
            symbol_embedding,
            encoder,
            hmm,
            decoder,
            normaliser,
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            config,
            training: false,
            device,
        })
    }

    /// Load from a directory holding `config.json` and `model.safetensors`.
    ///
    /// The model comes back in evaluation mode with its flow inverses stored.
    pub fn load<P: AsRef<Path>>(model_dir: P, encoder: E, device: &Device) -> Result<Self> {
        let config = OverFlowConfig::from_file(model_dir.as_ref().join("config.json"))?;
        Self::load_with_config(model_dir, config, encoder, device)
    }

    /// [`load`](Self::load) with an already parsed configuration
    pub fn load_with_config<P: AsRef<Path>>(
        model_dir: P,
        config: OverFlowConfig,
        encoder: E,
        device: &Device,
    ) -> Result<Self> {
        let model_dir = model_dir.as_ref();
        let model_path = model_dir.join("model.safetensors");
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[&model_path], DType::F32, device)
                .map_err(|e| OverFlowError::ModelLoadFailed(e.to_string()))?
        };
        let mut model = Self::new(config, encoder, vb)
            .map_err(|e| OverFlowError::ModelLoadFailed(format!("OverFlow: {}", e)))?;
        model.eval()?;
        log::info!("loaded OverFlow model from {}", model_dir.display());
        Ok(model)
    }

    pub fn config(&self) -> &OverFlowConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn hmm(&self) -> &AlignmentModel {
        &self.hmm
    }

    pub fn decoder(&self) -> &FlowDecoder {
        &self.decoder
    }

    pub fn decoder_mut(&mut self) -> &mut FlowDecoder {
        &mut self.decoder
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Training mode: dropout everywhere, flow inverses dropped since the
    /// parameters are about to change.
    pub fn train(&mut self) {
        self.training = true;
        self.hmm.set_training(true);
        self.decoder.invalidate_inverse();
    }

    /// Evaluation mode with freshly stored flow inverses.
    pub fn eval(&mut self) -> Result<u64> {
        self.training = false;
        self.hmm.set_training(false);
        self.store_inverse()
    }

    pub fn store_inverse(&mut self) -> Result<u64> {
        self.decoder.store_inverse()
    }

    /// Restart every random stream owned by the model.
    pub fn reseed(&mut self, seed: u64) {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
        self.hmm.reseed(seed);
    }

    /// `(B, F, N)` features → `(B, D, N)` embeddings
    fn embed_features(&self, features: &Tensor) -> Result<Tensor> {
        let (_, f, _) = features.dims3()?;
        if f != self.config.data.n_features {
            return Err(OverFlowError::ShapeMismatch(format!(
                "features have {} channels, expected {}",
                f, self.config.data.n_features
            )));
        }
        let x = self.feat_embedding.forward(&features.transpose(1, 2)?.contiguous()?)?;
        Ok(x.transpose(1, 2)?.contiguous()?)
    }

    /// `(B, N)` symbol ids → `(B, D, N)` embeddings
    fn embed_symbols(&self, symbols: &Tensor) -> Result<Tensor> {
        let (table, n_symbols) = match (&self.symbol_embedding, self.config.data.n_symbols) {
            (Some(table), Some(n)) => (table, n),
            _ => {
                return Err(OverFlowError::InvalidConfig(
                    "model has no symbol table (data.n_symbols is unset)".to_string(),
                ))
            }
        };
        symbols.dims2()?;
        if !matches!(symbols.dtype(), DType::U8 | DType::U32 | DType::I64) {
            return Err(OverFlowError::ShapeMismatch(format!(
                "symbol ids must be integers, got {:?}",
                symbols.dtype()
            )));
        }
        let ids = symbols.to_dtype(DType::U32)?;
        let largest = ids.flatten_all()?.to_vec1::<u32>()?.into_iter().max();
        if let Some(id) = largest.filter(|&id| id as usize >= n_symbols) {
            return Err(OverFlowError::ShapeMismatch(format!(
                "symbol id {} outside a table of {}",
                id, n_symbols
            )));
        }
        let x = table.forward(&ids)?;
        Ok(x.transpose(1, 2)?.contiguous()?)
    }

    /// One unbatched input → `(1, D, N)` embeddings
    fn embed_input(&self, input: &InputSequence) -> Result<Tensor> {
        match input {
            InputSequence::Features(features) => self.embed_features(&features.t()?.unsqueeze(0)?),
            InputSequence::Symbols(symbols) => {
                if symbols.rank() != 1 {
                    return Err(OverFlowError::ShapeMismatch(format!(
                        "symbol sequence must be 1-D, got {:?}",
                        symbols.dims()
                    )));
                }
                self.embed_symbols(&symbols.unsqueeze(0)?)
            }
        }
    }

    /// Training objective.
    ///
    /// `features`: `(B, n_features, N)`, `spectrogram`: `(B, n_mel, T)`.
    pub fn forward(
        &mut self,
        features: &Tensor,
        feature_lengths: &[usize],
        spectrogram: &Tensor,
        spectrogram_lengths: &[usize],
    ) -> Result<TrainingLoss> {
        let embedded = self.embed_features(features)?;
        self.objective(&embedded, feature_lengths, spectrogram, spectrogram_lengths)
    }

    /// Training objective on symbol ids `(B, N)`.
    pub fn forward_symbols(
        &mut self,
        symbols: &Tensor,
        symbol_lengths: &[usize],
        spectrogram: &Tensor,
        spectrogram_lengths: &[usize],
    ) -> Result<TrainingLoss> {
        let embedded = self.embed_symbols(symbols)?;
        self.objective(&embedded, symbol_lengths, spectrogram, spectrogram_lengths)
    }

    fn objective(
        &mut self,
        embedded: &Tensor,
        input_lengths: &[usize],
        spectrogram: &Tensor,
        spectrogram_lengths: &[usize],
    ) -> Result<TrainingLoss> {
        let spectrogram = match &self.normaliser {
            Some(norm) => norm.normalise(spectrogram)?,
            None => spectrogram.clone(),
        };

        let (conditioning, cond_lengths) = self.encoder.encode(embedded, input_lengths)?;

        let flow = if self.training {
            self.decoder
                .forward_train(&spectrogram, spectrogram_lengths, None, &mut self.rng)?
        } else {
            self.decoder.forward(&spectrogram, spectrogram_lengths, None)?
        };

        let likelihoods: Likelihoods =
            self.hmm
                .forward(&conditioning, &cond_lengths, &flow.latent, &flow.lengths)?;
        let log_likelihoods = likelihoods.total()?;

        // Untrimmed frame counts, as given by the caller
        let denominator =
            (cond_lengths.iter().sum::<usize>() + spectrogram_lengths.iter().sum::<usize>()) as f64;
        let objective = ((log_likelihoods.sum_all()? + flow.logdet.sum_all()?)? / denominator)?;
        let log_likelihood_per_frame = objective.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        let loss = objective.neg()?;
        log::debug!(
            "batch of {}: log-likelihood per frame {:.4}",
            cond_lengths.len(),
            log_likelihood_per_frame
        );

        Ok(TrainingLoss {
            loss,
            log_likelihood_per_frame,
            log_likelihoods,
            logdet: flow.logdet,
        })
    }

    /// Generate a spectrogram for one `(N, n_features)` feature sequence.
    pub fn sample(&mut self, features: &Tensor, sampling_temp: f64) -> Result<Synthesis> {
        let embedded = self.embed_input(&InputSequence::Features(features.clone()))?;
        self.synthesise(&embedded, sampling_temp)
    }

    /// Generate a spectrogram for one `(N,)` symbol-id sequence.
    pub fn sample_text(&mut self, symbols: &Tensor, sampling_temp: f64) -> Result<Synthesis> {
        let embedded = self.embed_input(&InputSequence::Symbols(symbols.clone()))?;
        self.synthesise(&embedded, sampling_temp)
    }

    /// Generate from a weighted sum of several sequences' embeddings.
    ///
    /// Features and symbols may be mixed; every input must have the same
    /// number of steps.
    pub fn sample_blended(
        &mut self,
        inputs: &[(InputSequence, f64)],
        sampling_temp: f64,
    ) -> Result<Synthesis> {
        let mut blended: Option<Tensor> = None;
        for (input, weight) in inputs {
            let embedded = (self.embed_input(input)? * *weight)?;
            blended = Some(match blended {
                Some(acc) => {
                    if acc.dims() != embedded.dims() {
                        return Err(OverFlowError::ShapeMismatch(format!(
                            "blended inputs differ in length: {:?} vs {:?}",
                            embedded.dims(),
                            acc.dims()
                        )));
                    }
                    (acc + embedded)?
                }
                None => embedded,
            });
        }
        let blended = blended.ok_or_else(|| OverFlowError::ShapeMismatch("no inputs to blend".to_string()))?;
        self.synthesise(&blended, sampling_temp)
    }

    fn synthesise(&mut self, embedded: &Tensor, sampling_temp: f64) -> Result<Synthesis> {
        let steps = embedded.dim(2)?;
        let (conditioning, _) = self.encoder.encode(embedded, &[steps])?;
        let outcome = self.hmm.sample(&conditioning, sampling_temp)?;

        let latent = outcome.trace().latent.t()?.unsqueeze(0)?;
        let frames = latent.dim(2)?;
        let n_sqz = self.config.decoder.n_sqz;
        if frames < n_sqz {
            log::warn!(
                "{} sampled frames are fewer than the squeeze factor {}, nothing to decode",
                frames,
                n_sqz
            );
            let spectrogram = Tensor::zeros((0, self.config.data.n_mel_channels), latent.dtype(), latent.device())?;
            return Ok(Synthesis {
                spectrogram,
                outcome,
                inverse_generation: None,
            });
        }
        let decoded = self.decoder.reverse(&latent, &[frames], None)?;

        let mut spectrogram = decoded.spectrogram.squeeze(0)?.t()?.contiguous()?;
        if let Some(norm) = &self.normaliser {
            spectrogram = norm.inverse_normalise(&spectrogram)?;
        }
        Ok(Synthesis {
            spectrogram,
            outcome,
            inverse_generation: decoded.inverse_generation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TerminationPolicy;
    use crate::encoder::PassthroughEncoder;
    use candle_nn::VarMap;

    fn small_config() -> OverFlowConfig {
        let mut config = OverFlowConfig::default();
        config.data.n_mel_channels = 4;
        config.data.n_features = 3;
        config.encoder.embedding_dim = 6;
        config.prenet.dim = 5;
        config.hmm.post_prenet_rnn_dim = 8;
        config.hmm.parameternetwork = vec![8];
        config.hmm.max_sampling_time = 200;
        config.decoder.flow_hidden_channels = 8;
        config.decoder.kernel_size_dec = 3;
        config.decoder.n_blocks_dec = 2;
        config.decoder.n_block_layers = 2;
        config
    }

    fn build_with(config: OverFlowConfig, dtype: DType) -> (OverFlow<PassthroughEncoder>, VarMap) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, dtype, &Device::Cpu);
        let encoder = PassthroughEncoder::new(config.encoder.embedding_dim);
        (OverFlow::new(config, encoder, vb).unwrap(), varmap)
    }

    fn build(config: OverFlowConfig) -> (OverFlow<PassthroughEncoder>, VarMap) {
        build_with(config, DType::F32)
    }

    #[test]
    fn test_loss_combines_likelihood_and_logdet() {
        let (mut model, _varmap) = build(small_config());
        let dev = Device::Cpu;
        let features = Tensor::randn(0f32, 1.0, (2, 3, 3), &dev).unwrap();
        let mels = Tensor::randn(0f32, 1.0, (2, 4, 16), &dev).unwrap();

        let out = model.forward(&features, &[3, 2], &mels, &[16, 11]).unwrap();
        let ll: f64 = out.log_likelihoods.sum_all().unwrap().to_scalar::<f32>().unwrap() as f64;
        let ld: f64 = out.logdet.sum_all().unwrap().to_scalar::<f32>().unwrap() as f64;
        // 5 input steps plus 27 frames; the flow trims 11 to 10 but the
        // normaliser counts the frames as given.
        let expected = (ll + ld) / (5.0 + 27.0);
        assert!((out.log_likelihood_per_frame - expected).abs() < 1e-3);
        let loss = out.loss.to_scalar::<f32>().unwrap() as f64;
        assert!((loss + out.log_likelihood_per_frame).abs() < 1e-6);
    }

    #[test]
    fn test_infeasible_batch_fails_loss() {
        let (mut model, _varmap) = build(small_config());
        let dev = Device::Cpu;
        let features = Tensor::randn(0f32, 1.0, (1, 3, 4), &dev).unwrap();
        let mels = Tensor::randn(0f32, 1.0, (1, 4, 6), &dev).unwrap();
        assert!(matches!(
            model.forward(&features, &[4], &mels, &[6]),
            Err(OverFlowError::InfeasibleAlignment { .. })
        ));
    }

    #[test]
    fn test_sample_uses_stored_inverse() {
        let mut config = small_config();
        config.data.data_mean = Some(-5.0);
        config.data.data_std = Some(2.0);
        let (mut model, _varmap) = build(config);
        let generation = model.eval().unwrap();

        let features = Tensor::randn(0f32, 1.0, (2, 3), &Device::Cpu).unwrap();
        let out = model.sample(&features, 0.667).unwrap();
        assert_eq!(out.inverse_generation, Some(generation));
        let (frames, channels) = out.spectrogram.dims2().unwrap();
        assert_eq!(channels, 4);
        assert!(frames <= out.outcome.trace().frames());
    }

    #[test]
    fn test_single_frame_generation_gives_empty_spectrogram() {
        let mut config = small_config();
        config.encoder.state_per_phone = 1;
        config.hmm.termination = TerminationPolicy::FinalStateVisit;
        let (mut model, _varmap) = build(config);

        let features = Tensor::randn(0f32, 1.0, (1, 3), &Device::Cpu).unwrap();
        let out = model.sample(&features, 1.0).unwrap();
        assert!(!out.is_truncated());
        assert_eq!(out.outcome.trace().frames(), 1);
        assert_eq!(out.spectrogram.dims(), &[0, 4]);
        assert_eq!(out.inverse_generation, None);
    }

    #[test]
    fn test_truncated_generation_keeps_partial_trace() {
        let mut config = small_config();
        config.encoder.state_per_phone = 1;
        config.hmm.max_sampling_time = 1;
        let (mut model, _varmap) = build(config);
        let features = Tensor::randn(0f32, 1.0, (3, 3), &Device::Cpu).unwrap();

        let out = model.sample(&features, 1.0).unwrap();
        assert!(out.is_truncated());
        assert_eq!(out.outcome.trace().frames(), 1);
        assert_eq!(out.spectrogram.dims(), &[0, 4]);
        assert!(matches!(
            out.outcome.into_result(),
            Err(OverFlowError::Truncated { steps: 1, num_states: 3, .. })
        ));

        // Six states cannot be covered in four frames; the partial trace is
        // still decoded.
        let mut config = small_config();
        config.hmm.max_sampling_time = 4;
        let (mut model, _varmap) = build(config);
        let out = model.sample(&features, 1.0).unwrap();
        assert!(out.is_truncated());
        assert_eq!(out.spectrogram.dims(), &[4, 4]);
    }

    #[test]
    fn test_blend_of_one_matches_plain_sample() {
        let (mut model, _varmap) = build(small_config());
        let features = Tensor::randn(0f32, 1.0, (3, 3), &Device::Cpu).unwrap();

        model.reseed(3);
        let plain = model.sample(&features, 0.5).unwrap();
        model.reseed(3);
        let blended = model
            .sample_blended(&[(InputSequence::Features(features.clone()), 1.0)], 0.5)
            .unwrap();
        assert_eq!(plain.outcome.trace().states, blended.outcome.trace().states);

        let other = Tensor::randn(0f32, 1.0, (4, 3), &Device::Cpu).unwrap();
        let inputs = [
            (InputSequence::Features(features), 0.5),
            (InputSequence::Features(other), 0.5),
        ];
        assert!(matches!(
            model.sample_blended(&inputs, 0.5),
            Err(OverFlowError::ShapeMismatch(_))
        ));
        assert!(matches!(
            model.sample_blended(&[], 0.5),
            Err(OverFlowError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_symbol_inputs() {
        let mut config = small_config();
        config.data.n_symbols = Some(10);
        let (mut model, _varmap) = build(config);
        let dev = Device::Cpu;

        let ids = Tensor::new(&[[1u32, 4, 9], [2, 2, 0]], &dev).unwrap();
        let mels = Tensor::randn(0f32, 1.0, (2, 4, 12), &dev).unwrap();
        let out = model.forward_symbols(&ids, &[3, 2], &mels, &[12, 10]).unwrap();
        assert!(out.log_likelihood_per_frame.is_finite());

        let text = Tensor::new(&[3u32, 5, 7], &dev).unwrap();
        model.reseed(11);
        let plain = model.sample_text(&text, 0.5).unwrap();
        model.reseed(11);
        let blended = model
            .sample_blended(&[(InputSequence::Symbols(text.clone()), 1.0)], 0.5)
            .unwrap();
        assert_eq!(plain.outcome.trace().states, blended.outcome.trace().states);

        // Symbols and features of equal length blend together.
        let features = Tensor::randn(0f32, 1.0, (3, 3), &dev).unwrap();
        let mixed = [
            (InputSequence::Symbols(text), 0.7),
            (InputSequence::Features(features), 0.3),
        ];
        assert!(model.sample_blended(&mixed, 0.5).is_ok());

        let out_of_range = Tensor::new(&[3u32, 10], &dev).unwrap();
        assert!(matches!(
            model.sample_text(&out_of_range, 0.5),
            Err(OverFlowError::ShapeMismatch(_))
        ));
        let floats = Tensor::new(&[1f32, 2.0], &dev).unwrap();
        assert!(matches!(
            model.sample_text(&floats, 0.5),
            Err(OverFlowError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_symbols_need_a_table() {
        let (mut model, _varmap) = build(small_config());
        let text = Tensor::new(&[0u32, 1], &Device::Cpu).unwrap();
        assert!(matches!(
            model.sample_text(&text, 1.0),
            Err(OverFlowError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_double_precision_model() {
        let mut config = small_config();
        config.data.data_mean = Some(-5.0);
        config.data.data_std = Some(2.0);
        let (mut model, _varmap) = build_with(config, DType::F64);
        model.eval().unwrap();
        let dev = Device::Cpu;

        let features = Tensor::randn(0f64, 1.0, (1, 3, 2), &dev).unwrap();
        let mels = Tensor::randn(0f64, 1.0, (1, 4, 8), &dev).unwrap();
        let out = model.forward(&features, &[2], &mels, &[8]).unwrap();
        assert_eq!(out.loss.dtype(), DType::F64);
        assert!(out.log_likelihood_per_frame.is_finite());

        let synthesis = model.sample(&features.squeeze(0).unwrap().t().unwrap(), 1.0).unwrap();
        assert_eq!(synthesis.spectrogram.dtype(), DType::F64);
    }

    #[test]
    fn test_mismatched_encoder_is_rejected() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let result = OverFlow::new(small_config(), PassthroughEncoder::new(7), vb);
        assert!(matches!(result, Err(OverFlowError::InvalidConfig(_))));
    }
}
