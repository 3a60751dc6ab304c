//! Local check harness for the OverFlow model
//!
//! Builds a model, runs a flow round trip, a likelihood pass and a generation,
//! prints statistics and writes the generated spectrogram plus a JSON report.
//!
//! Usage:
//!   cargo run --bin overflow-check -- --model-dir /path/to/model
//!   cargo run --bin overflow-check -- --config config.json --features feats.safetensors
//!
//! The model directory should contain:
//!   - config.json
//!   - model.safetensors
//!
//! Without a model directory the weights are randomly initialised. Feature
//! files hold a single `features` tensor of shape (steps, n_features), f32.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use serde::Serialize;

use overflow_tts::{OverFlow, OverFlowConfig, PassthroughEncoder};

const DEFAULT_SAMPLING_TEMP: f64 = 1.0;

/// Summary statistics of a generated spectrogram
#[derive(Debug, Serialize)]
struct SpectrogramStats {
    frames: usize,
    channels: usize,
    min: f32,
    max: f32,
    mean: f32,
    nan_count: usize,
    inf_count: usize,
}

impl SpectrogramStats {
    fn compute(spec: &Tensor) -> anyhow::Result<Self> {
        let (frames, channels) = spec.dims2()?;
        let values: Vec<f32> = spec.flatten_all()?.to_vec1()?;
        let finite: Vec<f32> = values.iter().copied().filter(|v| v.is_finite()).collect();
        let mean = if finite.is_empty() {
            0.0
        } else {
            finite.iter().sum::<f32>() / finite.len() as f32
        };
        Ok(Self {
            frames,
            channels,
            min: finite.iter().copied().fold(f32::INFINITY, f32::min),
            max: finite.iter().copied().fold(f32::NEG_INFINITY, f32::max),
            mean,
            nan_count: values.iter().filter(|v| v.is_nan()).count(),
            inf_count: values.iter().filter(|v| v.is_infinite()).count(),
        })
    }

    fn is_healthy(&self) -> bool {
        self.frames > 0 && self.nan_count == 0 && self.inf_count == 0
    }
}

#[derive(Debug, Serialize)]
struct Report {
    version: &'static str,
    seed: u64,
    sampling_temp: f64,
    flow_round_trip_max_error: f32,
    flow_logdet: f32,
    log_likelihood_per_frame: f64,
    sampled_states: usize,
    truncated: bool,
    inverse_generation: Option<u64>,
    spectrogram: SpectrogramStats,
    synthesis_time_sec: f32,
    healthy: bool,
}

struct Args {
    model_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    features: Option<PathBuf>,
    symbols: Option<Vec<u32>>,
    steps: usize,
    temperature: f64,
    seed: Option<u64>,
    output: PathBuf,
    json_report: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    println!("=== OverFlow Check Harness ===\n");

    let args = match parse_args()? {
        Some(args) => args,
        None => return Ok(()),
    };

    let device = Device::Cpu;
    let mut model = build_model(&args, &device)?;
    if let Some(seed) = args.seed {
        model.reseed(seed);
    }
    let config = model.config().clone();

    println!("Configuration:");
    println!("  Mel channels: {}", config.data.n_mel_channels);
    println!("  Feature channels: {}", config.data.n_features);
    println!("  States per step: {}", config.encoder.state_per_phone);
    println!("  Flow blocks: {}", config.decoder.n_blocks_dec);
    println!("  Sampling temperature: {}\n", args.temperature);

    let features = match &args.features {
        Some(path) => read_features(path, &device)?,
        None => Tensor::randn(0f32, 1.0, (args.steps, config.data.n_features), &device)?,
    };
    let (steps, _) = features.dims2()?;

    // Flow round trip
    let frames = 2 * config.num_states(steps).max(1) * config.decoder.n_sqz;
    let spec = Tensor::randn(0f32, 1.0, (1, config.data.n_mel_channels, frames), &device)?;
    let flow = model.decoder().forward(&spec, &[frames], None)?;
    let back = model.decoder().reverse(&flow.latent, &flow.lengths, None)?;
    let round_trip_error = (back.spectrogram - &spec)?
        .abs()?
        .flatten_all()?
        .max(0)?
        .to_scalar::<f32>()?;
    let logdet = flow.logdet.to_vec1::<f32>()?[0];
    println!("Flow round trip:");
    println!("  Frames: {}", frames);
    println!("  Max abs error: {:.3e}", round_trip_error);
    println!("  Log-determinant: {:.4}\n", logdet);

    // Likelihood of a random spectrogram long enough for every state
    let batch_features = features.t()?.unsqueeze(0)?;
    let loss = model.forward(&batch_features, &[steps], &spec, &[frames])?;
    println!("Likelihood pass:");
    println!("  Log-likelihood per frame: {:.4}\n", loss.log_likelihood_per_frame);

    // Generation
    println!("Sampling...");
    let start = Instant::now();
    let synthesis = match &args.symbols {
        Some(ids) => {
            println!("  Input: {} symbol ids", ids.len());
            model.sample_text(&Tensor::new(ids.as_slice(), &device)?, args.temperature)?
        }
        None => model.sample(&features, args.temperature)?,
    };
    let synthesis_time = start.elapsed().as_secs_f32();
    let stats = SpectrogramStats::compute(&synthesis.spectrogram)?;
    println!("Sampled in {:.2}s", synthesis_time);
    println!("  HMM steps: {}", synthesis.outcome.trace().frames());
    println!("  Frames: {}", stats.frames);
    println!("  Range: [{:.4}, {:.4}], mean {:.4}", stats.min, stats.max, stats.mean);
    println!("  NaN: {}, Inf: {}", stats.nan_count, stats.inf_count);
    if synthesis.is_truncated() {
        println!("  WARNING: step budget exhausted before the final state");
    }

    let mut tensors = HashMap::new();
    tensors.insert("spectrogram".to_string(), synthesis.spectrogram.clone());
    candle_core::safetensors::save(&tensors, &args.output)
        .with_context(|| format!("writing {}", args.output.display()))?;
    println!("  Saved: {}", args.output.display());

    let healthy = stats.is_healthy() && !synthesis.is_truncated() && round_trip_error < 1e-3;
    let report = Report {
        version: overflow_tts::version(),
        seed: args.seed.unwrap_or(config.seed),
        sampling_temp: args.temperature,
        flow_round_trip_max_error: round_trip_error,
        flow_logdet: logdet,
        log_likelihood_per_frame: loss.log_likelihood_per_frame,
        sampled_states: synthesis.outcome.trace().num_states,
        truncated: synthesis.is_truncated(),
        inverse_generation: synthesis.inverse_generation,
        spectrogram: stats,
        synthesis_time_sec: synthesis_time,
        healthy,
    };
    if let Some(path) = &args.json_report {
        fs::write(path, serde_json::to_string_pretty(&report)?)
            .with_context(|| format!("writing {}", path.display()))?;
        println!("JSON report: {}", path.display());
    }

    println!("\n=== SUMMARY ===");
    if healthy {
        println!("Model health: ✓ OK");
    } else {
        println!("Model health: ✗ ISSUES DETECTED");
    }
    Ok(())
}

fn parse_args() -> anyhow::Result<Option<Args>> {
    let args: Vec<String> = env::args().collect();
    let mut parsed = Args {
        model_dir: None,
        config: None,
        features: None,
        symbols: None,
        steps: 8,
        temperature: DEFAULT_SAMPLING_TEMP,
        seed: None,
        output: PathBuf::from("./overflow_output.safetensors"),
        json_report: None,
    };

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        let needs_value = || value.with_context(|| format!("{} needs a value", args[i]));
        match args[i].as_str() {
            "--model-dir" | "-m" => parsed.model_dir = Some(PathBuf::from(needs_value()?)),
            "--config" | "-c" => parsed.config = Some(PathBuf::from(needs_value()?)),
            "--features" | "-f" => parsed.features = Some(PathBuf::from(needs_value()?)),
            "--symbols" | "-s" => {
                let ids = needs_value()?
                    .split(',')
                    .map(|id| id.trim().parse::<u32>())
                    .collect::<Result<Vec<_>, _>>()
                    .context("--symbols")?;
                parsed.symbols = Some(ids);
            }
            "--steps" => parsed.steps = needs_value()?.parse().context("--steps")?,
            "--temperature" | "-t" => parsed.temperature = needs_value()?.parse().context("--temperature")?,
            "--seed" => parsed.seed = Some(needs_value()?.parse().context("--seed")?),
            "--output" | "-o" => parsed.output = PathBuf::from(needs_value()?),
            "--json-report" => parsed.json_report = Some(PathBuf::from(needs_value()?)),
            "--help" | "-h" => {
                print_usage();
                return Ok(None);
            }
            other => {
                eprintln!("Unknown argument: {}", other);
                print_usage();
                return Ok(None);
            }
        }
        i += 2;
    }
    if parsed.steps == 0 {
        bail!("--steps must be at least 1");
    }
    Ok(Some(parsed))
}

fn build_model(args: &Args, device: &Device) -> anyhow::Result<OverFlow<PassthroughEncoder>> {
    if let Some(dir) = &args.model_dir {
        println!("Loading model from {}...", dir.display());
        let config = OverFlowConfig::from_file(dir.join("config.json"))?;
        let encoder = PassthroughEncoder::new(config.encoder.embedding_dim);
        return Ok(OverFlow::load_with_config(dir, config, encoder, device)?);
    }

    let config = match &args.config {
        Some(path) => OverFlowConfig::from_file(path)?,
        None => OverFlowConfig::default(),
    };
    println!("No model directory given, using random weights");
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let encoder = PassthroughEncoder::new(config.encoder.embedding_dim);
    let mut model = OverFlow::new(config, encoder, vb)?;
    model.eval()?;
    Ok(model)
}

fn read_features(path: &Path, device: &Device) -> anyhow::Result<Tensor> {
    let mut tensors = candle_core::safetensors::load(path, device)
        .with_context(|| format!("reading {}", path.display()))?;
    let features = tensors.remove("features").context("missing `features` tensor")?;
    if features.rank() != 2 {
        bail!("features must be (steps, n_features), got {:?}", features.dims());
    }
    Ok(features.to_dtype(DType::F32)?)
}

fn print_usage() {
    println!(
        r#"
Usage: overflow-check [OPTIONS]

Options:
  -m, --model-dir <PATH>     Directory with config.json and model.safetensors
  -c, --config <PATH>        Configuration for a randomly initialised model
  -f, --features <PATH>      safetensors file with a (steps, n_features) `features` tensor
  -s, --symbols <IDS>        Comma-separated symbol ids to generate from (needs data.n_symbols)
      --steps <N>            Random feature steps when no file is given (default: 8)
  -t, --temperature <T>      Sampling temperature (default: 1.0)
      --seed <N>             Override the configured seed
  -o, --output <PATH>        Output spectrogram (default: ./overflow_output.safetensors)
      --json-report <PATH>   Write a JSON report
  -h, --help                 Show this help message
"#
    );
}
