//! OverFlow acoustic model
//!
//! A neural HMM alignment model coupled with a Glow-style normalizing flow
//! decoder, implemented with Candle. Conditioning features are aligned to
//! spectrogram frames through an exact forward-algorithm likelihood; the flow
//! maps frames to a latent space with tractable log-determinant and back.

pub mod config;
pub mod encoder;
pub mod error;
pub mod models;
pub mod modules;
pub mod normaliser;

pub use config::{OverFlowConfig, TerminationPolicy};
pub use encoder::{PassthroughEncoder, SequenceEncoder};
pub use error::{OverFlowError, Result};
pub use models::{AlignmentModel, FlowDecoder, InputSequence, OverFlow, SampleOutcome, Synthesis};
pub use normaliser::Normaliser;

/// Crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
