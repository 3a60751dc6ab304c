//! Error types for the OverFlow model

use thiserror::Error;

/// Errors surfaced by the alignment model, the flow decoder and the
/// surrounding model plumbing.
#[derive(Debug, Error)]
pub enum OverFlowError {
    /// Paired tensors disagree on batch size, lengths or channel counts.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// The target sequence is too short to visit every required state.
    #[error("item {item}: {frames} frames cannot cover {required_states} states")]
    InfeasibleAlignment {
        item: usize,
        required_states: usize,
        frames: usize,
    },

    /// A non-finite log-probability or a singular transform survived the
    /// numerical safeguards.
    #[error("numerical degeneracy: {0}")]
    NumericalDegeneracy(String),

    /// Generation used up its step budget before reaching the final state.
    #[error("generation truncated after {steps} steps in state {state} of {num_states}")]
    Truncated {
        steps: usize,
        state: usize,
        num_states: usize,
    },

    /// `reverse` was called with an inverse cache built from older parameters.
    #[error("stale inverse cache in flow block {block}: cached generation {cached}, parameters at {current}")]
    StaleInverseCache {
        block: usize,
        cached: u64,
        current: u64,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("model load failed: {0}")]
    ModelLoadFailed(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, OverFlowError>;
