//! Log-domain forward recursion over a left-to-right HMM
//!
//! States advance by at most one per frame. With emission log-densities
//! `e[t][s]` and transition log-probabilities taken from the previous step:
//!
//! ```text
//! alpha[0][0]   = e[0][0],  alpha[0][s>0] = -inf
//! alpha[t][s]   = logaddexp(alpha[t-1][s]   + stay[t-1][s],
//!                           alpha[t-1][s-1] + move[t-1][s-1]) + e[t][s]
//! ```
//!
//! The loop runs over time and is vectorised over batch and state.

use candle_core::{IndexOp, Tensor};

use crate::error::{OverFlowError, Result};
use crate::modules::logmath::log_add_exp;

/// Every `alpha[t]` of one forward call, each `(B, S)`
#[derive(Debug, Clone)]
pub struct ForwardTable {
    alphas: Vec<Tensor>,
}

impl ForwardTable {
    /// All inputs are `(B, T, S)`.
    pub fn compute(log_emission: &Tensor, log_stay: &Tensor, log_move: &Tensor) -> Result<Self> {
        let (b, t, s) = log_emission.dims3()?;
        for (name, other) in [("stay", log_stay), ("move", log_move)] {
            if other.dims() != [b, t, s] {
                return Err(OverFlowError::ShapeMismatch(format!(
                    "{} log-probabilities have shape {:?}, emissions {:?}",
                    name,
                    other.dims(),
                    [b, t, s]
                )));
            }
        }
        if t == 0 || s == 0 {
            return Ok(Self { alphas: Vec::new() });
        }

        let device = log_emission.device();
        let dtype = log_emission.dtype();
        let neg_inf = |cols: usize| -> Result<Tensor> {
            Ok(Tensor::full(f32::NEG_INFINITY, (b, cols), device)?.to_dtype(dtype)?)
        };

        let first = log_emission.i((.., 0, 0..1))?;
        let mut alpha = if s > 1 {
            Tensor::cat(&[&first, &neg_inf(s - 1)?], 1)?
        } else {
            first
        };

        let mut alphas = Vec::with_capacity(t);
        alphas.push(alpha.clone());
        for step in 1..t {
            let stay = (&alpha + log_stay.i((.., step - 1, ..))?)?;
            let moved = (&alpha + log_move.i((.., step - 1, ..))?)?;
            // State s is entered from s - 1; nothing enters state 0.
            let entered = if s > 1 {
                Tensor::cat(&[&neg_inf(1)?, &moved.narrow(1, 0, s - 1)?], 1)?
            } else {
                neg_inf(1)?
            };
            alpha = (log_add_exp(&stay, &entered)? + log_emission.i((.., step, ..))?)?;
            alphas.push(alpha.clone());
        }
        Ok(Self { alphas })
    }

    /// Log-likelihood of item `item` ending in state `states - 1` after
    /// `frames` frames, as a rank-0 tensor.
    pub fn log_likelihood(&self, item: usize, frames: usize, states: usize) -> Result<Tensor> {
        let alpha = frames
            .checked_sub(1)
            .and_then(|t| self.alphas.get(t))
            .ok_or_else(|| {
                OverFlowError::ShapeMismatch(format!(
                    "item {} asks for {} frames, table holds {}",
                    item,
                    frames,
                    self.alphas.len()
                ))
            })?;
        let total_states = alpha.dim(1)?;
        if states == 0 || states > total_states {
            return Err(OverFlowError::ShapeMismatch(format!(
                "item {} asks for {} states, table holds {}",
                item, states, total_states
            )));
        }
        Ok(alpha.i((item, states - 1))?)
    }
}
