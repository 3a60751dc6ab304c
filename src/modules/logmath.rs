//! Log-domain arithmetic on tensors
//!
//! Every helper here tolerates `-inf` operands, which the forward recursion
//! uses to mark unreachable states.

use candle_core::{Result, Tensor};

const LOG_2PI: f64 = 1.837_877_066_409_345_3;

/// Elementwise `log(exp(a) + exp(b))`.
///
/// The running maximum is replaced by zero wherever it is `-inf`, so two
/// unreachable operands give `-inf` instead of `NaN`.
pub fn log_add_exp(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let max = a.maximum(b)?;
    let finite = max.ge(f32::MIN as f64)?;
    let max = finite.where_cond(&max, &max.zeros_like()?)?;
    let sum = (a.sub(&max)?.exp()? + b.sub(&max)?.exp()?)?;
    sum.log()? + max
}

/// Numerically stable `log(1 + exp(x))`
pub fn softplus(x: &Tensor) -> Result<Tensor> {
    let tail = (x.abs()?.neg()?.exp()? + 1.0)?.log()?;
    x.relu()? + tail
}

/// `log(sigmoid(x))` without overflow for large `|x|`
pub fn log_sigmoid(x: &Tensor) -> Result<Tensor> {
    softplus(&x.neg()?)?.neg()
}

/// Diagonal Gaussian log-density summed over the last dimension.
///
/// `x` must broadcast against `mean`/`std`.
pub fn gaussian_log_prob(x: &Tensor, mean: &Tensor, std: &Tensor) -> Result<Tensor> {
    let z = x.broadcast_sub(mean)?.broadcast_div(std)?;
    let per_dim = z.sqr()?.affine(-0.5, -0.5 * LOG_2PI)?;
    let per_dim = per_dim.broadcast_sub(&std.log()?)?;
    let last = per_dim.rank() - 1;
    per_dim.sum(last)
}

/// Host-side `log(exp(a) + exp(b))` for scalar checks
pub fn log_add_exp_scalar(a: f64, b: f64) -> f64 {
    let max = a.max(b);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    max + ((a - max).exp() + (b - max).exp()).ln()
}
