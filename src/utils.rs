//! Shared numerical helpers for trace line computation.

/// Largest absolute linear predictor fed to the exponential. Predictors are
/// clamped into `[-ABS_MAX_Z, ABS_MAX_Z]` at every call site that builds one.
pub const ABS_MAX_Z: f64 = 30.0;

/// Distance from 0 and 1 used when clamping category probabilities so that
/// downstream log-likelihoods stay finite.
pub const PROB_EPS: f64 = 1e-20;

/// Numerically stable inverse logit.
#[inline]
pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let exp_x = x.exp();
        exp_x / (1.0 + exp_x)
    }
}

/// Clamp a linear predictor before exponentiation.
#[inline]
pub fn clamp_z(z: f64) -> f64 {
    z.clamp(-ABS_MAX_Z, ABS_MAX_Z)
}

/// Clamp a probability into `[PROB_EPS, 1 - PROB_EPS]`.
#[inline]
pub fn clamp_prob(p: f64) -> f64 {
    p.clamp(PROB_EPS, 1.0 - PROB_EPS)
}
