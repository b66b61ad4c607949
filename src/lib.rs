//! High-performance Rust backend for IRT trace line computation.
//!
//! Given a latent trait grid and per-item parameter vectors, this crate
//! computes the probability of every response category for each item model
//! family the surrounding EM estimator supports:
//! - dichotomous items with logit-constrained asymptotes (2-4PL)
//! - graded response items, plus the rating-scale constrained variant
//! - nominal / generalized partial credit items, plus rating scale
//! - nested-logit items mixing a correct/incorrect split with a nominal
//!   choice among distractors
//! - partially compensatory multidimensional items
//!
//! Single-item trace line entry points live in [`traces`]; batch assembly
//! of the full item-blocked trace matrix consumed by the E-step lives in
//! [`itemtrace`]. Parameter vectors are decoded once per item into the
//! typed models of [`items`].

use pyo3::prelude::*;

pub mod utils;

pub mod items;
pub mod itemtrace;
pub mod traces;

/// Python module for itemtrace_rs
#[pymodule]
fn itemtrace_rs(m: &Bound<'_, PyModule>) -> PyResult<()> {
    traces::register(m)?;
    itemtrace::register(m)?;
    Ok(())
}
