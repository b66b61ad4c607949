//! Trace line evaluators: response category probabilities per item model
//! family over a latent trait grid.
//!
//! Every evaluator is a pure function of a decoded parameter set, an
//! `(n_points, nfact)` trait grid, and an optional additive offset term.
//! One numerical convention runs through all of them: linear predictors are
//! clamped to `[-ABS_MAX_Z, ABS_MAX_Z]` before exponentiation, and category
//! probabilities that feed log-likelihoods are clamped away from 0 and 1.

use ndarray::{Array1, Array2, ArrayView2};
use numpy::{PyArray2, PyReadonlyArray1, PyReadonlyArray2, ToPyArray};
use pyo3::prelude::*;

use crate::items::{
    CompParams, DichParams, GradedParams, NestedParams, NominalParams, TraceError,
};
use crate::utils::{clamp_prob, clamp_z, sigmoid, ABS_MAX_Z};

/// Output layout selector for the graded family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradedOutput {
    /// One column per response category.
    Categories,
    /// Raw cumulative table: a leading ones column, the boundary curves,
    /// and a trailing zeros column.
    Cumulative,
}

/// Output selector for the nominal family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NominalOutput {
    /// Row-normalized categorical distribution.
    Probabilities,
    /// Unnormalized, max-shifted exponentials.
    Numerators,
}

/// Logistic trace primitive.
///
/// Builds the linear predictor `d + a . theta_i (+ ot_i)` per evaluation
/// point, clamps it, and returns both the asymptote-rescaled probability
/// `g + (u - g) * Pstar` and the raw curve `Pstar`.
pub fn item_trace(
    slopes: &[f64],
    intercept: f64,
    theta: ArrayView2<f64>,
    g: f64,
    u: f64,
    ot: Option<&[f64]>,
) -> (Array1<f64>, Array1<f64>) {
    let n = theta.nrows();
    let mut p = Array1::zeros(n);
    let mut pstar = Array1::zeros(n);
    for i in 0..n {
        let mut z = intercept;
        for (j, &a) in slopes.iter().enumerate() {
            z += a * theta[[i, j]];
        }
        if let Some(ot) = ot {
            z += ot[i];
        }
        let ps = sigmoid(clamp_z(z));
        pstar[i] = ps;
        p[i] = g + (u - g) * ps;
    }
    (p, pstar)
}

/// Two-category trace for the dichotomous family. Column 1 holds the
/// endorsed-category probability, column 0 its complement.
pub fn dich_trace(par: &DichParams, theta: ArrayView2<f64>, ot: Option<&[f64]>) -> Array2<f64> {
    let n = theta.nrows();
    let g = sigmoid(par.logit_g);
    let u = sigmoid(par.logit_u);
    let (p, _) = item_trace(&par.slopes, par.intercept, theta, g, u, ot);
    let mut out = Array2::zeros((n, 2));
    for i in 0..n {
        out[[i, 1]] = p[i];
        out[[i, 0]] = 1.0 - p[i];
    }
    out
}

/// Graded response trace lines.
///
/// Boundary intercepts must be strictly decreasing; a disordered sequence
/// zero-fills the whole output so the outer optimizer rejects the region
/// through the likelihood instead of a crash.
pub fn graded_trace(
    par: &GradedParams,
    theta: ArrayView2<f64>,
    ot: Option<&[f64]>,
    output: GradedOutput,
) -> Array2<f64> {
    let n = theta.nrows();
    let nint = par.intercepts.len();
    let ncols = match output {
        GradedOutput::Categories => nint + 1,
        GradedOutput::Cumulative => nint + 2,
    };
    let disordered = par.intercepts.windows(2).any(|w| w[0] <= w[1]);
    if disordered {
        return Array2::zeros((n, ncols));
    }

    // Cumulative "at or above boundary" curves, bracketed by 1 and 0.
    let mut pk = Array2::zeros((n, nint + 2));
    pk.column_mut(0).fill(1.0);
    for (b, &d) in par.intercepts.iter().enumerate() {
        let (_, pstar) = item_trace(&par.slopes, d, theta, 0.0, 1.0, ot);
        pk.column_mut(b + 1).assign(&pstar);
    }

    match output {
        GradedOutput::Cumulative => pk,
        GradedOutput::Categories => {
            let mut out = Array2::zeros((n, nint + 1));
            for k in 0..=nint {
                for i in 0..n {
                    out[[i, k]] = clamp_prob(pk[[i, k]] - pk[[i, k + 1]]);
                }
            }
            out
        }
    }
}

/// Nominal/partial-credit trace lines.
///
/// Scores are `ak_k * (a . theta_i) + d_k (+ ot_k)`; the row max is
/// subtracted before exponentiation. The offset here is per category, not
/// per evaluation point.
pub fn nominal_trace(
    par: &NominalParams,
    theta: ArrayView2<f64>,
    ot: Option<&[f64]>,
    output: NominalOutput,
) -> Array2<f64> {
    let n = theta.nrows();
    let ncat = par.scaling.len();
    let mut out = Array2::zeros((n, ncat));
    let mut z = vec![0.0; ncat];
    for i in 0..n {
        let mut innerprod = 0.0;
        for (j, &a) in par.slopes.iter().enumerate() {
            innerprod += a * theta[[i, j]];
        }
        for k in 0..ncat {
            z[k] = par.scaling[k] * innerprod + par.intercepts[k];
            if let Some(ot) = ot {
                z[k] += ot[k];
            }
        }
        let zmax = z.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let mut den = 0.0;
        for k in 0..ncat {
            let num = (z[k] - zmax).max(-ABS_MAX_Z).exp();
            out[[i, k]] = num;
            den += num;
        }
        if output == NominalOutput::Probabilities {
            for k in 0..ncat {
                out[[i, k]] /= den;
            }
        }
    }
    out
}

/// Nested-logit trace lines: a correct/incorrect dichotomous split, then a
/// nominal choice among the distractors conditional on being incorrect.
/// The correct category takes the split's endorsed probability directly and
/// consumes no distractor mass.
pub fn nested_trace(par: &NestedParams, theta: ArrayView2<f64>) -> Array2<f64> {
    let n = theta.nrows();
    let ncat = par.nominal.scaling.len() + 1;
    let pd = dich_trace(&par.dich, theta, None);
    let pn = nominal_trace(&par.nominal, theta, None, NominalOutput::Probabilities);
    let mut out = Array2::zeros((n, ncat));
    let mut k = 0;
    for cat in 0..ncat {
        if cat == par.correct {
            for i in 0..n {
                out[[i, cat]] = pd[[i, 1]];
            }
        } else {
            for i in 0..n {
                out[[i, cat]] = pd[[i, 0]] * pn[[i, k]];
            }
            k += 1;
        }
    }
    out
}

/// Partially compensatory trace: the product across dimensions of
/// per-dimension logistic curves, floored by the guessing parameter.
pub fn comp_trace(par: &CompParams, theta: ArrayView2<f64>) -> Array2<f64> {
    let n = theta.nrows();
    let g = sigmoid(par.logit_g);
    let mut out = Array2::zeros((n, 2));
    for i in 0..n {
        let mut prod = 1.0;
        for (j, (&a, &d)) in par.slopes.iter().zip(par.intercepts.iter()).enumerate() {
            prod *= sigmoid(a * theta[[i, j]] + d);
        }
        let p = clamp_prob(g + (1.0 - g) * prod);
        out[[i, 1]] = p;
        out[[i, 0]] = 1.0 - p;
    }
    out
}

/// A length of 1 or less disables the offset term.
fn offset_vec(ot: Option<PyReadonlyArray1<f64>>) -> Option<Vec<f64>> {
    let v = ot?.as_array().to_vec();
    if v.len() <= 1 {
        None
    } else {
        Some(v)
    }
}

fn check_offset_len(ot: &Option<Vec<f64>>, expected: usize) -> Result<(), TraceError> {
    if let Some(v) = ot {
        if v.len() != expected {
            return Err(TraceError::OffsetLength {
                got: v.len(),
                expected,
            });
        }
    }
    Ok(())
}

/// Dichotomous trace lines at each evaluation point.
///
/// # Arguments
/// * `par` - `[a_1..a_nfact, d, logit_g, logit_u]`
/// * `theta` - (n_points, nfact) latent trait grid
/// * `ot` - optional additive offset, one entry per evaluation point
///
/// # Returns
/// (n_points, 2) category probabilities, endorsed category in column 1
#[pyfunction]
#[pyo3(signature = (par, theta, ot=None))]
pub fn dich_trace_line_pts<'py>(
    py: Python<'py>,
    par: Vec<f64>,
    theta: PyReadonlyArray2<'py, f64>,
    ot: Option<PyReadonlyArray1<'py, f64>>,
) -> PyResult<Bound<'py, PyArray2<f64>>> {
    let theta = theta.as_array().to_owned();
    let params = DichParams::decode(&par, theta.ncols())?;
    let ot = offset_vec(ot);
    check_offset_len(&ot, theta.nrows())?;
    let out = py.allow_threads(|| dich_trace(&params, theta.view(), ot.as_deref()));
    Ok(out.to_pyarray(py))
}

/// Graded response trace lines; `return_cumulative` selects the raw
/// boundary-curve table instead of per-category probabilities.
#[pyfunction]
#[pyo3(signature = (par, theta, ot=None, return_cumulative=false, is_rating=false))]
pub fn graded_trace_line_pts<'py>(
    py: Python<'py>,
    par: Vec<f64>,
    theta: PyReadonlyArray2<'py, f64>,
    ot: Option<PyReadonlyArray1<'py, f64>>,
    return_cumulative: bool,
    is_rating: bool,
) -> PyResult<Bound<'py, PyArray2<f64>>> {
    let theta = theta.as_array().to_owned();
    let nfact = theta.ncols();
    let nint = par.len().saturating_sub(nfact + usize::from(is_rating));
    let params = GradedParams::decode(&par, nfact, nint + 1, is_rating)?;
    let ot = offset_vec(ot);
    check_offset_len(&ot, theta.nrows())?;
    let output = if return_cumulative {
        GradedOutput::Cumulative
    } else {
        GradedOutput::Categories
    };
    let out = py.allow_threads(|| graded_trace(&params, theta.view(), ot.as_deref(), output));
    Ok(out.to_pyarray(py))
}

/// Nominal trace lines; the offset term is per category.
#[pyfunction]
#[pyo3(signature = (par, ncat, theta, ot=None, return_numerators=false))]
pub fn nominal_trace_line_pts<'py>(
    py: Python<'py>,
    par: Vec<f64>,
    ncat: usize,
    theta: PyReadonlyArray2<'py, f64>,
    ot: Option<PyReadonlyArray1<'py, f64>>,
    return_numerators: bool,
) -> PyResult<Bound<'py, PyArray2<f64>>> {
    let theta = theta.as_array().to_owned();
    let params = NominalParams::decode(&par, theta.ncols(), ncat, false)?;
    let ot = offset_vec(ot);
    check_offset_len(&ot, ncat)?;
    let output = if return_numerators {
        NominalOutput::Numerators
    } else {
        NominalOutput::Probabilities
    };
    let out = py.allow_threads(|| nominal_trace(&params, theta.view(), ot.as_deref(), output));
    Ok(out.to_pyarray(py))
}

/// Generalized partial credit trace lines (nominal reparameterization); the
/// category count is implied by the parameter vector length.
#[pyfunction]
#[pyo3(signature = (par, theta, ot=None, is_rating=false))]
pub fn gpcm_trace_line_pts<'py>(
    py: Python<'py>,
    par: Vec<f64>,
    theta: PyReadonlyArray2<'py, f64>,
    ot: Option<PyReadonlyArray1<'py, f64>>,
    is_rating: bool,
) -> PyResult<Bound<'py, PyArray2<f64>>> {
    let theta = theta.as_array().to_owned();
    let nfact = theta.ncols();
    let ncat = par.len().saturating_sub(nfact) / 2;
    let params = NominalParams::decode(&par, nfact, ncat, is_rating)?;
    let ot = offset_vec(ot);
    check_offset_len(&ot, ncat)?;
    let out = py.allow_threads(|| {
        nominal_trace(&params, theta.view(), ot.as_deref(), NominalOutput::Probabilities)
    });
    Ok(out.to_pyarray(py))
}

/// Nested-logit trace lines; `correct` is the 0-based correct category.
#[pyfunction]
#[pyo3(signature = (par, theta, correct, ncat))]
pub fn nestlogit_trace_line_pts<'py>(
    py: Python<'py>,
    par: Vec<f64>,
    theta: PyReadonlyArray2<'py, f64>,
    correct: usize,
    ncat: usize,
) -> PyResult<Bound<'py, PyArray2<f64>>> {
    let theta = theta.as_array().to_owned();
    let params = NestedParams::decode(&par, theta.ncols(), ncat, correct)?;
    let out = py.allow_threads(|| nested_trace(&params, theta.view()));
    Ok(out.to_pyarray(py))
}

/// Partially compensatory trace lines.
#[pyfunction]
#[pyo3(signature = (par, theta))]
pub fn partcomp_trace_line_pts<'py>(
    py: Python<'py>,
    par: Vec<f64>,
    theta: PyReadonlyArray2<'py, f64>,
) -> PyResult<Bound<'py, PyArray2<f64>>> {
    let theta = theta.as_array().to_owned();
    let params = CompParams::decode(&par, theta.ncols())?;
    let out = py.allow_threads(|| comp_trace(&params, theta.view()));
    Ok(out.to_pyarray(py))
}

/// Register trace line functions with the Python module
pub fn register(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(dich_trace_line_pts, m)?)?;
    m.add_function(wrap_pyfunction!(graded_trace_line_pts, m)?)?;
    m.add_function(wrap_pyfunction!(nominal_trace_line_pts, m)?)?;
    m.add_function(wrap_pyfunction!(gpcm_trace_line_pts, m)?)?;
    m.add_function(wrap_pyfunction!(nestlogit_trace_line_pts, m)?)?;
    m.add_function(wrap_pyfunction!(partcomp_trace_line_pts, m)?)?;
    Ok(())
}
