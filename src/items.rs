//! Item parameter decoding and per-family model dispatch.
//!
//! Flat parameter vectors arrive from the host estimator in a positional
//! layout that differs per model family. They are decoded once per item into
//! named variants here; the evaluators in [`crate::traces`] then assume the
//! decoded invariants and run without error paths of their own.

use ndarray::{Array2, ArrayView2};
use pyo3::exceptions::PyValueError;
use pyo3::PyErr;
use thiserror::Error;

use crate::traces::{
    comp_trace, dich_trace, graded_trace, nested_trace, nominal_trace, GradedOutput,
    NominalOutput,
};

/// Errors raised while decoding item descriptors or assembling trace
/// matrices. Numerical trouble inside an evaluator is never an error: it is
/// clamped or soft-failed per model family.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("{family:?} item with nfact={nfact}, ncat={ncat}: parameter vector has length {got}, expected {expected}")]
    ParamLength {
        family: ItemFamily,
        nfact: usize,
        ncat: usize,
        expected: usize,
        got: usize,
    },
    #[error("unknown item class code {0}")]
    UnknownFamily(i32),
    #[error("{family:?} items have {expected} categories, descriptor declares {got}")]
    CategoryCount {
        family: ItemFamily,
        expected: usize,
        got: usize,
    },
    #[error("{1:?} item declares {0} categories, too few for the family")]
    TooFewCategories(usize, ItemFamily),
    #[error("nested-logit correct category {correct} out of range for {ncat} categories")]
    CorrectOutOfRange { correct: usize, ncat: usize },
    #[error("nested-logit items require a correct-category index")]
    MissingCorrect,
    #[error("fixed design block has {got} rows, expected {expected}")]
    FixedDesignRows { got: usize, expected: usize },
    #[error("offset term has length {got}, expected {expected}")]
    OffsetLength { got: usize, expected: usize },
    #[error("offset-term matrix is {rows}x{cols}, expected {n}x{nitems}")]
    OfftermShape {
        rows: usize,
        cols: usize,
        n: usize,
        nitems: usize,
    },
    #[error("descriptor list `{what}` has length {got}, expected {expected}")]
    DescriptorCount {
        what: &'static str,
        got: usize,
        expected: usize,
    },
}

impl From<TraceError> for PyErr {
    fn from(err: TraceError) -> PyErr {
        PyValueError::new_err(err.to_string())
    }
}

/// Model family codes shared with the host estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemFamily {
    /// Dichotomous item with logit-constrained asymptotes (2-4PL).
    Dich = 1,
    /// Graded response model.
    Graded = 2,
    /// Generalized partial credit (nominal reparameterization).
    Gpcm = 3,
    /// Nominal response model.
    Nominal = 4,
    /// Graded response with a shared rating-scale shift.
    GradedRating = 5,
    /// Nominal/partial credit with a shared rating-scale shift.
    NominalRating = 6,
    /// Partially compensatory multidimensional item.
    PartComp = 7,
    /// Two-stage nested logit over correct/incorrect and distractors.
    NestLogit = 8,
    /// Host-evaluated item; its output window is left untouched.
    Custom = 9,
}

impl ItemFamily {
    pub fn from_code(code: i32) -> Result<Self, TraceError> {
        match code {
            1 => Ok(ItemFamily::Dich),
            2 => Ok(ItemFamily::Graded),
            3 => Ok(ItemFamily::Gpcm),
            4 => Ok(ItemFamily::Nominal),
            5 => Ok(ItemFamily::GradedRating),
            6 => Ok(ItemFamily::NominalRating),
            7 => Ok(ItemFamily::PartComp),
            8 => Ok(ItemFamily::NestLogit),
            9 => Ok(ItemFamily::Custom),
            other => Err(TraceError::UnknownFamily(other)),
        }
    }
}

fn expect_len(
    family: ItemFamily,
    par: &[f64],
    expected: usize,
    nfact: usize,
    ncat: usize,
) -> Result<(), TraceError> {
    if par.len() != expected {
        return Err(TraceError::ParamLength {
            family,
            nfact,
            ncat,
            expected,
            got: par.len(),
        });
    }
    Ok(())
}

/// Slopes, intercept and asymptote logits for the dichotomous family.
///
/// Asymptotes are carried on the logit scale so the upstream optimizer can
/// move them unconstrained; [`crate::utils::sigmoid`] maps them back into
/// (0, 1) at evaluation time.
#[derive(Debug, Clone, PartialEq)]
pub struct DichParams {
    pub slopes: Vec<f64>,
    pub intercept: f64,
    pub logit_g: f64,
    pub logit_u: f64,
}

impl DichParams {
    /// Layout: `[a_1..a_nfact, d, logit_g, logit_u]`.
    pub fn decode(par: &[f64], nfact: usize) -> Result<Self, TraceError> {
        expect_len(ItemFamily::Dich, par, nfact + 3, nfact, 2)?;
        Ok(Self {
            slopes: par[..nfact].to_vec(),
            intercept: par[nfact],
            logit_g: par[nfact + 1],
            logit_u: par[nfact + 2],
        })
    }
}

/// Slopes and ordered boundary intercepts for the graded family.
#[derive(Debug, Clone, PartialEq)]
pub struct GradedParams {
    pub slopes: Vec<f64>,
    /// Category boundary intercepts, expected strictly decreasing. A
    /// disordered sequence is a soft failure at evaluation time, not a
    /// decode error: the optimizer gets a zero-probability region back.
    pub intercepts: Vec<f64>,
}

impl GradedParams {
    /// Layout: `[a_1..a_nfact, d_1..d_nint]`, where `nint = ncat - 1`. The
    /// rating-scale variant appends one trailing shift added to every
    /// boundary.
    pub fn decode(par: &[f64], nfact: usize, ncat: usize, rating: bool) -> Result<Self, TraceError> {
        let family = if rating {
            ItemFamily::GradedRating
        } else {
            ItemFamily::Graded
        };
        if ncat < 2 {
            return Err(TraceError::TooFewCategories(ncat, family));
        }
        let nint = ncat - 1;
        expect_len(family, par, nfact + nint + usize::from(rating), nfact, ncat)?;
        let shift = if rating { par[par.len() - 1] } else { 0.0 };
        let intercepts = par[nfact..nfact + nint].iter().map(|d| d + shift).collect();
        Ok(Self {
            slopes: par[..nfact].to_vec(),
            intercepts,
        })
    }
}

/// Slopes, per-category slope scalings and intercepts for the nominal
/// family. Generalized partial credit and rating-scale items are the same
/// structure under a different decode, not different code paths.
#[derive(Debug, Clone, PartialEq)]
pub struct NominalParams {
    pub slopes: Vec<f64>,
    pub scaling: Vec<f64>,
    pub intercepts: Vec<f64>,
}

impl NominalParams {
    /// Layout: `[a_1..a_nfact, ak_1..ak_ncat, d_1..d_ncat]`. The
    /// rating-scale variant appends one trailing shift added to every
    /// intercept but the first, which is pinned at zero (its slot in the
    /// flat vector is not read).
    pub fn decode(par: &[f64], nfact: usize, ncat: usize, rating: bool) -> Result<Self, TraceError> {
        let family = if rating {
            ItemFamily::NominalRating
        } else {
            ItemFamily::Nominal
        };
        if ncat < 2 {
            return Err(TraceError::TooFewCategories(ncat, family));
        }
        expect_len(family, par, nfact + 2 * ncat + usize::from(rating), nfact, ncat)?;
        let intercepts = if rating {
            let shift = par[par.len() - 1];
            let mut d = Vec::with_capacity(ncat);
            d.push(0.0);
            for k in 1..ncat {
                d.push(par[nfact + ncat + k] + shift);
            }
            d
        } else {
            par[nfact + ncat..nfact + 2 * ncat].to_vec()
        };
        Ok(Self {
            slopes: par[..nfact].to_vec(),
            scaling: par[nfact..nfact + ncat].to_vec(),
            intercepts,
        })
    }
}

/// Dichotomous correct/incorrect split plus a nominal model over the
/// distractors.
#[derive(Debug, Clone, PartialEq)]
pub struct NestedParams {
    pub dich: DichParams,
    /// Distractor sub-model over `ncat - 1` pseudo-categories; its slopes
    /// are fixed at 1.0.
    pub nominal: NominalParams,
    /// 0-based index of the correct response category.
    pub correct: usize,
}

impl NestedParams {
    /// Layout: `[a_1..a_nfact, d, logit_g, logit_u, ak_1..ak_{ncat-1},
    /// d_1..d_{ncat-1}]`.
    pub fn decode(
        par: &[f64],
        nfact: usize,
        ncat: usize,
        correct: usize,
    ) -> Result<Self, TraceError> {
        if ncat < 3 {
            return Err(TraceError::TooFewCategories(ncat, ItemFamily::NestLogit));
        }
        if correct >= ncat {
            return Err(TraceError::CorrectOutOfRange { correct, ncat });
        }
        let pseudo = ncat - 1;
        expect_len(
            ItemFamily::NestLogit,
            par,
            nfact + 3 + 2 * pseudo,
            nfact,
            ncat,
        )?;
        let dich = DichParams::decode(&par[..nfact + 3], nfact)?;
        let nominal = NominalParams {
            slopes: vec![1.0; nfact],
            scaling: par[nfact + 3..nfact + 3 + pseudo].to_vec(),
            intercepts: par[nfact + 3 + pseudo..].to_vec(),
        };
        Ok(Self {
            dich,
            nominal,
            correct,
        })
    }
}

/// Per-dimension slopes and intercepts plus a guessing logit for the
/// partially compensatory family.
#[derive(Debug, Clone, PartialEq)]
pub struct CompParams {
    pub slopes: Vec<f64>,
    pub intercepts: Vec<f64>,
    pub logit_g: f64,
}

impl CompParams {
    /// Layout: `[a_1..a_nfact, d_1..d_nfact, logit_g]`.
    pub fn decode(par: &[f64], nfact: usize) -> Result<Self, TraceError> {
        expect_len(ItemFamily::PartComp, par, 2 * nfact + 1, nfact, 2)?;
        Ok(Self {
            slopes: par[..nfact].to_vec(),
            intercepts: par[nfact..2 * nfact].to_vec(),
            logit_g: par[2 * nfact],
        })
    }
}

/// A fully decoded item model: the closed set of families this kernel
/// evaluates, selected once per item and never re-branched per evaluation
/// point.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemModel {
    Dich(DichParams),
    Graded(GradedParams),
    Nominal(NominalParams),
    NestLogit(NestedParams),
    PartComp(CompParams),
    /// Family code 9; evaluated by the host, carries only its declared
    /// category count so its output window can be sized.
    Custom { ncat: usize },
}

impl ItemModel {
    /// Decode a flat parameter vector for the given family.
    ///
    /// `nfact` is the number of columns of the trait grid the model will be
    /// evaluated on (including any fixed-design columns). Length mismatches
    /// are caught here, once, rather than as undefined slicing later.
    pub fn decode(
        family: ItemFamily,
        par: &[f64],
        nfact: usize,
        ncat: usize,
        correct: Option<usize>,
    ) -> Result<Self, TraceError> {
        match family {
            ItemFamily::Dich => {
                if ncat != 2 {
                    return Err(TraceError::CategoryCount {
                        family,
                        expected: 2,
                        got: ncat,
                    });
                }
                Ok(ItemModel::Dich(DichParams::decode(par, nfact)?))
            }
            ItemFamily::Graded => Ok(ItemModel::Graded(GradedParams::decode(
                par, nfact, ncat, false,
            )?)),
            ItemFamily::GradedRating => Ok(ItemModel::Graded(GradedParams::decode(
                par, nfact, ncat, true,
            )?)),
            ItemFamily::Gpcm | ItemFamily::Nominal => Ok(ItemModel::Nominal(
                NominalParams::decode(par, nfact, ncat, false)?,
            )),
            ItemFamily::NominalRating => Ok(ItemModel::Nominal(NominalParams::decode(
                par, nfact, ncat, true,
            )?)),
            ItemFamily::PartComp => {
                if ncat != 2 {
                    return Err(TraceError::CategoryCount {
                        family,
                        expected: 2,
                        got: ncat,
                    });
                }
                Ok(ItemModel::PartComp(CompParams::decode(par, nfact)?))
            }
            ItemFamily::NestLogit => {
                let correct = correct.ok_or(TraceError::MissingCorrect)?;
                Ok(ItemModel::NestLogit(NestedParams::decode(
                    par, nfact, ncat, correct,
                )?))
            }
            ItemFamily::Custom => Ok(ItemModel::Custom { ncat }),
        }
    }

    /// Number of response categories the model produces per evaluation
    /// point.
    pub fn ncat(&self) -> usize {
        match self {
            ItemModel::Dich(_) | ItemModel::PartComp(_) => 2,
            ItemModel::Graded(p) => p.intercepts.len() + 1,
            ItemModel::Nominal(p) => p.scaling.len(),
            ItemModel::NestLogit(p) => p.nominal.scaling.len() + 1,
            ItemModel::Custom { ncat } => *ncat,
        }
    }

    /// Category probability table at `theta`: one row per evaluation point,
    /// one column per category.
    ///
    /// The offset slice, when present, must already be routed for the
    /// family: per evaluation point for dichotomous/graded, per category for
    /// nominal, absent for the rest.
    pub fn trace(&self, theta: ArrayView2<f64>, ot: Option<&[f64]>) -> Array2<f64> {
        match self {
            ItemModel::Dich(p) => dich_trace(p, theta, ot),
            ItemModel::Graded(p) => graded_trace(p, theta, ot, GradedOutput::Categories),
            ItemModel::Nominal(p) => nominal_trace(p, theta, ot, NominalOutput::Probabilities),
            ItemModel::NestLogit(p) => nested_trace(p, theta),
            ItemModel::PartComp(p) => comp_trace(p, theta),
            ItemModel::Custom { ncat } => Array2::zeros((theta.nrows(), *ncat)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_codes_round_trip() {
        for code in 1..=9 {
            let family = ItemFamily::from_code(code).unwrap();
            assert_eq!(family as i32, code);
        }
        assert!(matches!(
            ItemFamily::from_code(12),
            Err(TraceError::UnknownFamily(12))
        ));
    }

    #[test]
    fn dich_decode_splits_slots() {
        let par = [1.2, -0.4, 0.7, -1.0, 2.0];
        let p = DichParams::decode(&par, 2).unwrap();
        assert_eq!(p.slopes, vec![1.2, -0.4]);
        assert_eq!(p.intercept, 0.7);
        assert_eq!(p.logit_g, -1.0);
        assert_eq!(p.logit_u, 2.0);
    }

    #[test]
    fn dich_decode_rejects_wrong_length() {
        let err = DichParams::decode(&[1.0, 0.0], 1).unwrap_err();
        assert!(matches!(
            err,
            TraceError::ParamLength {
                expected: 4,
                got: 2,
                ..
            }
        ));
    }

    #[test]
    fn graded_rating_decode_shifts_every_boundary() {
        let plain = GradedParams::decode(&[1.0, 1.75, 0.75, -0.25], 1, 4, false).unwrap();
        let rated = GradedParams::decode(&[1.0, 1.5, 0.5, -0.5, 0.25], 1, 4, true).unwrap();
        assert_eq!(plain, rated);
    }

    #[test]
    fn nominal_rating_decode_pins_first_intercept() {
        // nfact=1, ncat=3: [a, ak0..ak2, d0..d2, t]; d0's slot is not read.
        let par = [1.0, 0.0, 1.0, 2.0, 99.0, -0.5, -1.5, 0.25];
        let p = NominalParams::decode(&par, 1, 3, true).unwrap();
        assert_eq!(p.scaling, vec![0.0, 1.0, 2.0]);
        assert_eq!(p.intercepts, vec![0.0, -0.25, -1.25]);
    }

    #[test]
    fn nested_decode_fixes_distractor_slopes_at_one() {
        let par = [0.8, -0.2, -30.0, 30.0, 0.0, 1.0, 0.3, -0.3];
        let p = NestedParams::decode(&par, 1, 3, 1).unwrap();
        assert_eq!(p.dich.slopes, vec![0.8]);
        assert_eq!(p.nominal.slopes, vec![1.0]);
        assert_eq!(p.nominal.scaling, vec![0.0, 1.0]);
        assert_eq!(p.nominal.intercepts, vec![0.3, -0.3]);
        assert_eq!(p.correct, 1);
    }

    #[test]
    fn nested_decode_validates_correct_index() {
        let par = [0.8, -0.2, -30.0, 30.0, 0.0, 1.0, 0.3, -0.3];
        assert!(matches!(
            NestedParams::decode(&par, 1, 3, 3),
            Err(TraceError::CorrectOutOfRange { correct: 3, ncat: 3 })
        ));
        assert!(matches!(
            ItemModel::decode(ItemFamily::NestLogit, &par, 1, 3, None),
            Err(TraceError::MissingCorrect)
        ));
    }

    #[test]
    fn comp_decode_pairs_slopes_and_intercepts() {
        let p = CompParams::decode(&[1.0, 0.5, -0.3, 0.2, -1.5], 2).unwrap();
        assert_eq!(p.slopes, vec![1.0, 0.5]);
        assert_eq!(p.intercepts, vec![-0.3, 0.2]);
        assert_eq!(p.logit_g, -1.5);
    }

    #[test]
    fn model_decode_checks_declared_category_count() {
        let par = [1.0, 0.0, -30.0, 30.0];
        assert!(matches!(
            ItemModel::decode(ItemFamily::Dich, &par, 1, 3, None),
            Err(TraceError::CategoryCount { expected: 2, got: 3, .. })
        ));
    }

    #[test]
    fn model_ncat_matches_decode() {
        let graded = ItemModel::decode(ItemFamily::Graded, &[1.0, 1.0, 0.0, -1.0], 1, 4, None)
            .unwrap();
        assert_eq!(graded.ncat(), 4);
        let gpcm =
            ItemModel::decode(ItemFamily::Gpcm, &[1.0, 0.0, 1.0, 2.0, 0.0, -0.5, -1.0], 1, 3, None)
                .unwrap();
        assert_eq!(gpcm.ncat(), 3);
        let custom = ItemModel::decode(ItemFamily::Custom, &[], 1, 5, None).unwrap();
        assert_eq!(custom.ncat(), 5);
    }
}
