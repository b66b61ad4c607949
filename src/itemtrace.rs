//! Batch assembly of per-item trace lines into one item-blocked matrix.
//!
//! The outer estimator calls this once per EM iteration: every item in the
//! test form is evaluated on the shared trait grid and its category
//! probability block is packed into a single `(n_points, total categories)`
//! matrix, column-blocked in item order. Items are independent, so the
//! per-item loop runs in parallel; each block lands in its own column
//! window taken from the location index, so writes can never overlap.

use ndarray::{s, Array2, ArrayView2};
use numpy::{PyArray2, PyReadonlyArray2, ToPyArray};
use pyo3::prelude::*;
use rayon::prelude::*;

use crate::items::{ItemFamily, ItemModel, TraceError};

/// Column offsets of each item's block inside the assembled trace matrix.
/// Built from the per-item category counts, so the offsets are contiguous
/// and strictly increasing by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemLoc {
    starts: Vec<usize>,
}

impl ItemLoc {
    pub fn from_ncats(ncats: &[usize]) -> Self {
        let mut starts = Vec::with_capacity(ncats.len() + 1);
        let mut acc = 0;
        starts.push(0);
        for &c in ncats {
            acc += c;
            starts.push(acc);
        }
        Self { starts }
    }

    /// Column window owned by `item` in the assembled matrix.
    pub fn span(&self, item: usize) -> std::ops::Range<usize> {
        self.starts[item]..self.starts[item + 1]
    }

    /// Total category count across all items.
    pub fn total(&self) -> usize {
        self.starts.last().copied().unwrap_or(0)
    }
}

/// One test item: its decoded model, declared category count, and optional
/// fixed-design covariate block prepended to the trait grid.
#[derive(Debug, Clone)]
pub struct Item {
    model: ItemModel,
    ncat: usize,
    fixed_design: Option<Array2<f64>>,
}

impl Item {
    /// Decode a flat item descriptor. `nfact` is the column count of the
    /// shared trait grid; the model's slopes cover the fixed-design columns
    /// first, then the trait dimensions.
    pub fn new(
        family: ItemFamily,
        ncat: usize,
        par: &[f64],
        correct: Option<usize>,
        fixed_design: Option<Array2<f64>>,
        nfact: usize,
    ) -> Result<Self, TraceError> {
        let nfact2 = nfact + fixed_design.as_ref().map_or(0, |fd| fd.ncols());
        let model = ItemModel::decode(family, par, nfact2, ncat, correct)?;
        Ok(Self {
            model,
            ncat,
            fixed_design,
        })
    }

    pub fn ncat(&self) -> usize {
        self.ncat
    }

    pub fn model(&self) -> &ItemModel {
        &self.model
    }

    /// Trace lines for this item, augmenting the trait grid with the item's
    /// fixed covariate columns when present.
    pub fn trace(
        &self,
        theta: ArrayView2<f64>,
        ot: Option<&[f64]>,
    ) -> Result<Array2<f64>, TraceError> {
        let n = theta.nrows();
        let ot = self.route_offset(ot)?;
        let block = match &self.fixed_design {
            Some(fd) => {
                if fd.nrows() != n {
                    return Err(TraceError::FixedDesignRows {
                        got: fd.nrows(),
                        expected: n,
                    });
                }
                let mut aug = Array2::zeros((n, fd.ncols() + theta.ncols()));
                aug.slice_mut(s![.., ..fd.ncols()]).assign(fd);
                aug.slice_mut(s![.., fd.ncols()..]).assign(&theta);
                self.model.trace(aug.view(), ot)
            }
            None => self.model.trace(theta, ot),
        };
        Ok(block)
    }

    // The dichotomous and graded families read the offset per evaluation
    // point, the nominal family per category (only its first ncat entries
    // of an item's offset column are meaningful); the rest take none.
    fn route_offset<'a>(&self, ot: Option<&'a [f64]>) -> Result<Option<&'a [f64]>, TraceError> {
        let Some(ot) = ot else { return Ok(None) };
        match &self.model {
            ItemModel::Dich(_) | ItemModel::Graded(_) => Ok(Some(ot)),
            ItemModel::Nominal(_) => {
                if ot.len() < self.ncat {
                    return Err(TraceError::OffsetLength {
                        got: ot.len(),
                        expected: self.ncat,
                    });
                }
                Ok(Some(&ot[..self.ncat]))
            }
            _ => Ok(None),
        }
    }
}

/// Evaluate every item and pack the per-item probability blocks, in item
/// order, into one `(n_points, total categories)` matrix.
///
/// `offterm`, when present, is `(n_points, n_items)`: column `j` is item
/// `j`'s additive offset. Custom-family items contribute a zero block.
pub fn assemble_trace(
    items: &[Item],
    theta: ArrayView2<f64>,
    offterm: Option<ArrayView2<f64>>,
) -> Result<Array2<f64>, TraceError> {
    let n = theta.nrows();
    if let Some(off) = offterm {
        if off.nrows() != n || off.ncols() != items.len() {
            return Err(TraceError::OfftermShape {
                rows: off.nrows(),
                cols: off.ncols(),
                n,
                nitems: items.len(),
            });
        }
    }

    let ncats: Vec<usize> = items.iter().map(Item::ncat).collect();
    let loc = ItemLoc::from_ncats(&ncats);

    let blocks = items
        .par_iter()
        .enumerate()
        .map(|(j, item)| {
            let ot = offterm.map(|o| o.column(j).to_vec());
            item.trace(theta, ot.as_deref())
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Array2::zeros((n, loc.total()));
    for (j, block) in blocks.iter().enumerate() {
        out.slice_mut(s![.., loc.span(j)]).assign(block);
    }
    Ok(out)
}

/// Trace lines for a whole test form.
///
/// # Arguments
/// * `theta` - (n_points, nfact) latent trait grid
/// * `itemclass` - model family code per item (1=dich, 2=graded, 3=gpcm,
///   4=nominal, 5=graded rating scale, 6=nominal rating scale, 7=partially
///   compensatory, 8=nested logit, 9=custom/host-evaluated)
/// * `ncat` - category count per item
/// * `params` - flat parameter vector per item
/// * `correct` - 0-based correct category per item (nested-logit items only)
/// * `fixed_design` - optional (n_points, k) covariate block per item,
///   prepended to the trait grid for that item
/// * `offterm` - optional (n_points, n_items) additive offset matrix
///
/// # Returns
/// (n_points, total categories) trace matrix, column-blocked by item
#[pyfunction]
#[pyo3(signature = (theta, itemclass, ncat, params, correct=None, fixed_design=None, offterm=None))]
#[allow(clippy::too_many_arguments)]
pub fn compute_item_trace<'py>(
    py: Python<'py>,
    theta: PyReadonlyArray2<'py, f64>,
    itemclass: Vec<i32>,
    ncat: Vec<usize>,
    params: Vec<Vec<f64>>,
    correct: Option<Vec<Option<usize>>>,
    fixed_design: Option<Vec<Option<PyReadonlyArray2<'py, f64>>>>,
    offterm: Option<PyReadonlyArray2<'py, f64>>,
) -> PyResult<Bound<'py, PyArray2<f64>>> {
    let nitems = itemclass.len();
    check_count("ncat", ncat.len(), nitems)?;
    check_count("params", params.len(), nitems)?;
    if let Some(v) = &correct {
        check_count("correct", v.len(), nitems)?;
    }
    if let Some(v) = &fixed_design {
        check_count("fixed_design", v.len(), nitems)?;
    }

    let theta = theta.as_array().to_owned();
    let nfact = theta.ncols();

    let mut items = Vec::with_capacity(nitems);
    for j in 0..nitems {
        let family = ItemFamily::from_code(itemclass[j])?;
        let fd = fixed_design
            .as_ref()
            .and_then(|v| v[j].as_ref())
            .map(|a| a.as_array().to_owned());
        let corr = correct.as_ref().and_then(|v| v[j]);
        items.push(Item::new(family, ncat[j], &params[j], corr, fd, nfact)?);
    }

    // a 0- or 1-row offterm matrix disables the offsets, like a short ot
    let offterm = offterm
        .map(|o| o.as_array().to_owned())
        .filter(|o| o.nrows() > 1);

    let out = py.allow_threads(|| {
        assemble_trace(&items, theta.view(), offterm.as_ref().map(|o| o.view()))
    })?;
    Ok(out.to_pyarray(py))
}

fn check_count(what: &'static str, got: usize, expected: usize) -> Result<(), TraceError> {
    if got != expected {
        return Err(TraceError::DescriptorCount {
            what,
            got,
            expected,
        });
    }
    Ok(())
}

/// Register batch assembly functions with the Python module
pub fn register(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(compute_item_trace, m)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::items::{DichParams, GradedParams, NominalParams};
    use crate::traces::{dich_trace, graded_trace, nominal_trace, GradedOutput, NominalOutput};
    use crate::utils::sigmoid;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};

    fn theta_grid() -> Array2<f64> {
        array![[-1.5], [-0.5], [0.5], [1.5]]
    }

    #[test]
    fn location_index_is_contiguous() {
        let loc = ItemLoc::from_ncats(&[2, 3, 2]);
        assert_eq!(loc.span(0), 0..2);
        assert_eq!(loc.span(1), 2..5);
        assert_eq!(loc.span(2), 5..7);
        assert_eq!(loc.total(), 7);
        assert_eq!(ItemLoc::from_ncats(&[]).total(), 0);
    }

    #[test]
    fn assembled_blocks_match_single_item_traces() {
        let theta = theta_grid();
        let dich_par = [1.0, 0.0, -30.0, 30.0];
        let graded_par = [0.9, 1.0, -1.0];
        let nominal_par = [1.1, 0.0, 1.0, 2.0, 0.0, 0.4, -0.6];

        let items = vec![
            Item::new(ItemFamily::Dich, 2, &dich_par, None, None, 1).unwrap(),
            Item::new(ItemFamily::Graded, 3, &graded_par, None, None, 1).unwrap(),
            Item::new(ItemFamily::Nominal, 3, &nominal_par, None, None, 1).unwrap(),
        ];
        let trace = assemble_trace(&items, theta.view(), None).unwrap();
        assert_eq!(trace.shape(), &[4, 8]);

        let dich = dich_trace(
            &DichParams::decode(&dich_par, 1).unwrap(),
            theta.view(),
            None,
        );
        let graded = graded_trace(
            &GradedParams::decode(&graded_par, 1, 3, false).unwrap(),
            theta.view(),
            None,
            GradedOutput::Categories,
        );
        let nominal = nominal_trace(
            &NominalParams::decode(&nominal_par, 1, 3, false).unwrap(),
            theta.view(),
            None,
            NominalOutput::Probabilities,
        );
        assert_eq!(trace.slice(s![.., 0..2]), dich);
        assert_eq!(trace.slice(s![.., 2..5]), graded);
        assert_eq!(trace.slice(s![.., 5..8]), nominal);
    }

    #[test]
    fn custom_items_leave_zero_windows() {
        let theta = theta_grid();
        let items = vec![
            Item::new(ItemFamily::Dich, 2, &[1.0, 0.0, -30.0, 30.0], None, None, 1).unwrap(),
            Item::new(ItemFamily::Custom, 4, &[], None, None, 1).unwrap(),
        ];
        let trace = assemble_trace(&items, theta.view(), None).unwrap();
        assert_eq!(trace.shape(), &[4, 6]);
        assert!(trace.slice(s![.., 2..6]).iter().all(|&x| x == 0.0));
        for i in 0..4 {
            assert_abs_diff_eq!(trace.slice(s![i, 0..2]).sum(), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn fixed_design_columns_come_first() {
        let theta = theta_grid();
        let fd = Array2::from_elem((4, 1), 1.0);
        // slopes: fixed covariate first, trait dimension second
        let par = [0.5, 1.0, 0.0, -30.0, 30.0];
        let item = Item::new(ItemFamily::Dich, 2, &par, None, Some(fd), 1).unwrap();
        let p = item.trace(theta.view(), None).unwrap();
        for i in 0..4 {
            let z = 0.5 + theta[[i, 0]];
            assert_abs_diff_eq!(p[[i, 1]], sigmoid(z), epsilon = 1e-10);
        }
    }

    #[test]
    fn fixed_design_row_mismatch_is_an_error() {
        let theta = theta_grid();
        let fd = Array2::from_elem((3, 1), 1.0);
        let par = [0.5, 1.0, 0.0, -30.0, 30.0];
        let item = Item::new(ItemFamily::Dich, 2, &par, None, Some(fd), 1).unwrap();
        assert!(matches!(
            item.trace(theta.view(), None),
            Err(TraceError::FixedDesignRows {
                got: 3,
                expected: 4
            })
        ));
    }

    #[test]
    fn offterm_columns_route_per_item() {
        let theta = theta_grid();
        let par = [1.0, 0.25, -30.0, 30.0];
        let items = vec![
            Item::new(ItemFamily::Dich, 2, &par, None, None, 1).unwrap(),
            Item::new(ItemFamily::Dich, 2, &par, None, None, 1).unwrap(),
        ];
        let mut offterm = Array2::zeros((4, 2));
        offterm.column_mut(0).fill(0.5);
        let trace = assemble_trace(&items, theta.view(), Some(offterm.view())).unwrap();
        for i in 0..4 {
            let z = theta[[i, 0]] + 0.25;
            assert_abs_diff_eq!(trace[[i, 1]], sigmoid(z + 0.5), epsilon = 1e-10);
            assert_abs_diff_eq!(trace[[i, 3]], sigmoid(z), epsilon = 1e-10);
        }
    }

    #[test]
    fn nominal_items_read_offsets_per_category() {
        let theta = theta_grid();
        let par = [1.1, 0.0, 1.0, 2.0, 0.0, 0.4, -0.6];
        let items = vec![Item::new(ItemFamily::Nominal, 3, &par, None, None, 1).unwrap()];
        // constant per-category shift cancels in the softmax, whatever the
        // trailing rows of the column hold
        let offterm = Array2::from_elem((4, 1), 0.7);
        let shifted = assemble_trace(&items, theta.view(), Some(offterm.view())).unwrap();
        let base = assemble_trace(&items, theta.view(), None).unwrap();
        for (a, b) in shifted.iter().zip(base.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
        }
    }

    #[test]
    fn offterm_shape_is_validated() {
        let theta = theta_grid();
        let items = vec![
            Item::new(ItemFamily::Dich, 2, &[1.0, 0.0, -30.0, 30.0], None, None, 1).unwrap(),
        ];
        let offterm = Array2::zeros((4, 3));
        assert!(matches!(
            assemble_trace(&items, theta.view(), Some(offterm.view())),
            Err(TraceError::OfftermShape { cols: 3, .. })
        ));
    }

    #[test]
    fn nested_items_assemble_with_correct_category() {
        let theta = theta_grid();
        let par = [0.8, -0.2, -30.0, 30.0, 0.0, 1.0, 0.3, -0.3];
        let items =
            vec![Item::new(ItemFamily::NestLogit, 3, &par, Some(1), None, 1).unwrap()];
        let trace = assemble_trace(&items, theta.view(), None).unwrap();
        assert_eq!(trace.shape(), &[4, 3]);
        for i in 0..4 {
            assert_abs_diff_eq!(trace.row(i).sum(), 1.0, epsilon = 1e-12);
        }
    }
}
