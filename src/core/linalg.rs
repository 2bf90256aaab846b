//! Least-squares helpers shared by the orbital correctors

use crate::types::{IfgError, IfgResult};
use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2, ArrayView1};
use num_traits::Float;
use std::cmp::Ordering;

/// Relative cutoff for small singular values in the pseudo-inverse
pub const PINV_RCOND: f64 = 1e-6;

/// Solve `design * x = observations` in the least-squares sense through the
/// Moore-Penrose pseudo-inverse.
///
/// Rows whose observation is NaN are dropped before solving. Singular values
/// below `rcond * max(singular values)` are treated as zero.
pub fn pinv_solve(
    design: &Array2<f32>,
    observations: ArrayView1<f32>,
    rcond: f64,
) -> IfgResult<Array1<f64>> {
    if design.nrows() != observations.len() {
        return Err(IfgError::Validation(format!(
            "Design matrix has {} rows but {} observations were given",
            design.nrows(),
            observations.len()
        )));
    }

    let valid: Vec<usize> = observations
        .iter()
        .enumerate()
        .filter(|(_, v)| !v.is_nan())
        .map(|(i, _)| i)
        .collect();

    if valid.is_empty() {
        return Err(IfgError::Computation(
            "No valid (non-NaN) observations to fit".to_string(),
        ));
    }

    let ncols = design.ncols();
    let a = DMatrix::<f64>::from_fn(valid.len(), ncols, |r, c| design[[valid[r], c]] as f64);
    let b = DVector::<f64>::from_iterator(valid.len(), valid.iter().map(|&i| observations[i] as f64));

    log::debug!("Solving {}x{} least-squares system", a.nrows(), a.ncols());

    let svd = a.svd(true, true);
    let eps = rcond * svd.singular_values.max();
    let x = svd
        .solve(&b, eps)
        .map_err(|e| IfgError::Computation(format!("Pseudo-inverse solve failed: {}", e)))?;

    if x.iter().any(|v| !v.is_finite()) {
        return Err(IfgError::Computation(
            "Pseudo-inverse solve produced non-finite model parameters".to_string(),
        ));
    }

    Ok(Array1::from_iter(x.iter().copied()))
}

/// Ratio of the largest to the smallest singular value (2-norm condition number)
pub fn condition_number(design: &Array2<f32>) -> f64 {
    let (rows, cols) = design.dim();
    if rows == 0 || cols == 0 {
        return f64::NAN;
    }
    let a = DMatrix::<f64>::from_fn(rows, cols, |r, c| design[[r, c]] as f64);
    let sv = a.singular_values();
    let max = sv.max();
    let min = sv.min();
    if min == 0.0 {
        f64::INFINITY
    } else {
        max / min
    }
}

/// Median of the non-NaN values; NaN when no value is valid
pub fn nanmedian<F: Float>(values: impl IntoIterator<Item = F>) -> F {
    let mut valid: Vec<F> = values.into_iter().filter(|v| !v.is_nan()).collect();
    if valid.is_empty() {
        return F::nan();
    }
    valid.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));

    let n = valid.len();
    if n % 2 == 1 {
        valid[n / 2]
    } else {
        (valid[n / 2 - 1] + valid[n / 2]) / (F::one() + F::one())
    }
}
