//! Preprocessing and linear algebra primitives (C1): mean-centering,
//! auto-scaling (static and EWMA), SVD, and symmetric eigendecomposition.
//!
//! `nalgebra::DMatrix<f64>` is the calibration-matrix representation used
//! throughout this crate; `SVD` and `SymmetricEigen` back the two
//! decompositions PCA needs.

use nalgebra::DMatrix;

use crate::error::{Result, SensorError};

/// Preprocessing mode for [`preprocess_static`] / [`apply_preprocess`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PrepMode {
    /// No transformation.
    Identity = 0,
    /// Subtract the per-column mean only.
    MeanCenter = 1,
    /// Subtract the mean then divide by the unbiased per-column standard deviation.
    AutoScale = 2,
    /// Divide by the standard deviation only (no centering).
    ScaleOnly = 3,
}

impl PrepMode {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(PrepMode::Identity),
            1 => Ok(PrepMode::MeanCenter),
            2 => Ok(PrepMode::AutoScale),
            3 => Ok(PrepMode::ScaleOnly),
            other => Err(SensorError::InvalidInput(format!("unknown prep mode {other}"))),
        }
    }
}

/// Result of static preprocessing: the centered/scaled matrix plus the
/// per-column statistics needed to preprocess future rows the same way.
pub struct StaticPreprocess {
    pub xcs: DMatrix<f64>,
    pub avg: Vec<f64>,
    pub sd: Vec<f64>,
}

/// Replaces a zero standard deviation the way the reference derivation
/// does: `sqrt(1 / (2*count_observed - 1))`, falling back to 1.0 when
/// fewer than one observation was seen (degenerate column).
fn zero_sd_replacement(count_observed: usize) -> f64 {
    if count_observed <= 1 {
        return 1.0;
    }
    (1.0 / (2.0 * count_observed as f64 - 1.0)).sqrt()
}

/// Static preprocessing over a full calibration matrix. NaN entries are
/// excluded from the column statistics (treated as missing).
pub fn preprocess_static(x: &DMatrix<f64>, mode: PrepMode) -> StaticPreprocess {
    let (n, m) = x.shape();
    let mut avg = vec![0.0; m];
    let mut sd = vec![1.0; m];

    if mode != PrepMode::Identity {
        for j in 0..m {
            let col: Vec<f64> = (0..n).map(|i| x[(i, j)]).filter(|v| !v.is_nan()).collect();
            let count = col.len();
            let mean = if count > 0 { col.iter().sum::<f64>() / count as f64 } else { 0.0 };
            avg[j] = if matches!(mode, PrepMode::MeanCenter | PrepMode::AutoScale) { mean } else { 0.0 };

            if matches!(mode, PrepMode::AutoScale | PrepMode::ScaleOnly) {
                let variance = if count > 1 {
                    col.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (count as f64 - 1.0)
                } else {
                    0.0
                };
                let s = variance.sqrt();
                sd[j] = if s > 0.0 { s } else { zero_sd_replacement(count) };
            }
        }
    }

    let xcs = DMatrix::from_fn(n, m, |i, j| (x[(i, j)] - avg[j]) / sd[j]);
    StaticPreprocess { xcs, avg, sd }
}

/// Applies previously-computed statistics to new rows: `(x - avg) / sd`.
pub fn apply_preprocess(x: &DMatrix<f64>, avg: &[f64], sd: &[f64]) -> DMatrix<f64> {
    DMatrix::from_fn(x.nrows(), x.ncols(), |i, j| (x[(i, j)] - avg[j]) / sd[j])
}

/// Running state carried between calls to [`preprocess_dynamic`].
#[derive(Debug, Clone)]
pub struct DynamicState {
    pub avg: Vec<f64>,
    pub sd: Vec<f64>,
    pub n: f64,
}

/// EWMA update of the running mean/standard-deviation given a new batch
/// `x_new`, matching the order of operations in the reference derivation:
/// `N` is advanced to `lambda*N_prev + rows(x_new)` *before* it is used
/// as the denominator for the new average and scale.
pub fn preprocess_dynamic(
    x_new: &DMatrix<f64>,
    mode: PrepMode,
    lambda: f64,
    prev: &DynamicState,
) -> (DMatrix<f64>, DynamicState) {
    let (rows, m) = x_new.shape();
    let n_prev = prev.n;
    let n = lambda * n_prev + rows as f64;

    let mut avg = prev.avg.clone();
    let mut sd = prev.sd.clone();

    if mode != PrepMode::Identity {
        for j in 0..m {
            let sum_new: f64 = (0..rows).map(|i| x_new[(i, j)]).filter(|v| !v.is_nan()).sum();
            let m_prev = prev.avg[j] * n_prev;
            let m_total = lambda * m_prev + sum_new;
            let new_avg = if matches!(mode, PrepMode::MeanCenter | PrepMode::AutoScale) {
                if n > 0.0 { m_total / n } else { 0.0 }
            } else {
                0.0
            };

            if matches!(mode, PrepMode::AutoScale | PrepMode::ScaleOnly) {
                let s_prev = prev.sd[j].powi(2) * (n_prev - 1.0).max(0.0);
                let s_new: f64 = (0..rows)
                    .map(|i| x_new[(i, j)])
                    .filter(|v| !v.is_nan())
                    .map(|v| (v - new_avg).powi(2))
                    .sum();
                let s_total = lambda * s_prev + s_new;
                let variance = if n > 1.0 { s_total / (n - 1.0) } else { 0.0 };
                sd[j] = variance.sqrt();
            }
            avg[j] = new_avg;
        }

        let min_nonzero = sd.iter().copied().filter(|v| *v > 0.0).fold(f64::INFINITY, f64::min);
        let fallback = if min_nonzero.is_finite() { min_nonzero / 2.0 } else { 1.0 };
        for s in sd.iter_mut() {
            if *s <= 0.0 {
                *s = fallback;
            }
        }
    }

    let xcs = apply_preprocess(x_new, &avg, &sd);
    (xcs, DynamicState { avg, sd, n })
}

pub struct SvdResult {
    pub u: DMatrix<f64>,
    pub s: Vec<f64>,
    pub v: DMatrix<f64>,
}

/// Thin SVD of `a` (`a = u * diag(s) * v^T`).
pub fn svd(a: &DMatrix<f64>) -> Result<SvdResult> {
    let svd = a.clone().svd(true, true);
    let u = svd.u.ok_or_else(|| SensorError::NumericFailure("SVD did not produce U".into()))?;
    let v_t = svd.v_t.ok_or_else(|| SensorError::NumericFailure("SVD did not produce V^T".into()))?;
    Ok(SvdResult { u, s: svd.singular_values.iter().copied().collect(), v: v_t.transpose() })
}

/// Eigenpairs of a symmetric matrix, sorted by `|lambda|` descending.
/// Any residual imaginary component from numerical round-off is dropped
/// (nalgebra's `SymmetricEigen` is already real-valued by construction,
/// but we still guard against NaNs leaking through a near-singular input).
pub fn eig_sorted(a: &DMatrix<f64>) -> Result<(Vec<f64>, DMatrix<f64>)> {
    if a.nrows() != a.ncols() {
        return Err(SensorError::InvalidInput("eig_sorted requires a square matrix".into()));
    }
    let eig = nalgebra::linalg::SymmetricEigen::new(a.clone());
    let mut idx: Vec<usize> = (0..eig.eigenvalues.len()).collect();
    idx.sort_by(|&i, &j| {
        eig.eigenvalues[j].abs().partial_cmp(&eig.eigenvalues[i].abs()).unwrap_or(std::cmp::Ordering::Equal)
    });

    let values: Vec<f64> = idx.iter().map(|&i| eig.eigenvalues[i]).collect();
    let vectors = DMatrix::from_fn(a.nrows(), idx.len(), |r, c| eig.eigenvectors[(r, idx[c])]);
    Ok((values, vectors))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_mode_leaves_matrix_untouched() {
        let x = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let out = preprocess_static(&x, PrepMode::Identity);
        assert_eq!(out.xcs, x);
        assert_eq!(out.avg, vec![0.0, 0.0]);
        assert_eq!(out.sd, vec![1.0, 1.0]);
    }

    #[test]
    fn autoscale_mode_produces_zero_mean_unit_like_scale() {
        let x = DMatrix::from_row_slice(4, 1, &[1.0, 2.0, 3.0, 4.0]);
        let out = preprocess_static(&x, PrepMode::AutoScale);
        let mean: f64 = out.xcs.iter().sum::<f64>() / 4.0;
        assert!(mean.abs() < 1e-9);
    }

    #[test]
    fn zero_variance_column_gets_finite_replacement() {
        let x = DMatrix::from_row_slice(3, 1, &[5.0, 5.0, 5.0]);
        let out = preprocess_static(&x, PrepMode::AutoScale);
        assert!(out.sd[0].is_finite());
        assert!(out.sd[0] > 0.0);
        assert!(out.xcs.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn eig_sorted_orders_by_absolute_value() {
        let a = DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 0.0, -5.0]);
        let (values, _) = eig_sorted(&a).unwrap();
        assert!(values[0].abs() >= values[1].abs());
    }

    #[test]
    fn svd_reconstructs_original_matrix() {
        let a = DMatrix::from_row_slice(3, 2, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let result = svd(&a).unwrap();
        let s = DMatrix::from_diagonal(&nalgebra::DVector::from_vec(result.s.clone()));
        let reconstructed = &result.u.columns(0, s.nrows()) * &s * result.v.transpose();
        for (a, b) in a.iter().zip(reconstructed.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }
}
