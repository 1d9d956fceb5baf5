//! PCA model construction (C2): the SVD and eig back-ends that turn a
//! preprocessed calibration matrix into loadings, scores and residual
//! eigenvalues, plus the [`Model`] snapshot the sensor façade publishes.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SensorError};
use crate::linalg::{self, PrepMode};

/// A fully calibrated PCA model, as published by [`crate::sensor::Sensor`].
/// Immutable once built; a new calibration produces a new `Model` rather
/// than mutating this one, so readers holding an `Arc<Model>` never
/// observe a half-updated state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub avg: Vec<f64>,
    pub sd: Vec<f64>,
    pub n: f64,
    pub loadings: Vec<Vec<f64>>, // M x A, row-major
    pub eigenvalues: Vec<f64>,
    /// Residual (non-principal) eigenvalues, used by the Q UCL formula.
    pub residual_eigenvalues: Vec<f64>,
    pub ucl_q: f64,
    pub ucl_d: f64,
    pub lv: usize,
    pub alpha: f64,
    pub phase: u8,
    pub prep: u8,
    pub lambda: f64,
    /// Incrementally-maintained `X^T X` (M x A... actually M x M), carried
    /// between dynamic recalibrations so the `eig` back-end never needs
    /// the full observation history.
    pub xx: Vec<Vec<f64>>,
    pub calibrated_at: String,
}

impl Model {
    pub fn m(&self) -> usize {
        self.avg.len()
    }

    pub fn loadings_matrix(&self) -> DMatrix<f64> {
        let rows = self.loadings.len();
        let cols = self.loadings.first().map(|r| r.len()).unwrap_or(0);
        DMatrix::from_fn(rows, cols, |i, j| self.loadings[i][j])
    }

    pub fn xx_matrix(&self) -> DMatrix<f64> {
        let n = self.xx.len();
        DMatrix::from_fn(n, n, |i, j| self.xx[i][j])
    }
}

fn matrix_to_rows(m: &DMatrix<f64>) -> Vec<Vec<f64>> {
    (0..m.nrows()).map(|i| (0..m.ncols()).map(|j| m[(i, j)]).collect()).collect()
}

/// Builds loadings/scores/eigenvalues from `xcs` via the SVD back-end:
/// `T = U*S[:, :a]`, `P = V[:, :a]`.
pub fn build_svd(xcs: &DMatrix<f64>, a: usize) -> Result<(DMatrix<f64>, DMatrix<f64>, Vec<f64>)> {
    let svd = linalg::svd(xcs)?;
    let a = a.min(svd.s.len()).min(xcs.ncols());
    let p = svd.v.columns(0, a).into_owned();
    let t = DMatrix::from_fn(xcs.nrows(), a, |i, j| svd.u[(i, j)] * svd.s[j]);
    let eigenvalues: Vec<f64> = svd.s.iter().map(|s| s * s).collect();
    Ok((t, p, eigenvalues))
}

/// Builds loadings/scores/eigenvalues from `xx = xcs^T * xcs` via the
/// `eig` back-end, used by dynamic recalibration where `xx` is
/// maintained incrementally rather than recomputed from scratch.
pub fn build_eig(xcs: &DMatrix<f64>, xx: &DMatrix<f64>, a: usize) -> Result<(DMatrix<f64>, DMatrix<f64>, Vec<f64>)> {
    let (eigenvalues, eigenvectors) = linalg::eig_sorted(xx)?;
    let a = a.min(eigenvectors.ncols());
    let p = eigenvectors.columns(0, a).into_owned();
    let t = xcs * &p;
    Ok((t, p, eigenvalues))
}

/// Residual eigenvalues: everything past the kept `A` components,
/// feeding the Jackson-Mudholkar UCLq formula (theta_1..3).
pub fn residual_eigenvalues(all: &[f64], a: usize) -> Vec<f64> {
    all.iter().skip(a).copied().filter(|v| *v > 0.0).collect()
}

/// Static calibration entry point: validates shape (N>=2, M>=2), builds
/// the SVD-backed model and its UCLs.
pub fn calibrate_static(
    x: &DMatrix<f64>,
    lv: usize,
    prep: u8,
    phase: u8,
    alpha: f64,
    now: &str,
) -> Result<Model> {
    let (n, m) = x.shape();
    if n < 2 || m < 2 {
        return Err(SensorError::InvalidInput(format!(
            "calibration requires N>=2 and M>=2, got N={n} M={m}"
        )));
    }
    let mode = PrepMode::from_u8(prep)?;
    let pre = linalg::preprocess_static(x, mode);
    // `t` (scores) only feeds the UCL derivation below; the snapshot
    // retains loadings and residual eigenvalues, not the scores matrix.
    let (_t, p, eigenvalues) = build_svd(&pre.xcs, lv)?;
    let residual = residual_eigenvalues(&eigenvalues, p.ncols());
    let ucl_q = crate::mspc::compute_ucl_q(&residual, alpha);
    let ucl_d = crate::mspc::compute_ucl_d(n, p.ncols(), alpha, phase);
    let xx = &pre.xcs.transpose() * &pre.xcs;

    Ok(Model {
        avg: pre.avg,
        sd: pre.sd,
        n: n as f64,
        loadings: matrix_to_rows(&p),
        eigenvalues: eigenvalues.clone(),
        residual_eigenvalues: residual,
        ucl_q,
        ucl_d,
        lv: p.ncols(),
        alpha,
        phase,
        prep,
        lambda: 1.0,
        xx: matrix_to_rows(&xx),
        calibrated_at: now.to_string(),
    })
}

/// Dynamic recalibration entry point: requires N>=1, M>=1, maintains
/// `xx` as `lambda*xx_prev + xcs^T*xcs`, and rebuilds via the `eig`
/// back-end.
pub fn calibrate_dynamic(
    x_new: &DMatrix<f64>,
    prev: &Model,
    lambda: f64,
    now: &str,
) -> Result<Model> {
    let (n_new, m) = x_new.shape();
    if n_new < 1 || m < 1 {
        return Err(SensorError::InvalidInput(format!(
            "dynamic calibration requires N>=1 and M>=1, got N={n_new} M={m}"
        )));
    }
    let mode = PrepMode::from_u8(prev.prep)?;
    let dyn_state = linalg::DynamicState { avg: prev.avg.clone(), sd: prev.sd.clone(), n: prev.n };
    let (xcs, new_state) = linalg::preprocess_dynamic(x_new, mode, lambda, &dyn_state);

    let xx_prev = prev.xx_matrix();
    let xx_new = lambda * xx_prev + &xcs.transpose() * &xcs;

    let (_t, p, eigenvalues) = build_eig(&xcs, &xx_new, prev.lv)?;
    let residual = residual_eigenvalues(&eigenvalues, p.ncols());
    let ucl_q = crate::mspc::compute_ucl_q(&residual, prev.alpha);
    let ucl_d = crate::mspc::compute_ucl_d(new_state.n.round().max(2.0) as usize, p.ncols(), prev.alpha, prev.phase);

    Ok(Model {
        avg: new_state.avg,
        sd: new_state.sd,
        n: new_state.n,
        loadings: matrix_to_rows(&p),
        eigenvalues: eigenvalues.clone(),
        residual_eigenvalues: residual,
        ucl_q,
        ucl_d,
        lv: p.ncols(),
        alpha: prev.alpha,
        phase: prev.phase,
        prep: prev.prep,
        lambda,
        xx: matrix_to_rows(&xx_new),
        calibrated_at: now.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ones(n: usize, m: usize) -> DMatrix<f64> {
        DMatrix::from_element(n, m, 1.0)
    }

    #[test]
    fn identity_calibration_yields_tiny_ucl_q() {
        let x = ones(10, 4);
        let model = calibrate_static(&x, 2, 0, 2, 0.01, "t0").unwrap();
        assert!(model.ucl_q < 1e-6, "ucl_q = {}", model.ucl_q);
    }

    #[test]
    fn calibration_rejects_undersized_matrix() {
        let x = DMatrix::from_element(1, 1, 1.0);
        assert!(calibrate_static(&x, 1, 2, 2, 0.01, "t0").is_err());
    }

    #[test]
    fn loadings_are_orthonormal() {
        let mut data = vec![];
        for i in 0..20 {
            data.push((i as f64).sin());
            data.push((i as f64).cos());
            data.push(i as f64 * 0.1);
        }
        let x = DMatrix::from_row_slice(20, 3, &data);
        let model = calibrate_static(&x, 2, 2, 2, 0.01, "t0").unwrap();
        let p = model.loadings_matrix();
        let gram = p.transpose() * &p;
        for i in 0..gram.nrows() {
            for j in 0..gram.ncols() {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((gram[(i, j)] - expected).abs() < 1e-6);
            }
        }
    }
}
