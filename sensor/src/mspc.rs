//! Multivariate statistical process control (C2): Q/D statistics for a
//! monitored row, their upper control limits, and the oMEDA diagnosis
//! vector.

use nalgebra::{DMatrix, DVector};
use statrs::distribution::{Beta, ContinuousCDF, FisherSnedecor, Normal};

use crate::error::{Result, SensorError};
use crate::model::Model;

/// Q (squared prediction error) and D (Hotelling's T^2) for one
/// preprocessed row `x_cs` against a calibrated model.
pub struct Statistics {
    pub q: f64,
    pub d: f64,
}

/// Computes `t = x_cs * P`, the residual `x_cs - t*P^T`, and from them Q
/// and D. `cov_t` is the covariance of the calibration scores, passed in
/// so this function stays a pure per-row computation (the sensor façade
/// caches `cov_t` on the model rather than recomputing it per call).
pub fn compute_statistics(x_cs: &DVector<f64>, p: &DMatrix<f64>, cov_t_inv: &DMatrix<f64>) -> Statistics {
    let t = p.transpose() * x_cs;
    let reconstructed = p * &t;
    let residual = x_cs - &reconstructed;
    let q = residual.iter().map(|v| v * v).sum();
    let d = (t.transpose() * cov_t_inv * &t)[(0, 0)];
    Statistics { q, d }
}

/// Covariance of the calibration scores (`T` is N x A); falls back to a
/// reciprocal when the model keeps a single component, matching the
/// reference's `LinAlgError -> reciprocal` fallback for a scalar
/// covariance.
pub fn cov_t_inverse(eigenvalues: &[f64], n: f64) -> DMatrix<f64> {
    let a = eigenvalues.len();
    let denom = (n - 1.0).max(1.0);
    let mut diag = DMatrix::<f64>::zeros(a, a);
    for i in 0..a {
        let variance = (eigenvalues[i] / denom).max(1e-12);
        diag[(i, i)] = 1.0 / variance;
    }
    diag
}

/// UCLd (Hotelling T^2), phase I or II, per the reference formulas.
pub fn compute_ucl_d(n: usize, a: usize, alpha: f64, phase: u8) -> f64 {
    let n = n as f64;
    let a = a as f64;
    if phase == 1 {
        let dist = Beta::new(a / 2.0, ((n - a - 1.0) / 2.0).max(1e-6)).expect("valid beta params");
        let ppf = dist.inverse_cdf(1.0 - alpha);
        ((n - 1.0).powi(2) / n) * ppf
    } else {
        let dist = FisherSnedecor::new(a, (n - a).max(1.0)).expect("valid F params");
        let ppf = dist.inverse_cdf(1.0 - alpha);
        (a * (n * n - 1.0) / (n * (n - a).max(1.0))) * ppf
    }
}

/// UCLq (Jackson-Mudholkar), built from the residual (non-principal)
/// eigenvalues `theta_i = sum(lambda_j^i)` for `i = 1..=3`.
pub fn compute_ucl_q(residual_eigenvalues: &[f64], alpha: f64) -> f64 {
    if residual_eigenvalues.is_empty() {
        return 0.0;
    }
    let theta1: f64 = residual_eigenvalues.iter().sum();
    let theta2: f64 = residual_eigenvalues.iter().map(|l| l * l).sum();
    let theta3: f64 = residual_eigenvalues.iter().map(|l| l * l * l).sum();

    if theta1 <= 0.0 {
        return 0.0;
    }

    let h0 = if theta2 > 0.0 {
        (1.0 - (2.0 * theta1 * theta3) / (3.0 * theta2 * theta2)).max(1e-6)
    } else {
        1.0
    };
    let normal = Normal::new(0.0, 1.0).expect("standard normal always valid");
    let z = normal.inverse_cdf(1.0 - alpha);

    let term = z * (2.0 * theta2 * h0 * h0).sqrt() / theta1 + 1.0 + (theta2 * h0 * (h0 - 1.0)) / (theta1 * theta1);
    theta1 * term.max(0.0).powf(1.0 / h0)
}

/// Observation-based missing-data exploratory diagnosis (oMEDA).
/// `dummy` selects the observation(s) under diagnosis; its entries are
/// expected to already be normalized into `[-1, 1]` (positive and
/// negative groups each max-normalized separately) by the caller.
pub fn omeda(x_cs: &DMatrix<f64>, dummy: &DVector<f64>, p: &DMatrix<f64>) -> Result<DVector<f64>> {
    if x_cs.nrows() != dummy.len() {
        return Err(SensorError::InvalidInput("oMEDA dummy length must match observation count".into()));
    }
    let x_a = x_cs * p * p.transpose();
    let sum_a = x_a.transpose() * dummy;
    let sum_tot = x_cs.transpose() * dummy;
    let dtd = (dummy.transpose() * dummy)[(0, 0)].sqrt();
    if dtd <= 0.0 {
        return Err(SensorError::InvalidInput("oMEDA dummy vector must be non-zero".into()));
    }

    let m = x_cs.ncols();
    let mut out = DVector::zeros(m);
    for j in 0..m {
        out[j] = (2.0 * sum_tot[(j, 0)] - sum_a[(j, 0)]) * sum_a[(j, 0)].abs() / dtd;
    }
    Ok(out)
}

/// Builds a normalized dummy vector for a one-hot diagnosis target (the
/// interval worker diagnosing the observation it just monitored).
pub fn one_hot_dummy(n: usize, index: usize) -> DVector<f64> {
    let mut d = DVector::zeros(n);
    if index < n {
        d[index] = 1.0;
    }
    d
}

impl Model {
    pub fn cov_t_inverse(&self) -> DMatrix<f64> {
        cov_t_inverse(&self.eigenvalues[..self.lv.min(self.eigenvalues.len())], self.n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ucl_q_is_nonnegative_for_typical_eigenvalues() {
        let residual = vec![0.5, 0.2, 0.05];
        let ucl = compute_ucl_q(&residual, 0.01);
        assert!(ucl >= 0.0);
    }

    #[test]
    fn ucl_q_is_zero_with_no_residual_variance() {
        assert_eq!(compute_ucl_q(&[], 0.01), 0.0);
    }

    #[test]
    fn ucl_d_phase_two_is_positive() {
        let ucl = compute_ucl_d(100, 3, 0.01, 2);
        assert!(ucl > 0.0);
    }

    #[test]
    fn statistics_are_nonnegative() {
        let p = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 0.0, 1.0, 0.0, 0.0]);
        let x = DVector::from_vec(vec![1.0, 2.0, 3.0]);
        let cov_inv = DMatrix::identity(2, 2);
        let stats = compute_statistics(&x, &p, &cov_inv);
        assert!(stats.q >= 0.0);
        assert!(stats.d >= 0.0);
    }
}
