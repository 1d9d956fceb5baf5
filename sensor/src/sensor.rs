//! Sensor façade (C6): binds configuration to the current [`Model`] and
//! exposes calibrate/monitor/diagnose to the rest of the runtime.
//!
//! The model lives behind a `tokio::sync::RwLock<Arc<Model>>`: a monitor
//! call clones the `Arc` out from behind a read lock and does its math
//! against that snapshot, so a concurrent recalibration can publish a
//! new model without blocking readers mid-computation and without a
//! reader ever observing a half-updated one.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector};
use tokio::sync::RwLock;

use crate::error::{Result, SensorError};
use crate::model::{self, Model};
use crate::mspc;

pub struct Sensor {
    model: RwLock<Arc<Model>>,
}

impl Sensor {
    pub fn new(model: Model) -> Self {
        Self { model: RwLock::new(Arc::new(model)) }
    }

    pub async fn current_model(&self) -> Arc<Model> {
        Arc::clone(&*self.model.read().await)
    }

    pub async fn calibrate(&self, x: &DMatrix<f64>, lv: usize, prep: u8, phase: u8, alpha: f64, now: &str) -> Result<Arc<Model>> {
        let fresh = model::calibrate_static(x, lv, prep, phase, alpha, now)?;
        let fresh = Arc::new(fresh);
        let mut guard = self.model.write().await;
        *guard = Arc::clone(&fresh);
        Ok(fresh)
    }

    /// Recalibrates against the current model under the write lock, so a
    /// concurrent `monitor` call either sees the old model start-to-finish
    /// or the new one start-to-finish, never a mix.
    pub async fn calibrate_dynamic(&self, x_new: &DMatrix<f64>, lambda: f64, now: &str) -> Result<Arc<Model>> {
        let mut guard = self.model.write().await;
        let fresh = model::calibrate_dynamic(x_new, &guard, lambda, now)?;
        let fresh = Arc::new(fresh);
        *guard = Arc::clone(&fresh);
        Ok(fresh)
    }

    pub async fn monitor(&self, row: &[f64]) -> Result<(f64, f64)> {
        let snapshot = self.current_model().await;
        if row.len() != snapshot.m() {
            return Err(SensorError::InvalidInput(format!(
                "observation width {} does not match model width {}",
                row.len(),
                snapshot.m()
            )));
        }
        let x = DMatrix::from_row_slice(1, row.len(), row);
        let x_cs = crate::linalg::apply_preprocess(&x, &snapshot.avg, &snapshot.sd);
        let x_cs_vec = DVector::from_column_slice(x_cs.row(0).transpose().as_slice());
        let p = snapshot.loadings_matrix();
        let cov_inv = snapshot.cov_t_inverse();
        let stats = mspc::compute_statistics(&x_cs_vec, &p, &cov_inv);
        Ok((stats.q, stats.d))
    }

    pub async fn diagnose(&self, row: &[f64], dummy_index: usize) -> Result<Vec<f64>> {
        let snapshot = self.current_model().await;
        let x = DMatrix::from_row_slice(1, row.len(), row);
        let x_cs = crate::linalg::apply_preprocess(&x, &snapshot.avg, &snapshot.sd);
        let dummy = mspc::one_hot_dummy(1, dummy_index);
        let p = snapshot.loadings_matrix();
        let result = mspc::omeda(&x_cs, &dummy, &p)?;
        Ok(result.iter().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_model() -> Model {
        let x = DMatrix::from_fn(10, 3, |i, j| (i as f64 + j as f64 * 2.0).sin());
        model::calibrate_static(&x, 2, 2, 2, 0.01, "t0").unwrap()
    }

    #[tokio::test]
    async fn monitor_rejects_mismatched_width() {
        let sensor = Sensor::new(seed_model());
        let result = sensor.monitor(&[1.0]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn monitor_produces_nonnegative_statistics() {
        let sensor = Sensor::new(seed_model());
        let (q, d) = sensor.monitor(&[0.1, 0.2, 0.3]).await.unwrap();
        assert!(q >= 0.0);
        assert!(d >= 0.0);
    }

    #[tokio::test]
    async fn calibrate_replaces_model_atomically() {
        let sensor = Sensor::new(seed_model());
        let x = DMatrix::from_fn(12, 3, |i, j| (i as f64 - j as f64).cos());
        let updated = sensor.calibrate(&x, 2, 2, 2, 0.01, "t1").await.unwrap();
        assert_eq!(updated.calibrated_at, "t1");
        let current = sensor.current_model().await;
        assert_eq!(current.calibrated_at, "t1");
    }
}
