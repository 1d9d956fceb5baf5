//! On-disk artifact layout (C8). Every write is async (`tokio::fs`) and
//! best-effort: a persistence failure is logged and surfaced as a
//! [`crate::error::SensorError::DataSource`], never a panic.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::Result;
use crate::model::Model;

pub struct PersistenceLayout {
    root: PathBuf,
}

impl PersistenceLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn observation_dir(&self) -> PathBuf {
        self.root.join("sensor/observation")
    }
    pub fn output_dir(&self) -> PathBuf {
        self.root.join("sensor/output")
    }
    pub fn diagnosis_dir(&self) -> PathBuf {
        self.root.join("sensor/diagnosis")
    }
    pub fn model_dir(&self) -> PathBuf {
        self.root.join("sensor/model")
    }

    /// Per-source artefact root: `data/<source-id>/{raw,processed,parsed}`.
    pub fn source_raw_dir(&self, source_id: &str) -> PathBuf {
        self.root.join("data").join(source_id).join("raw")
    }
    pub fn source_processed_dir(&self, source_id: &str) -> PathBuf {
        self.root.join("data").join(source_id).join("processed")
    }
    pub fn source_parsed_dir(&self, source_id: &str) -> PathBuf {
        self.root.join("data").join(source_id).join("parsed")
    }

    pub async fn write_observation(&self, ts: &str, counts: &[f64]) -> Result<PathBuf> {
        let dir = self.observation_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("obs_{ts}.dat"));
        let line = counts.iter().map(|v| format!("{v:.6}")).collect::<Vec<_>>().join(",");
        tokio::fs::write(&path, format!("{line}\n")).await?;
        Ok(path)
    }

    pub async fn write_output(&self, ts: &str, q: f64, d: f64, ucl_q: f64, ucl_d: f64) -> Result<PathBuf> {
        let dir = self.output_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("output_{ts}.dat"));
        let contents = format!("# UCLq:{ucl_q:.6}, UCLd:{ucl_d:.6}\n{q:.6},{d:.6}\n");
        tokio::fs::write(&path, contents).await?;
        Ok(path)
    }

    pub async fn write_diagnosis(&self, ts: &str, vector: &[f64]) -> Result<PathBuf> {
        let dir = self.diagnosis_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("diagnosis_{ts}.dat"));
        let line = vector.iter().map(|v| format!("{v:.6}")).collect::<Vec<_>>().join(",");
        tokio::fs::write(&path, format!("{line}\n")).await?;
        Ok(path)
    }

    pub async fn write_model(&self, model: &Model) -> Result<PathBuf> {
        let dir = self.model_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("model_{}.json", model.calibrated_at));
        let json = serde_json::to_string_pretty(model)
            .map_err(|e| crate::error::SensorError::Model(e.to_string()))?;
        tokio::fs::write(&path, json).await?;
        info!(?path, "persisted model snapshot");
        Ok(path)
    }

    /// Loads the most recently written model snapshot, if any. Returns
    /// `Ok(None)` rather than an error for a missing or unparseable
    /// directory so a first run falls through to static calibration.
    pub async fn load_latest_model(&self) -> Option<Model> {
        let dir = self.model_dir();
        let mut entries = tokio::fs::read_dir(&dir).await.ok()?;
        let mut newest: Option<(String, PathBuf)> = None;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let name = path.file_stem()?.to_string_lossy().to_string();
            if newest.as_ref().map(|(n, _)| name > *n).unwrap_or(true) {
                newest = Some((name, path));
            }
        }
        let (_, path) = newest?;
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(model) => Some(model),
                Err(e) => {
                    warn!(?path, error = %e, "model snapshot failed to parse; ignoring");
                    None
                }
            },
            Err(e) => {
                warn!(?path, error = %e, "model snapshot failed to read; ignoring");
                None
            }
        }
    }

    pub async fn write_dummy_artifact(&self, source_dir: &Path, ts: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(source_dir).await?;
        let path = source_dir.join(format!("missing_{ts}.dat"));
        tokio::fs::write(&path, "# no data received before deadline\n").await?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_and_load_model_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = PersistenceLayout::new(tmp.path());
        let model = crate::model::calibrate_static(
            &nalgebra::DMatrix::from_element(4, 2, 1.0),
            1,
            2,
            2,
            0.01,
            "20260101000000",
        )
        .unwrap();
        layout.write_model(&model).await.unwrap();
        let loaded = layout.load_latest_model().await.unwrap();
        assert_eq!(loaded.calibrated_at, model.calibrated_at);
    }

    #[tokio::test]
    async fn load_latest_model_returns_none_when_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = PersistenceLayout::new(tmp.path());
        assert!(layout.load_latest_model().await.is_none());
    }
}
