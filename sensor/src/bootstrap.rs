//! Startup wiring (C10's non-CLI half): builds the [`SourceRegistry`]
//! from configuration and produces the calibration matrix that seeds
//! the sensor's first [`crate::model::Model`].

use std::path::Path;

use nalgebra::DMatrix;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};

use crate::config::SensorConfig;
use crate::error::{ConfigError, Result, SensorError};
use crate::ingest;
use crate::source::{SourceHandle, SourceKind, SourceRegistry};

/// Width contributed by every remote source: the peer protocol's Data
/// body is strictly `{Q: number, D: number}` (see §9's open-question
/// decision against legacy scalar bodies), so this is never configurable.
pub const REMOTE_SOURCE_WIDTH: usize = 2;

/// Builds the process-lifetime source registry in the stable order the
/// global feature vector concatenates: local sources first (in the order
/// the config map iterates — callers needing a deterministic on-disk
/// order should rely on the registry, not re-derive it), then remote
/// sources.
pub fn build_registry(config: &SensorConfig) -> Result<SourceRegistry> {
    let mut registry = SourceRegistry::new();

    let mut local_ids: Vec<&String> = config.data_sources.local.keys().collect();
    local_ids.sort();
    for id in local_ids {
        let source = &config.data_sources.local[id];
        if ingest::resolve_parser(&source.adapter).is_none() {
            return Err(SensorError::Config(ConfigError::OutOfRange(format!(
                "DataSources.local.{id}: unknown adapter '{}'",
                source.adapter
            ))));
        }
        registry.register(SourceHandle::new(id.clone(), SourceKind::Local, source.features.len()));
    }

    let mut remote_ids: Vec<&String> = config.data_sources.remote.keys().collect();
    remote_ids.sort();
    for id in remote_ids {
        registry.register(SourceHandle::new(id.clone(), SourceKind::Remote, REMOTE_SOURCE_WIDTH));
    }

    Ok(registry)
}

/// Produces the N x M matrix that seeds static calibration, per
/// `Sensor.staticCalibration`: a file takes precedence over random
/// generation when both are configured.
pub fn initial_calibration_matrix(config: &SensorConfig, m: usize) -> Result<DMatrix<f64>> {
    let seed = &config.sensor.static_calibration;
    if let Some(path) = &seed.calibration_file {
        return load_csv_matrix(path, m);
    }
    if seed.random_calibration {
        return Ok(random_matrix(seed.random_calibration_obs.max(2), m));
    }
    Err(SensorError::Config(ConfigError::Missing(
        "Sensor.staticCalibration must set calibrationFile or randomCalibration".into(),
    )))
}

fn random_matrix(n: usize, m: usize) -> DMatrix<f64> {
    let mut rng = rand::rngs::StdRng::from_entropy();
    DMatrix::from_fn(n, m, |_, _| StandardNormal.sample(&mut rng))
}

/// Loads a comma-separated calibration matrix, one row per line, `#`
/// comment lines ignored — the same convention the persisted observation
/// files use.
fn load_csv_matrix(path: &Path, m: usize) -> Result<DMatrix<f64>> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        SensorError::Config(ConfigError::Missing(format!(
            "failed to read calibrationFile {}: {e}",
            path.display()
        )))
    })?;
    let mut rows: Vec<Vec<f64>> = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let row: Vec<f64> = line
            .split(',')
            .map(|v| v.trim().parse::<f64>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| SensorError::Config(ConfigError::OutOfRange(format!("calibrationFile row '{line}': {e}"))))?;
        if row.len() != m {
            return Err(SensorError::Config(ConfigError::OutOfRange(format!(
                "calibrationFile row has {} columns, expected {m}",
                row.len()
            ))));
        }
        rows.push(row);
    }
    if rows.len() < 2 {
        return Err(SensorError::Config(ConfigError::OutOfRange(
            "calibrationFile must contain at least 2 rows".into(),
        )));
    }
    let n = rows.len();
    let flat: Vec<f64> = rows.into_iter().flatten().collect();
    Ok(DMatrix::from_row_slice(n, m, &flat))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_matrix_has_requested_shape() {
        let m = random_matrix(5, 3);
        assert_eq!(m.shape(), (5, 3));
    }

    #[test]
    fn load_csv_matrix_rejects_mismatched_width() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "1,2,3\n4,5\n").unwrap();
        assert!(load_csv_matrix(tmp.path(), 3).is_err());
    }

    #[test]
    fn load_csv_matrix_skips_comments_and_parses_rows() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "# header\n1,2\n3,4\n").unwrap();
        let m = load_csv_matrix(tmp.path(), 2).unwrap();
        assert_eq!(m.shape(), (2, 2));
        assert_eq!(m[(1, 0)], 3.0);
    }
}
