//! Configuration loader (C9): parses the single YAML document named on
//! the command line into an immutable [`SensorConfig`], merged over
//! compiled-in defaults via the `config` crate.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;
use crate::feature::{FeatureDescriptor, VariableDescriptor};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GeneralParams {
    pub root_path: PathBuf,
    /// `Tw`: interval length, seconds.
    pub data_sources_scheduling: u64,
    /// `Tp`: readiness-poll period, seconds.
    pub data_sources_polling: u64,
    /// `Tgrace`: deadline overrun tolerated before an interval is forced partial.
    pub data_sources_not_ready_waiting_time: u64,
    #[serde(default = "default_connection_timeout")]
    pub server_connection_timeout: u64,
    #[serde(default = "default_values_format")]
    pub values_format: String,
    #[serde(default = "default_ts_format")]
    pub ts_date_format: String,
}

fn default_connection_timeout() -> u64 {
    10
}
fn default_values_format() -> String {
    "%.6f".to_string()
}
fn default_ts_format() -> String {
    "%Y%m%d%H%M%S".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StaticCalibration {
    #[serde(default)]
    pub random_calibration: bool,
    #[serde(default)]
    pub random_calibration_obs: usize,
    #[serde(default)]
    pub calibration_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DynamicCalibration {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_batch_size")]
    pub b: usize,
    #[serde(default = "default_lambda")]
    pub lambda: f64,
}

fn default_batch_size() -> usize {
    20
}
fn default_lambda() -> f64 {
    0.9
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MissingData {
    pub selected: String,
    #[serde(default)]
    pub methods: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerAddress {
    pub ip: IpAddr,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SensorSection {
    pub sid: String,
    pub lv: usize,
    pub prep: u8,
    pub phase: u8,
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    pub static_calibration: StaticCalibration,
    #[serde(rename = "dynamiCalibration")]
    pub dynamic_calibration: DynamicCalibration,
    pub missing_data: MissingData,
    #[serde(rename = "server_address")]
    pub server_address: ServerAddress,
    #[serde(rename = "remote_addresses", default)]
    pub remote_addresses: HashMap<String, String>,
}

fn default_alpha() -> f64 {
    0.01
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalSourceConfig {
    pub adapter: String,
    pub path: PathBuf,
    #[serde(default)]
    pub variables: Vec<VariableDescriptor>,
    #[serde(default)]
    pub features: Vec<FeatureDescriptor>,
    /// Partitions this source's per-interval records into an
    /// [`crate::source::ObservationBatch`] keyed by this variable
    /// (records missing it are dropped), per the data model's
    /// Observation batch. First-party adapters still collapse every
    /// interval down to the one summed row C4 concatenates per source —
    /// a third-party `FeatureCounter` is free to honor per-key batches.
    #[serde(default)]
    pub key_variable: Option<String>,
}

/// A known child sensor forwarding Data packets to this one. Its
/// contribution to the global feature order is always the fixed
/// `{Q, D}` pair the peer protocol carries — there is no per-source
/// width to configure, unlike a local source's feature list.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteSourceConfig {
    pub sid: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct DataSources {
    #[serde(default)]
    pub local: HashMap<String, LocalSourceConfig>,
    #[serde(default)]
    pub remote: HashMap<String, RemoteSourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SensorConfig {
    #[serde(rename = "GeneralParams")]
    pub general: GeneralParams,
    #[serde(rename = "Sensor")]
    pub sensor: SensorSection,
    #[serde(rename = "DataSources", default)]
    pub data_sources: DataSources,
}

impl SensorConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Yaml));
        let raw = builder
            .build()
            .map_err(|e| ConfigError::Read { path: path.to_path_buf(), source: Box::new(e) })?;
        let parsed: SensorConfig = raw
            .try_deserialize()
            .map_err(|e| ConfigError::Read { path: path.to_path_buf(), source: Box::new(e) })?;
        parsed.validate()?;
        Ok(parsed)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.general.data_sources_scheduling == 0 {
            return Err(ConfigError::OutOfRange("GeneralParams.dataSourcesScheduling must be > 0".into()));
        }
        if !(0.0..1.0).contains(&self.sensor.alpha) {
            return Err(ConfigError::OutOfRange("Sensor.alpha must be in (0, 1)".into()));
        }
        if self.sensor.lv < 1 {
            return Err(ConfigError::OutOfRange("Sensor.lv must be >= 1".into()));
        }
        if !(1..=2).contains(&self.sensor.phase) {
            return Err(ConfigError::OutOfRange("Sensor.phase must be 1 or 2".into()));
        }
        if !(0.0..=1.0).contains(&self.sensor.dynamic_calibration.lambda) {
            return Err(ConfigError::OutOfRange("Sensor.dynamiCalibration.lambda must be in [0, 1]".into()));
        }
        Ok(())
    }
}
