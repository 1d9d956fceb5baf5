use std::path::PathBuf;

/// Error kinds surfaced across the sensor runtime. Only [`SensorError::Config`]
/// is treated as fatal by `main`; every other variant is caught at the
/// boundary of the worker that raised it, logged, and the affected
/// interval/source/send is skipped rather than bringing the process down.
#[derive(Debug, thiserror::Error)]
pub enum SensorError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("data source '{source}' failed: {reason}")]
    DataSource { source: String, reason: String },

    #[error("peer communication failed: {0}")]
    Comm(#[from] std::io::Error),

    #[error("model error: {0}")]
    Model(String),

    #[error("numeric failure: {0}")]
    NumericFailure(String),

    #[error("imputation error: {0}")]
    Imputation(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: Box<config::ConfigError>,
    },

    #[error("configuration value out of range: {0}")]
    OutOfRange(String),

    #[error("missing required configuration field: {0}")]
    Missing(String),
}

pub type Result<T> = std::result::Result<T, SensorError>;
