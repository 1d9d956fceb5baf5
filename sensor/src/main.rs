mod bootstrap;
mod config;
mod counters;
mod error;
mod feature;
mod imputation;
mod ingest;
mod linalg;
mod model;
mod mspc;
mod peer;
mod persistence;
mod scheduler;
mod sensor;
mod source;
mod timing;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use parking_lot::RwLock as SyncRwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use config::SensorConfig;
use error::{ConfigError, SensorError};
use persistence::PersistenceLayout;
use scheduler::{DynamicCalibrationSettings, Parent, Scheduler, SchedulerTimings};
use sensor::Sensor;
use source::SourceRegistry;

/// Distributed multivariate statistical network monitoring sensor.
#[derive(Debug, Parser)]
#[command(name = "msnm-sensor")]
struct Cli {
    /// Path to the sensor's YAML configuration document.
    config: PathBuf,
}

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "msnm_sensor=info".into()),
        )
        .init();

    match run(cli.config).await {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            error!(error = %e, "sensor exited with an error");
            std::process::exit(1);
        }
    }
}

async fn run(config_path: PathBuf) -> Result<(), SensorError> {
    let config = SensorConfig::load(&config_path).map_err(SensorError::Config)?;
    info!(sid = %config.sensor.sid, "starting sensor");

    let layout = Arc::new(PersistenceLayout::new(config.general.root_path.clone()));
    let registry = Arc::new(SyncRwLock::new(bootstrap::build_registry(&config)?));
    let m = registry.read().total_variable_count();
    if m < 2 {
        return Err(SensorError::Config(ConfigError::OutOfRange(format!(
            "configured sources contribute {m} total columns; calibration requires M>=2"
        ))));
    }

    let model = match layout.load_latest_model().await {
        Some(model) if model.m() == m => {
            info!(ts = %model.calibrated_at, "resuming from last persisted model snapshot");
            model
        }
        Some(_) => {
            warn!("persisted model snapshot width does not match current source configuration; recalibrating");
            initial_calibration(&config, m, &layout).await?
        }
        None => initial_calibration(&config, m, &layout).await?,
    };

    let sensor = Arc::new(Sensor::new(model));
    let cancel = CancellationToken::new();
    let mut workers = Vec::new();

    workers.extend(spawn_ingest_workers(&config, &layout, &registry, &cancel));

    let peer_server = Arc::new(peer::PeerServer::new(Arc::clone(&layout), Arc::clone(&registry)));
    let addr = SocketAddr::new(config.sensor.server_address.ip, config.sensor.server_address.port);
    {
        let peer_server = Arc::clone(&peer_server);
        let cancel = cancel.clone();
        workers.push(tokio::spawn(async move {
            if let Err(e) = peer_server.serve(addr, cancel).await {
                error!(error = %e, "peer server terminated unexpectedly");
            }
        }));
    }

    let parents = resolve_parents(&config)?;
    let scheduler = Arc::new(Scheduler::new(
        config.sensor.sid.clone(),
        SchedulerTimings {
            tw: Duration::from_secs(config.general.data_sources_scheduling),
            tp: Duration::from_secs(config.general.data_sources_polling),
            tgrace: Duration::from_secs(config.general.data_sources_not_ready_waiting_time),
            connect_timeout: Duration::from_secs(config.general.server_connection_timeout),
        },
        config.general.ts_date_format.clone(),
        Arc::clone(&registry),
        Arc::clone(&sensor),
        Arc::clone(&layout),
        config.sensor.missing_data.selected.clone(),
        DynamicCalibrationSettings {
            enabled: config.sensor.dynamic_calibration.enabled,
            batch_size: config.sensor.dynamic_calibration.b,
            lambda: config.sensor.dynamic_calibration.lambda,
        },
        parents,
        cancel.clone(),
    ));
    {
        let scheduler = Arc::clone(&scheduler);
        workers.push(tokio::spawn(async move {
            scheduler.run().await;
        }));
    }

    tokio::signal::ctrl_c().await.map_err(SensorError::Comm)?;
    info!("shutdown signal received, draining workers");
    cancel.cancel();

    let drain = futures_util::future::join_all(workers);
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("one or more workers did not drain within the shutdown grace period; abandoning them");
    }

    info!("sensor stopped");
    Ok(())
}

async fn initial_calibration(
    config: &SensorConfig,
    m: usize,
    layout: &PersistenceLayout,
) -> Result<model::Model, SensorError> {
    let x = bootstrap::initial_calibration_matrix(config, m)?;
    let now = chrono::Utc::now().format(&config.general.ts_date_format).to_string();
    let model = model::calibrate_static(
        &x,
        config.sensor.lv,
        config.sensor.prep,
        config.sensor.phase,
        config.sensor.alpha,
        &now,
    )?;
    layout.write_model(&model).await?;
    info!(ts = %now, "initial static calibration complete");
    Ok(model)
}

/// Spawns one ingest worker per configured local source. Adapter
/// resolution already succeeded in [`bootstrap::build_registry`], so the
/// `filter_map` here can never actually drop a source — it just avoids
/// unwrapping a `None` the registry build would have rejected already.
fn spawn_ingest_workers(
    config: &SensorConfig,
    layout: &Arc<PersistenceLayout>,
    registry: &Arc<SyncRwLock<SourceRegistry>>,
    cancel: &CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    let tw = Duration::from_secs(config.general.data_sources_scheduling);
    config
        .data_sources
        .local
        .iter()
        .filter_map(|(id, src)| {
            let parser = ingest::resolve_parser(&src.adapter)?;
            let worker = ingest::LocalIngestWorker {
                source_id: id.clone(),
                path: src.path.clone(),
                features: src.features.clone(),
                parser,
                tw,
                ts_format: config.general.ts_date_format.clone(),
                layout: Arc::clone(layout),
                registry: Arc::clone(registry),
                cancel: cancel.clone(),
            };
            Some(tokio::spawn(worker.run()))
        })
        .collect()
}

fn resolve_parents(config: &SensorConfig) -> Result<Vec<Parent>, SensorError> {
    config
        .sensor
        .remote_addresses
        .iter()
        .map(|(parent_sid, addr)| {
            addr.parse::<SocketAddr>()
                .map(|addr| Parent { parent_sid: parent_sid.clone(), addr })
                .map_err(|e| {
                    SensorError::Config(ConfigError::OutOfRange(format!(
                        "Sensor.remote_addresses.{parent_sid} = '{addr}' is not a valid socket address: {e}"
                    )))
                })
        })
        .collect()
}
