//! Local per-source ingest worker (C3 runtime glue): ties a configured
//! [`crate::counters::LineParser`] + `FeatureDescriptor` list to the
//! interval cadence so a local source's own `files_generated` entry
//! lands before the scheduler checks readiness for that `ts`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock as SyncRwLock;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::counters::firewall::FirewallLogParser;
use crate::counters::netflow::NetflowParser;
use crate::counters::LineParser;
use crate::error::Result;
use crate::feature::FeatureDescriptor;
use crate::persistence::PersistenceLayout;
use crate::source::SourceRegistry;

/// Resolves a configured `DataSources.local.<id>.adapter` name to its
/// `LineParser`. Open for extension the way `Sensor.missingData.selected`
/// is; an unrecognized name is a startup-time `ConfigError`, not a
/// silently-skipped source.
pub fn resolve_parser(adapter: &str) -> Option<Box<dyn LineParser>> {
    match adapter {
        "netflow" => Some(Box::new(NetflowParser)),
        "firewall" => Some(Box::new(FirewallLogParser)),
        _ => None,
    }
}

/// One local source's ingest loop: ticks on the same `Tw` cadence as the
/// interval driver, reads whatever lines were appended to its backing
/// file since the last tick, counts features over them, and marks the
/// source ready under the same `ts` the scheduler will be polling for.
pub struct LocalIngestWorker {
    pub source_id: String,
    pub path: PathBuf,
    pub features: Vec<FeatureDescriptor>,
    pub parser: Box<dyn LineParser>,
    pub tw: Duration,
    pub ts_format: String,
    pub layout: Arc<PersistenceLayout>,
    pub registry: Arc<SyncRwLock<SourceRegistry>>,
    pub cancel: CancellationToken,
}

impl LocalIngestWorker {
    pub async fn run(self) {
        let mut offset: u64 = 0;
        let mut ticker = tokio::time::interval(self.tw);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(source = %self.source_id, "ingest worker stopping");
                    return;
                }
                _ = ticker.tick() => {
                    // Must land on the exact same tag the scheduler's
                    // interval driver mints for this window, or the
                    // readiness join in `Scheduler::run_interval` never
                    // sees this source as ready. See `crate::timing`.
                    let ts = crate::timing::current_window_ts(self.tw, &self.ts_format);
                    if let Err(e) = self.ingest_once(&ts, &mut offset).await {
                        warn!(source = %self.source_id, ts, error = %e, "ingest failed for this interval");
                    }
                }
            }
        }
    }

    async fn ingest_once(&self, ts: &str, offset: &mut u64) -> Result<()> {
        let raw_dir = self.layout.source_raw_dir(&self.source_id);
        let parsed_dir = self.layout.source_parsed_dir(&self.source_id);
        tokio::fs::create_dir_all(&raw_dir).await?;
        tokio::fs::create_dir_all(&parsed_dir).await?;

        let new_text = read_new_bytes(&self.path, offset).await.unwrap_or_default();
        let counts = crate::counters::count_lines(self.parser.as_ref(), &self.features, &new_text);

        let raw_copy = raw_dir.join(format!("{}_{ts}.raw", self.source_id));
        tokio::fs::write(&raw_copy, &new_text).await?;

        let parsed_path = parsed_dir.join(format!("output-{}_{ts}.dat", self.source_id));
        let line = counts.iter().map(|v| format!("{v:.6}")).collect::<Vec<_>>().join(",");
        tokio::fs::write(&parsed_path, format!("{line}\n")).await?;

        let registry = self.registry.read();
        if let Some(source) = registry.get(&self.source_id) {
            source.mark_ready(ts, parsed_path);
        }
        Ok(())
    }
}

/// Reads whatever bytes were appended to `path` since `*offset`,
/// tolerating a missing file (source hasn't written anything yet) and a
/// file that shrank (rotated out from under us — restart from the top).
async fn read_new_bytes(path: &PathBuf, offset: &mut u64) -> std::io::Result<String> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
        Err(e) => return Err(e),
    };
    let len = file.metadata().await?.len();
    if len < *offset {
        *offset = 0;
    }
    file.seek(std::io::SeekFrom::Start(*offset)).await?;
    let mut buf = String::new();
    file.read_to_string(&mut buf).await?;
    *offset = len;
    Ok(buf)
}
