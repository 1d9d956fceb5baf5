//! Interval scheduler (C4): for every `Tw`-second window, assembles one
//! synchronized observation across all sources, tolerating sources that
//! miss the `Tgrace` deadline, then drives monitoring, persistence, peer
//! forwarding and dynamic recalibration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nalgebra::DMatrix;
use parking_lot::RwLock as SyncRwLock;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::Result;
use crate::imputation;
use crate::persistence::PersistenceLayout;
use crate::sensor::Sensor;
use crate::source::SourceRegistry;

#[derive(Debug, Clone)]
pub struct SchedulerTimings {
    pub tw: Duration,
    pub tp: Duration,
    pub tgrace: Duration,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct DynamicCalibrationSettings {
    pub enabled: bool,
    pub batch_size: usize,
    pub lambda: f64,
}

#[derive(Debug, Clone)]
pub struct Parent {
    pub parent_sid: String,
    pub addr: SocketAddr,
}

pub struct Scheduler {
    pub sid: String,
    pub timings: SchedulerTimings,
    /// `GeneralParams.tsDateFormat`: must match the format every
    /// producer (local ingest worker, peer server) uses so the
    /// wall-clock-floored window tag [`crate::timing::current_window_ts`]
    /// computes lines up for all of them — see `crate::timing`.
    pub ts_format: String,
    pub registry: Arc<SyncRwLock<SourceRegistry>>,
    pub sensor: Arc<Sensor>,
    pub layout: Arc<PersistenceLayout>,
    pub imputation_strategy: String,
    pub dynamic: DynamicCalibrationSettings,
    pub parents: Vec<Parent>,
    pub cancel: CancellationToken,
    batch: Mutex<Vec<Vec<f64>>>,
    packet_sent: Arc<AtomicU64>,
    next_packet_id: AtomicU64,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sid: String,
        timings: SchedulerTimings,
        ts_format: String,
        registry: Arc<SyncRwLock<SourceRegistry>>,
        sensor: Arc<Sensor>,
        layout: Arc<PersistenceLayout>,
        imputation_strategy: String,
        dynamic: DynamicCalibrationSettings,
        parents: Vec<Parent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            sid,
            timings,
            ts_format,
            registry,
            sensor,
            layout,
            imputation_strategy,
            dynamic,
            parents,
            cancel,
            batch: Mutex::new(Vec::new()),
            packet_sent: Arc::new(AtomicU64::new(0)),
            next_packet_id: AtomicU64::new(1),
        }
    }

    /// The outer driver loop: spawns one interval worker every `Tw`
    /// seconds without waiting for the previous interval to finish.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.timings.tw);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!(sid = %self.sid, "interval driver stopping");
                    return;
                }
                _ = ticker.tick() => {
                    let ts = crate::timing::current_window_ts(self.timings.tw, &self.ts_format);
                    let worker = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = worker.run_interval(ts.clone()).await {
                            warn!(ts, error = %e, "interval worker failed");
                        }
                    });
                }
            }
        }
    }

    async fn run_interval(self: Arc<Self>, ts: String) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.timings.tgrace;
        let source_ids: Vec<String> = {
            let registry = self.registry.read();
            registry.iter_in_order().map(|s| s.id.clone()).collect()
        };

        loop {
            let all_ready = source_ids.iter().all(|id| {
                let registry = self.registry.read();
                registry.get(id).map(|s| s.is_ready(&ts)).unwrap_or(false)
            });
            if all_ready {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                self.force_partial(&ts, &source_ids).await;
                break;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.timings.tp) => {}
            }
        }

        let row = self.assemble_row(&ts, &source_ids).await?;
        self.process_observation(&ts, row).await
    }

    async fn force_partial(&self, ts: &str, source_ids: &[String]) {
        for id in source_ids {
            let registry = self.registry.read();
            if let Some(source) = registry.get(id) {
                if !source.is_ready(ts) {
                    drop(registry);
                    let artifact_dir = self.layout.source_raw_dir(id);
                    let artifact = self.layout.write_dummy_artifact(&artifact_dir, ts).await;
                    let registry = self.registry.read();
                    if let Some(source) = registry.get(id) {
                        match artifact {
                            Ok(_) => source.mark_missing(ts),
                            Err(e) => {
                                warn!(id, ts, error = %e, "failed writing dummy artifact for missing source");
                                source.mark_missing(ts);
                            }
                        }
                    }
                }
            }
        }
    }

    async fn assemble_row(&self, ts: &str, source_ids: &[String]) -> Result<Vec<f64>> {
        let mut row = Vec::new();
        for id in source_ids {
            let (width, artifact) = {
                let registry = self.registry.read();
                let source = registry.get(id).expect("source present");
                let artifact = source.files_generated.get(ts).map(|e| e.value().clone());
                (source.variable_count, artifact.flatten())
            };
            match artifact {
                Some(path) => {
                    let values = read_row(&path, width).await;
                    row.extend(values);
                }
                None => row.extend(std::iter::repeat(f64::NAN).take(width)),
            }
        }
        Ok(row)
    }

    async fn process_observation(&self, ts: &str, mut row: Vec<f64>) -> Result<()> {
        if row.iter().any(|v| v.is_nan()) {
            let model = self.sensor.current_model().await;
            imputation::apply(&self.imputation_strategy, &mut row, Some(&model))?;
        }

        self.layout.write_observation(ts, &row).await?;

        let (q, d) = self.sensor.monitor(&row).await?;
        let model = self.sensor.current_model().await;
        self.layout.write_output(ts, q, d, model.ucl_q, model.ucl_d).await?;

        if let Ok(diagnosis) = self.sensor.diagnose(&row, 0).await {
            self.layout.write_diagnosis(ts, &diagnosis).await?;
        }

        for parent in &self.parents {
            self.forward_upstream(parent.clone(), ts.to_string(), q, d);
        }

        if self.dynamic.enabled {
            self.maybe_recalibrate(ts, row).await?;
        }

        Ok(())
    }

    /// Fire-and-forget upstream send: one short-lived task per
    /// (interval, parent), matching the client's connect-send-await-close
    /// lifecycle. Failures are logged, not retried.
    fn forward_upstream(&self, parent: Parent, ts: String, q: f64, d: f64) {
        let sid = self.sid.clone();
        let id = self.next_packet_id.fetch_add(1, Ordering::Relaxed);
        let connect_timeout = self.timings.connect_timeout;
        let sent_counter = Arc::clone(&self.packet_sent);
        tokio::spawn(async move {
            match crate::peer::send_data(parent.addr, &sid, &ts, id, q, d, connect_timeout).await {
                Ok(_) => {
                    sent_counter.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => warn!(parent = %parent.parent_sid, ts, error = %e, "failed to forward statistics upstream"),
            }
        });
    }

    /// Count of Data packets successfully acknowledged by a parent since
    /// startup; exposed for diagnostics/tests, not persisted.
    pub fn packets_sent(&self) -> u64 {
        self.packet_sent.load(Ordering::Relaxed)
    }

    async fn maybe_recalibrate(&self, ts: &str, row: Vec<f64>) -> Result<()> {
        let mut batch = self.batch.lock().await;
        batch.push(row);
        if batch.len() < self.dynamic.batch_size {
            return Ok(());
        }
        let rows = std::mem::take(&mut *batch);
        drop(batch);

        let width = rows.first().map(|r| r.len()).unwrap_or(0);
        let flat: Vec<f64> = rows.into_iter().flatten().collect();
        let n = flat.len() / width.max(1);
        let x = DMatrix::from_row_slice(n, width, &flat);

        self.sensor.calibrate_dynamic(&x, self.dynamic.lambda, ts).await?;
        let model = self.sensor.current_model().await;
        self.layout.write_model(&model).await?;
        info!(ts, n, "dynamic recalibration completed");
        Ok(())
    }
}

async fn read_row(path: &PathBuf, expected_len: usize) -> Vec<f64> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => {
            let values: Vec<f64> = contents
                .lines()
                .find(|line| !line.starts_with('#') && !line.trim().is_empty())
                .map(|line| line.split(',').filter_map(|v| v.trim().parse().ok()).collect())
                .unwrap_or_default();
            if values.len() == expected_len {
                values
            } else {
                vec![f64::NAN; expected_len]
            }
        }
        Err(_) => vec![f64::NAN; expected_len],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_ts_agrees_with_an_independently_ticking_producer() {
        // Regression for the scheduler and a local ingest worker minting
        // unrelated `ts` values (different format, different clock):
        // both must resolve the *same* window to the *same* string
        // given the same `Tw`/format, since that is the only thing a
        // source's `files_generated[ts]` entry and the scheduler's
        // readiness check share.
        let tw = Duration::from_secs(60);
        let format = "%Y%m%d%H%M%S";
        let scheduler_ts = crate::timing::current_window_ts(tw, format);
        let ingest_worker_ts = crate::timing::current_window_ts(tw, format);
        assert_eq!(scheduler_ts, ingest_worker_ts);
    }

    #[tokio::test]
    async fn read_row_returns_nan_run_when_file_missing() {
        let values = read_row(&PathBuf::from("/nonexistent/path.dat"), 3).await;
        assert_eq!(values.len(), 3);
        assert!(values.iter().all(|v| v.is_nan()));
    }

    #[tokio::test]
    async fn read_row_parses_comma_separated_line() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tokio::fs::write(tmp.path(), "# header\n1.5,2.5,3.5\n").await.unwrap();
        let values = read_row(&tmp.path().to_path_buf(), 3).await;
        assert_eq!(values, vec![1.5, 2.5, 3.5]);
    }

    fn test_scheduler(tmp: &std::path::Path) -> Scheduler {
        let x = DMatrix::from_fn(10, 3, |i, j| (i as f64 + j as f64).sin());
        let model = crate::model::calibrate_static(&x, 2, 2, 2, 0.01, "t0").unwrap();
        let sensor = Arc::new(Sensor::new(model));
        let layout = Arc::new(PersistenceLayout::new(tmp));
        let registry = Arc::new(SyncRwLock::new(SourceRegistry::new()));
        Scheduler::new(
            "leaf".into(),
            SchedulerTimings {
                tw: Duration::from_secs(1),
                tp: Duration::from_millis(10),
                tgrace: Duration::from_secs(1),
                connect_timeout: Duration::from_secs(1),
            },
            "%Y%m%d%H%M%S".into(),
            registry,
            sensor,
            layout,
            "mean".into(),
            DynamicCalibrationSettings { enabled: false, batch_size: 0, lambda: 0.0 },
            vec![],
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn fully_missing_row_is_mean_imputed_and_still_emits_statistics() {
        let tmp = tempfile::tempdir().unwrap();
        let scheduler = test_scheduler(tmp.path());
        let row = vec![f64::NAN; 3];
        scheduler.process_observation("ts0", row).await.unwrap();

        let output = tokio::fs::read_to_string(scheduler.layout.output_dir().join("output_ts0.dat")).await.unwrap();
        assert!(output.contains("UCLq"));
        let obs = tokio::fs::read_to_string(scheduler.layout.observation_dir().join("obs_ts0.dat")).await.unwrap();
        // mean-imputed columns equal the model's avg, so the written
        // observation should not contain a NaN in fixed-format output.
        assert!(!obs.to_lowercase().contains("nan"));
    }

    #[tokio::test]
    async fn dynamic_recalibration_triggers_at_batch_size_and_replaces_model() {
        let tmp = tempfile::tempdir().unwrap();
        let x = DMatrix::from_fn(10, 3, |i, j| (i as f64 + j as f64).sin());
        let model = crate::model::calibrate_static(&x, 2, 2, 2, 0.01, "t0").unwrap();
        let sensor = Arc::new(Sensor::new(model));
        let layout = Arc::new(PersistenceLayout::new(tmp.path()));
        let registry = Arc::new(SyncRwLock::new(SourceRegistry::new()));
        let scheduler = Scheduler::new(
            "leaf".into(),
            SchedulerTimings {
                tw: Duration::from_secs(1),
                tp: Duration::from_millis(10),
                tgrace: Duration::from_secs(1),
                connect_timeout: Duration::from_secs(1),
            },
            "%Y%m%d%H%M%S".into(),
            registry,
            Arc::clone(&sensor),
            layout,
            "mean".into(),
            DynamicCalibrationSettings { enabled: true, batch_size: 3, lambda: 0.9 },
            vec![],
            CancellationToken::new(),
        );

        for i in 0..3 {
            let row = vec![0.1 * i as f64, 0.2 * i as f64, 0.3 * i as f64];
            scheduler.process_observation(&format!("ts{i}"), row).await.unwrap();
        }

        let model = sensor.current_model().await;
        assert_eq!(model.calibrated_at, "ts2");
    }
}
