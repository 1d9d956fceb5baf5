//! Source registry and the observation/batch types C4 assembles (C3's
//! data-model half, minus the concrete counters in [`crate::counters`]).

use std::collections::HashMap;
use std::path::PathBuf;

use dashmap::DashMap;

/// Whether a source is fed by a local adapter or by Data packets
/// arriving over the peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Local,
    Remote,
}

/// One registered source. `files_generated` is written by exactly one
/// producer (the source's ingest worker, or the TCP accept worker for a
/// remote source) and read by every interval worker checking readiness —
/// a `DashMap` per source keeps that traffic from contending with any
/// other source's writes.
pub struct SourceHandle {
    pub id: String,
    pub kind: SourceKind,
    pub variable_count: usize,
    pub files_generated: DashMap<String, Option<PathBuf>>,
}

impl SourceHandle {
    pub fn new(id: impl Into<String>, kind: SourceKind, variable_count: usize) -> Self {
        Self { id: id.into(), kind, variable_count, files_generated: DashMap::new() }
    }

    pub fn mark_ready(&self, ts: &str, artifact: PathBuf) {
        self.files_generated.insert(ts.to_string(), Some(artifact));
    }

    pub fn mark_missing(&self, ts: &str) {
        self.files_generated.insert(ts.to_string(), None);
    }

    pub fn is_ready(&self, ts: &str) -> bool {
        self.files_generated.contains_key(ts)
    }
}

/// The stable, process-lifetime registry of every configured source, in
/// the order their feature columns are concatenated into an observation.
pub struct SourceRegistry {
    order: Vec<String>,
    sources: HashMap<String, SourceHandle>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self { order: Vec::new(), sources: HashMap::new() }
    }

    pub fn register(&mut self, handle: SourceHandle) {
        self.order.push(handle.id.clone());
        self.sources.insert(handle.id.clone(), handle);
    }

    pub fn get(&self, id: &str) -> Option<&SourceHandle> {
        self.sources.get(id)
    }

    pub fn iter_in_order(&self) -> impl Iterator<Item = &SourceHandle> {
        self.order.iter().map(|id| self.sources.get(id).expect("registry order is consistent"))
    }

    pub fn total_variable_count(&self) -> usize {
        self.iter_in_order().map(|s| s.variable_count).sum()
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// One assembled row: the concatenation of every source's feature counts
/// for a single interval, in registry order. NaN entries mark a source
/// that missed the interval's deadline.
#[derive(Debug, Clone)]
pub struct Observation {
    pub ts: String,
    pub counts: Vec<f64>,
    pub key: Option<String>,
    pub records_aggregated: usize,
}

impl Observation {
    pub fn has_missing(&self) -> bool {
        self.counts.iter().any(|v| v.is_nan())
    }
}

/// A *key → Observation* aggregation window for one source, supporting
/// the `multiple` keys semantics: a second record sharing a key is
/// summed element-wise rather than replacing the first.
#[derive(Debug, Default)]
pub struct ObservationBatch {
    rows: HashMap<String, Observation>,
}

impl ObservationBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: Option<String>, ts: &str, counts: Vec<f64>, records: usize) {
        let map_key = key.clone().unwrap_or_default();
        match self.rows.get_mut(&map_key) {
            Some(existing) => {
                for (a, b) in existing.counts.iter_mut().zip(counts.iter()) {
                    *a += b;
                }
                existing.records_aggregated += records;
            }
            None => {
                self.rows.insert(
                    map_key,
                    Observation { ts: ts.to_string(), counts, key, records_aggregated: records },
                );
            }
        }
    }

    pub fn into_rows(self) -> Vec<Observation> {
        self.rows.into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_concatenates_variable_counts_in_order() {
        let mut reg = SourceRegistry::new();
        reg.register(SourceHandle::new("a", SourceKind::Local, 3));
        reg.register(SourceHandle::new("b", SourceKind::Remote, 2));
        assert_eq!(reg.total_variable_count(), 5);
        let ids: Vec<&str> = reg.iter_in_order().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn batch_aggregates_matching_keys_elementwise() {
        let mut batch = ObservationBatch::new();
        batch.add(Some("k1".into()), "t0", vec![1.0, 2.0], 1);
        batch.add(Some("k1".into()), "t0", vec![3.0, 4.0], 1);
        let rows = batch.into_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].counts, vec![4.0, 6.0]);
        assert_eq!(rows[0].records_aggregated, 2);
    }

    #[test]
    fn observation_detects_missing_columns() {
        let obs = Observation { ts: "t0".into(), counts: vec![1.0, f64::NAN], key: None, records_aggregated: 1 };
        assert!(obs.has_missing());
    }
}
