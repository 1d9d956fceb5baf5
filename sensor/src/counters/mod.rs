//! Pluggable per-source adapters (C3). The matcher in [`crate::feature`]
//! does the heavy lifting; a counter just turns one raw line into a
//! [`crate::feature::Record`] and hands it to that matcher.

pub mod firewall;
pub mod netflow;

use crate::feature::{FeatureDescriptor, Record};

/// Turns one raw line of a source's log format into a typed [`Record`].
/// Lines the adapter cannot parse are skipped rather than failing the
/// whole batch — one malformed line must not take an interval down.
pub trait LineParser: Send + Sync {
    fn parse_line(&self, line: &str) -> Option<Record>;
}

/// Runs every line in `raw` through `parser`, then folds the resulting
/// records through `features` to produce one aggregated count row. This
/// is the shared body both first-party counters call into; an adapter
/// only needs to supply `LineParser` and its `FeatureDescriptor` list.
pub fn count_lines(parser: &dyn LineParser, features: &[FeatureDescriptor], raw: &str) -> Vec<f64> {
    let records: Vec<Record> = raw.lines().filter_map(|line| parser.parse_line(line)).collect();
    crate::feature::aggregate(features, &records)
}
