//! Variable/feature descriptors and the record → feature-count matcher
//! shared by every [`crate::counters`] adapter (C3).

use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// The kind of value a [`VariableDescriptor`] extracts from a raw record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableKind {
    String,
    Number,
    Ip,
    Time,
    Duration,
    Regexp,
}

/// Describes how to pull one named variable out of a raw record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableDescriptor {
    pub name: String,
    pub kind: VariableKind,
    /// Positional column index for structured records, or a capture
    /// pattern for unstructured ones. Interpreted by the concrete
    /// counter, not by this module.
    pub r#where: String,
}

/// How a [`FeatureDescriptor`] decides whether a record's variable value
/// increments this feature's count.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "matchtype", rename_all = "lowercase")]
pub enum MatchRule {
    Single { value: String },
    Multiple { value: Vec<String> },
    /// Inclusive range; an upper bound of `"inf"` is unbounded.
    Range { value: (String, String) },
    Regexp { value: String },
    /// Fires iff no other feature sharing `variable` matched this record.
    Default,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureDescriptor {
    pub name: String,
    pub variable: String,
    #[serde(flatten)]
    pub rule: MatchRule,
    #[serde(default)]
    pub weight: Option<f64>,
}

/// A transient variable-name → value mapping built from one raw
/// line/log by a concrete counter.
pub type Record = HashMap<String, String>;

/// Evaluates a single [`FeatureDescriptor`] against one [`Record`],
/// returning the count it contributes (0 or 1 for everything but
/// `default`, which is also 0 or 1 but depends on its siblings).
fn matches(rule: &MatchRule, value: &str) -> bool {
    match rule {
        MatchRule::Single { value: v } => value == v,
        MatchRule::Multiple { value: vs } => vs.iter().any(|v| v == value),
        MatchRule::Range { value: (lo, hi) } => {
            let parsed: f64 = match value.parse() {
                Ok(n) => n,
                Err(_) => return false,
            };
            let lo: f64 = lo.parse().unwrap_or(f64::NEG_INFINITY);
            let in_upper = if hi == "inf" {
                true
            } else {
                hi.parse::<f64>().map(|hi| parsed <= hi).unwrap_or(false)
            };
            parsed >= lo && in_upper
        }
        MatchRule::Regexp { value: pattern } => {
            Regex::new(pattern).map(|re| re.is_match(value)).unwrap_or(false)
        }
        MatchRule::Default => false, // resolved by `count_record`, not here
    }
}

/// Turns one record into a feature-count row, in the order `features` is
/// given. Multiple records are summed element-wise by the caller.
pub fn count_record(features: &[FeatureDescriptor], record: &Record) -> Vec<f64> {
    let mut hit_nondefault: HashMap<&str, bool> = HashMap::new();
    let mut counts = vec![0.0; features.len()];

    for (i, f) in features.iter().enumerate() {
        if matches!(f.rule, MatchRule::Default) {
            continue;
        }
        let Some(value) = record.get(&f.variable) else { continue };
        if matches(&f.rule, value) {
            counts[i] = f.weight.unwrap_or(1.0);
            hit_nondefault.entry(f.variable.as_str()).and_modify(|h| *h = true).or_insert(true);
        } else {
            hit_nondefault.entry(f.variable.as_str()).or_insert(false);
        }
    }

    for (i, f) in features.iter().enumerate() {
        if matches!(f.rule, MatchRule::Default) {
            let fired = hit_nondefault.get(f.variable.as_str()).copied().unwrap_or(false);
            if !fired {
                counts[i] = f.weight.unwrap_or(1.0);
            }
        }
    }

    counts
}

/// Sums feature-count rows from many records in the same interval.
pub fn aggregate(features: &[FeatureDescriptor], records: &[Record]) -> Vec<f64> {
    let mut total = vec![0.0; features.len()];
    for record in records {
        let row = count_record(features, record);
        for (t, r) in total.iter_mut().zip(row) {
            *t += r;
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(pairs: &[(&str, &str)]) -> Record {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn single_match_counts_one() {
        let features = vec![FeatureDescriptor {
            name: "tcp".into(),
            variable: "proto".into(),
            rule: MatchRule::Single { value: "tcp".into() },
            weight: None,
        }];
        let r = rec(&[("proto", "tcp")]);
        assert_eq!(count_record(&features, &r), vec![1.0]);
    }

    #[test]
    fn range_respects_inf_upper_bound() {
        let features = vec![FeatureDescriptor {
            name: "big".into(),
            variable: "bytes".into(),
            rule: MatchRule::Range { value: ("1000".into(), "inf".into()) },
            weight: None,
        }];
        let r = rec(&[("bytes", "5000")]);
        assert_eq!(count_record(&features, &r), vec![1.0]);
    }

    #[test]
    fn default_fires_only_when_siblings_miss() {
        let features = vec![
            FeatureDescriptor {
                name: "tcp".into(),
                variable: "proto".into(),
                rule: MatchRule::Single { value: "tcp".into() },
                weight: None,
            },
            FeatureDescriptor {
                name: "other".into(),
                variable: "proto".into(),
                rule: MatchRule::Default,
                weight: None,
            },
        ];
        let udp = rec(&[("proto", "udp")]);
        assert_eq!(count_record(&features, &udp), vec![0.0, 1.0]);

        let tcp = rec(&[("proto", "tcp")]);
        assert_eq!(count_record(&features, &tcp), vec![1.0, 0.0]);
    }

    #[test]
    fn aggregate_sums_across_records() {
        let features = vec![FeatureDescriptor {
            name: "tcp".into(),
            variable: "proto".into(),
            rule: MatchRule::Single { value: "tcp".into() },
            weight: None,
        }];
        let records = vec![rec(&[("proto", "tcp")]), rec(&[("proto", "tcp")]), rec(&[("proto", "udp")])];
        assert_eq!(aggregate(&features, &records), vec![2.0]);
    }
}
