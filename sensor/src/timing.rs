//! Canonical interval timestamp (C4/C3/C5 shared dependency): every
//! producer that writes into a source's `files_generated` map — the
//! interval driver itself, a local ingest worker, a peer sensor minting
//! the `ts` it forwards upstream — must agree on the same tag for the
//! same wall-clock window, or the scheduler's readiness join
//! (`SourceHandle::is_ready`) never sees a match.
//!
//! Rather than pass the driver's freshly-minted `ts` down through every
//! producer, `ts` is defined as a pure function of wall-clock time,
//! `Tw`, and the configured format: the start of the `Tw`-second window
//! containing "now", floored to the epoch. Any two processes configured
//! with the same `Tw` and `GeneralParams.tsDateFormat` compute the same
//! string for the same window without coordinating directly, which is
//! what lets a child sensor's forwarded `ts` line up with its parent's
//! own window tag.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// The wall-clock instant at the start of the `Tw`-second window
/// containing `now`.
fn window_start(now: DateTime<Utc>, tw: Duration) -> DateTime<Utc> {
    let tw_secs = tw.as_secs().max(1) as i64;
    let floored = (now.timestamp() / tw_secs) * tw_secs;
    DateTime::from_timestamp(floored, 0).unwrap_or(now)
}

/// The canonical interval tag for "now": the start of the current
/// `Tw`-second window, formatted per `GeneralParams.tsDateFormat`.
pub fn current_window_ts(tw: Duration, format: &str) -> String {
    window_start(Utc::now(), tw).format(format).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_tw_and_format_agree_within_a_window() {
        let tw = Duration::from_secs(10);
        let format = "%Y%m%d%H%M%S";
        let a = current_window_ts(tw, format);
        let b = current_window_ts(tw, format);
        assert_eq!(a, b);
    }

    #[test]
    fn window_start_floors_to_tw_boundary() {
        let tw = Duration::from_secs(60);
        let now = DateTime::from_timestamp(125, 0).unwrap();
        let start = window_start(now, tw);
        assert_eq!(start.timestamp(), 120);
    }

    #[test]
    fn differing_formats_still_floor_to_the_same_instant() {
        let tw = Duration::from_secs(300);
        let now = DateTime::from_timestamp(1_700_000_123, 0).unwrap();
        let start_a = window_start(now, tw);
        let start_b = window_start(now, tw);
        assert_eq!(start_a, start_b);
    }
}
