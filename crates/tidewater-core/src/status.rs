//! Operator-facing status snapshot.

use serde::Serialize;

use crate::refresh::RefreshCounters;
use crate::version::{ImportWindowState, VersionInfo};

/// Point-in-time view of a [`Cache`](crate::cache::Cache), suitable for a
/// status endpoint or a CLI printout.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub is_stale: bool,
    /// 0.0 (no usable data) to 1.0 (fresh, healthy).
    pub confidence: f64,
    pub has_data: bool,
    pub record_count: usize,
    pub previous_record_count: Option<usize>,
    pub seconds_since_refresh: Option<u64>,
    pub seconds_until_expected_update: u64,
    pub next_check_interval_secs: u64,
    pub needs_force_refresh: bool,
    pub refresh_in_progress: bool,
    pub waiter_count: usize,
    pub last_error: Option<String>,
    pub last_version: Option<VersionInfo>,
    pub import_window: ImportWindowState,
    pub accesses: u64,
    pub counters: RefreshCounters,
    pub avg_refresh_ms: f64,
}

/// Confidence that cached data reflects upstream.
///
/// Linear decay from 1.0 at capture to 0.0 at `force_after_secs`, halved
/// while the last refresh failed or upstream is mid-import.
pub fn confidence_score(
    age_secs: Option<u64>,
    force_after_secs: u64,
    last_failed: bool,
    importing: bool,
) -> f64 {
    let Some(age) = age_secs else {
        return 0.0;
    };
    let mut score = if force_after_secs == 0 {
        0.0
    } else {
        (1.0 - age as f64 / force_after_secs as f64).clamp(0.0, 1.0)
    };
    if last_failed {
        score *= 0.5;
    }
    if importing {
        score *= 0.5;
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_data_has_zero_confidence() {
        assert_eq!(confidence_score(None, 3600, false, false), 0.0);
    }

    #[test]
    fn decays_with_age() {
        assert_eq!(confidence_score(Some(0), 3600, false, false), 1.0);
        assert_eq!(confidence_score(Some(1800), 3600, false, false), 0.5);
        assert_eq!(confidence_score(Some(7200), 3600, false, false), 0.0);
    }

    #[test]
    fn failures_and_imports_halve() {
        assert_eq!(confidence_score(Some(0), 3600, true, false), 0.5);
        assert_eq!(confidence_score(Some(0), 3600, true, true), 0.25);
    }
}
