//! Cheap upstream change detection.
//!
//! A probe asks upstream for a `(record_count, last_modified)` fingerprint.
//! Probes are throttled to one per `probe_interval`; between probes the cache
//! assumes nothing changed. A failing probe fails open (assume changed), and a
//! probe that comes back with null fields feeds the import-window detector.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::SourceError;

/// Upstream fingerprint used to decide whether a full refetch is worth it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub last_modified: DateTime<Utc>,
    pub record_count: u64,
}

/// Tracks upstream "import windows": stretches where probes return nulls
/// because upstream is mid-load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportWindowState {
    pub consecutive_null_count: u32,
    pub detected: bool,
    pub last_detected_at: Option<DateTime<Utc>>,
}

impl ImportWindowState {
    fn record_null(&mut self, threshold: u32, now: DateTime<Utc>) {
        self.consecutive_null_count = self.consecutive_null_count.saturating_add(1);
        if self.consecutive_null_count >= threshold {
            if !self.detected {
                tracing::info!(
                    nulls = self.consecutive_null_count,
                    "upstream import window detected"
                );
            }
            self.detected = true;
            self.last_detected_at = Some(now);
        }
    }

    fn reset(&mut self) {
        if self.detected {
            tracing::info!("upstream import window closed");
        }
        self.consecutive_null_count = 0;
        self.detected = false;
    }
}

/// Result of one [`VersionProbe`] check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Probed too recently; no upstream call was made.
    Throttled,
    /// Fingerprint matches the last committed version.
    Unchanged(VersionInfo),
    /// Refetch warranted. `None` when the new version is unknown (first
    /// probe failed or the source cannot probe).
    Changed(Option<VersionInfo>),
    /// Upstream answered with null fields (import in progress).
    Incomplete,
}

impl ProbeOutcome {
    /// Whether a full fetch should follow. Incomplete and throttled probes
    /// only force a fetch when there is nothing cached yet.
    pub fn needs_fetch(&self, has_data: bool) -> bool {
        match self {
            ProbeOutcome::Changed(_) => true,
            ProbeOutcome::Unchanged(_) => false,
            ProbeOutcome::Throttled | ProbeOutcome::Incomplete => !has_data,
        }
    }

    pub fn version(&self) -> Option<VersionInfo> {
        match self {
            ProbeOutcome::Unchanged(v) => Some(*v),
            ProbeOutcome::Changed(v) => *v,
            ProbeOutcome::Throttled | ProbeOutcome::Incomplete => None,
        }
    }
}

/// Throttled change detector. The committed version only moves forward
/// after a successful fetch (see [`commit`](VersionProbe::commit)).
#[derive(Debug)]
pub struct VersionProbe {
    interval: Duration,
    null_threshold: u32,
    last_probe_at: Option<Instant>,
    known: Option<VersionInfo>,
    import: ImportWindowState,
}

impl VersionProbe {
    pub fn new(interval: Duration, null_threshold: u32) -> Self {
        Self {
            interval,
            null_threshold: null_threshold.max(1),
            last_probe_at: None,
            known: None,
            import: ImportWindowState::default(),
        }
    }

    /// True when enough time has passed since the previous probe.
    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_probe_at {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        }
    }

    /// Classify a probe result and update import-window bookkeeping.
    pub fn observe(
        &mut self,
        now: Instant,
        result: Result<Option<VersionInfo>, SourceError>,
    ) -> ProbeOutcome {
        self.last_probe_at = Some(now);
        match result {
            Ok(Some(fresh)) => {
                self.import.reset();
                let Some(known) = self.known else {
                    return ProbeOutcome::Changed(Some(fresh));
                };
                if known.record_count != fresh.record_count {
                    tracing::debug!(
                        was = known.record_count,
                        now = fresh.record_count,
                        "record count changed"
                    );
                    ProbeOutcome::Changed(Some(fresh))
                } else if known.last_modified != fresh.last_modified {
                    tracing::debug!(
                        was = %known.last_modified,
                        now = %fresh.last_modified,
                        "last-modified changed"
                    );
                    ProbeOutcome::Changed(Some(fresh))
                } else {
                    ProbeOutcome::Unchanged(fresh)
                }
            }
            Ok(None) => {
                self.import.record_null(self.null_threshold, Utc::now());
                tracing::debug!(
                    nulls = self.import.consecutive_null_count,
                    "probe returned incomplete fingerprint"
                );
                ProbeOutcome::Incomplete
            }
            Err(SourceError::ProbeUnsupported) => ProbeOutcome::Changed(None),
            Err(e) => {
                tracing::warn!(error = %e, "version probe failed, assuming upstream changed");
                ProbeOutcome::Changed(None)
            }
        }
    }

    /// Record the version that the cached data now reflects.
    pub fn commit(&mut self, version: Option<VersionInfo>) {
        if version.is_some() {
            self.known = version;
        }
    }

    pub fn known(&self) -> Option<VersionInfo> {
        self.known
    }

    pub fn import_window(&self) -> &ImportWindowState {
        &self.import
    }
}

/// Run a throttled probe. `probe_fn` is only invoked when the probe is due;
/// the lock is never held across the upstream call.
pub async fn check<F, Fut>(probe: &Mutex<VersionProbe>, probe_fn: F) -> ProbeOutcome
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Option<VersionInfo>, SourceError>>,
{
    let due = probe
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .is_due(Instant::now());
    if !due {
        tracing::trace!("probe throttled");
        return ProbeOutcome::Throttled;
    }

    probe_now(probe, probe_fn).await
}

/// Probe immediately, ignoring the throttle. A forced refresh uses this so
/// the version it loads is still recorded.
pub async fn probe_now<F, Fut>(probe: &Mutex<VersionProbe>, probe_fn: F) -> ProbeOutcome
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Option<VersionInfo>, SourceError>>,
{
    let result = probe_fn().await;
    probe
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .observe(Instant::now(), result)
}
