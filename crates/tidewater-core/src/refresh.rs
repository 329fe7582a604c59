//! Single-flight refresh coordination.
//!
//! At most one refresh runs per cache. The first caller becomes the leader
//! and owns a [`RefreshGuard`]; everyone arriving while it runs becomes a
//! waiter on a `watch` channel that the guard signals exactly once, on every
//! exit path (success, failure, or the leader's future being dropped).
//!
//! ```text
//!   Idle ──start_refresh()──▶ Refreshing ──end_refresh()──▶ Idle
//!                                 │
//!                waiters ◀── completion signal (seq, error)
//! ```

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{CacheError, SourceError};
use crate::source::DataSource;
use crate::version::{self, ImportWindowState, ProbeOutcome, VersionInfo, VersionProbe};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshPhase {
    #[default]
    Idle,
    Refreshing,
}

/// Mutable refresh bookkeeping, one per cache.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshState {
    pub phase: RefreshPhase,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub waiter_count: usize,
}

impl RefreshState {
    pub fn in_progress(&self) -> bool {
        self.phase == RefreshPhase::Refreshing
    }
}

/// Whether a refresh may skip the fetch when the probe reports no change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    /// Probe first; fetch only if upstream changed.
    Probe,
    /// Fetch unconditionally.
    Force,
}

/// How a `refresh` call ended for the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// This caller fetched and installed a new generation.
    Fetched { records: usize, attempts: u32 },
    /// Probe reported the cached data is current.
    Unchanged,
    /// Probed too recently; nothing was checked.
    Throttled,
    /// Upstream is mid-import; the cached data was kept.
    Incomplete,
    /// Another caller's refresh was in flight and this caller waited for it.
    Joined,
    /// Gave up waiting on another caller's refresh (stale data allowed).
    TimedOut,
}

/// Retry and waiting policy for a [`RefreshCoordinator`].
#[derive(Debug, Clone)]
pub struct RefreshPolicy {
    pub refresh_timeout: Duration,
    pub max_retry_attempts: u32,
    pub retry_delay: Duration,
    pub stale_if_error: bool,
    pub probe_interval: Duration,
    pub import_null_threshold: u32,
}

#[derive(Debug, Clone, Default)]
struct Completion {
    seq: u64,
    error: Option<CacheError>,
}

/// Counters reported through the cache status surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RefreshCounters {
    pub refreshes: u64,
    pub failures: u64,
    pub total_refresh_ms: u64,
}

impl RefreshCounters {
    pub fn avg_refresh_ms(&self) -> f64 {
        if self.refreshes + self.failures == 0 {
            0.0
        } else {
            self.total_refresh_ms as f64 / (self.refreshes + self.failures) as f64
        }
    }
}

/// Result of [`RefreshCoordinator::start_refresh`].
pub(crate) enum Ticket<'a> {
    /// Caller owns the refresh and must run it.
    Leader(RefreshGuard<'a>),
    /// Someone else is refreshing; wait on this receiver.
    Waiter(Waiter<'a>),
}

/// Owns the coordinator's `Refreshing` phase. Dropping it without calling
/// [`finish`](RefreshGuard::finish) ends the refresh as aborted.
pub(crate) struct RefreshGuard<'a> {
    coordinator: &'a RefreshCoordinator,
    started: Instant,
    done: bool,
}

enum Finish {
    Fetched,
    Checked { clear_error: bool },
    Failed(CacheError),
}

impl RefreshGuard<'_> {
    fn finish(mut self, finish: Finish) {
        self.done = true;
        self.coordinator.end_refresh(self.started, finish);
    }
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            tracing::warn!("refresh aborted before completion");
            self.coordinator.end_refresh(
                self.started,
                Finish::Failed(CacheError::Fetch {
                    attempts: 0,
                    message: "refresh aborted".to_string(),
                }),
            );
        }
    }
}

/// A caller parked on someone else's refresh.
pub(crate) struct Waiter<'a> {
    coordinator: &'a RefreshCoordinator,
    rx: watch::Receiver<Completion>,
}

/// Why a wait ended.
enum WaitResult {
    Completed(Option<CacheError>),
    Elapsed,
}

impl Waiter<'_> {
    async fn wait(mut self, timeout: Duration) -> WaitResult {
        match tokio::time::timeout(timeout, self.rx.changed()).await {
            Ok(Ok(())) => WaitResult::Completed(self.rx.borrow_and_update().error.clone()),
            // Sender lives as long as the coordinator; treat a closed channel as done.
            Ok(Err(_)) => WaitResult::Completed(None),
            Err(_) => WaitResult::Elapsed,
        }
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        let mut state = self.coordinator.lock_state();
        state.waiter_count = state.waiter_count.saturating_sub(1);
    }
}

/// Single-flight refresh state machine plus the version probe it drives.
pub struct RefreshCoordinator {
    policy: RefreshPolicy,
    state: Mutex<RefreshState>,
    completions: watch::Sender<Completion>,
    probe: Mutex<VersionProbe>,
    refreshes: AtomicU64,
    failures: AtomicU64,
    total_refresh_ms: AtomicU64,
}

impl RefreshCoordinator {
    pub fn new(policy: RefreshPolicy) -> Self {
        let probe = VersionProbe::new(policy.probe_interval, policy.import_null_threshold);
        let (completions, _) = watch::channel(Completion::default());
        Self {
            policy,
            state: Mutex::new(RefreshState::default()),
            completions,
            probe: Mutex::new(probe),
            refreshes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            total_refresh_ms: AtomicU64::new(0),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enter `Refreshing`, or join the refresh already in flight.
    pub(crate) fn start_refresh(&self) -> Ticket<'_> {
        let mut state = self.lock_state();
        if state.in_progress() {
            state.waiter_count += 1;
            // Subscribing under the state lock guarantees the completion
            // signal, which is sent under the same lock, is observed.
            return Ticket::Waiter(Waiter {
                coordinator: self,
                rx: self.completions.subscribe(),
            });
        }
        state.phase = RefreshPhase::Refreshing;
        state.started_at = Some(Utc::now());
        tracing::debug!("refresh started");
        Ticket::Leader(RefreshGuard {
            coordinator: self,
            started: Instant::now(),
            done: false,
        })
    }

    fn end_refresh(&self, started: Instant, finish: Finish) {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let mut state = self.lock_state();
        state.phase = RefreshPhase::Idle;
        state.completed_at = Some(Utc::now());

        let error = match finish {
            Finish::Fetched => {
                state.last_success_at = state.completed_at;
                state.last_error = None;
                self.refreshes.fetch_add(1, Ordering::Relaxed);
                self.total_refresh_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
                None
            }
            Finish::Checked { clear_error } => {
                if clear_error {
                    state.last_error = None;
                }
                None
            }
            Finish::Failed(err) => {
                state.last_error = Some(err.to_string());
                self.failures.fetch_add(1, Ordering::Relaxed);
                self.total_refresh_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
                Some(err)
            }
        };

        self.completions.send_modify(|c| {
            c.seq += 1;
            c.error = error;
        });
        tracing::debug!(elapsed_ms, waiters = state.waiter_count, "refresh ended");
    }

    /// Wait (bounded) for any in-flight refresh to end. Returns `false` on
    /// timeout; the refresh itself keeps running.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let waiter = {
            let mut state = self.lock_state();
            if !state.in_progress() {
                return true;
            }
            state.waiter_count += 1;
            Waiter {
                coordinator: self,
                rx: self.completions.subscribe(),
            }
        };
        matches!(waiter.wait(timeout).await, WaitResult::Completed(_))
    }

    /// Run one refresh round against `source`.
    ///
    /// Only the leader calls `fetch`, retrying up to `max_retry_attempts`
    /// times. `has_data` is asked only once this caller leads the round.
    /// A forced round still probes (unthrottled) so the version it loads is
    /// committed, but never skips the fetch. On success `install` receives the records and the version they
    /// reflect; on failure nothing is installed and only the leader sees the
    /// error. Waiters see it too unless `stale_if_error` is set.
    pub async fn refresh<R, H, F>(
        &self,
        source: &dyn DataSource<R>,
        mode: RefreshMode,
        has_data: H,
        install: F,
    ) -> Result<RefreshOutcome, CacheError>
    where
        H: FnOnce() -> bool,
        F: FnOnce(Vec<R>, Option<VersionInfo>),
    {
        let guard = match self.start_refresh() {
            Ticket::Leader(guard) => guard,
            Ticket::Waiter(waiter) => return self.join(waiter).await,
        };

        let probed = match mode {
            RefreshMode::Force => version::probe_now(&self.probe, || source.probe())
                .await
                .version(),
            RefreshMode::Probe => {
                let outcome = version::check(&self.probe, || source.probe()).await;
                if !outcome.needs_fetch(has_data()) {
                    let result = match outcome {
                        ProbeOutcome::Unchanged(_) => RefreshOutcome::Unchanged,
                        ProbeOutcome::Incomplete => RefreshOutcome::Incomplete,
                        _ => RefreshOutcome::Throttled,
                    };
                    tracing::debug!(source = source.name(), outcome = ?result, "refresh skipped");
                    guard.finish(Finish::Checked {
                        clear_error: matches!(outcome, ProbeOutcome::Unchanged(_)),
                    });
                    return Ok(result);
                }
                outcome.version()
            }
        };

        let max_attempts = self.policy.max_retry_attempts.max(1);
        let mut last_error: Option<SourceError> = None;
        for attempt in 1..=max_attempts {
            match source.fetch().await {
                Ok(records) => {
                    let count = records.len();
                    install(records, probed);
                    self.probe
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .commit(probed);
                    tracing::info!(
                        source = source.name(),
                        records = count,
                        attempt,
                        elapsed_ms = guard.started.elapsed().as_millis() as u64,
                        "refresh complete"
                    );
                    guard.finish(Finish::Fetched);
                    return Ok(RefreshOutcome::Fetched {
                        records: count,
                        attempts: attempt,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        source = source.name(),
                        attempt,
                        max_attempts,
                        error = %e,
                        "fetch attempt failed"
                    );
                    last_error = Some(e);
                    if attempt < max_attempts {
                        tokio::time::sleep(self.policy.retry_delay).await;
                    }
                }
            }
        }

        let err = CacheError::Fetch {
            attempts: max_attempts,
            message: last_error.map(|e| e.to_string()).unwrap_or_default(),
        };
        tracing::warn!(source = source.name(), error = %err, "refresh failed, keeping cached data");
        guard.finish(Finish::Failed(err.clone()));
        Err(err)
    }

    async fn join(&self, waiter: Waiter<'_>) -> Result<RefreshOutcome, CacheError> {
        match waiter.wait(self.policy.refresh_timeout).await {
            WaitResult::Completed(None) => Ok(RefreshOutcome::Joined),
            WaitResult::Completed(Some(err)) => {
                if self.policy.stale_if_error {
                    Ok(RefreshOutcome::Joined)
                } else {
                    Err(err)
                }
            }
            WaitResult::Elapsed => {
                if self.policy.stale_if_error {
                    tracing::debug!("gave up waiting on refresh, serving stale data");
                    Ok(RefreshOutcome::TimedOut)
                } else {
                    Err(CacheError::RefreshTimeout(self.policy.refresh_timeout))
                }
            }
        }
    }

    pub fn state(&self) -> RefreshState {
        self.lock_state().clone()
    }

    pub fn is_refreshing(&self) -> bool {
        self.lock_state().in_progress()
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock_state().last_error.clone()
    }

    pub fn known_version(&self) -> Option<VersionInfo> {
        self.probe.lock().unwrap_or_else(|e| e.into_inner()).known()
    }

    pub fn import_window(&self) -> ImportWindowState {
        self.probe
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .import_window()
            .clone()
    }

    pub fn counters(&self) -> RefreshCounters {
        RefreshCounters {
            refreshes: self.refreshes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            total_refresh_ms: self.total_refresh_ms.load(Ordering::Relaxed),
        }
    }

    pub fn policy(&self) -> &RefreshPolicy {
        &self.policy
    }
}

impl std::fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("state", &self.state())
            .field("counters", &self.counters())
            .finish()
    }
}
