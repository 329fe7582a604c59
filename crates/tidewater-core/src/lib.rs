use std::time::Duration;

use chrono::NaiveTime;

pub mod cache;
pub mod config_file;
pub mod error;
pub mod interval;
pub mod memo;
pub mod refresh;
pub mod scheduler;
pub mod source;
pub mod status;
pub mod tasks;
pub mod version;

// Re-export for convenience
pub use cache::{Cache, CacheGeneration, DataView};
pub use config_file::ConfigFile;
pub use error::{CacheError, SourceError, TaskError};
pub use memo::MemoCache;
pub use refresh::{RefreshOutcome, RefreshState};
pub use scheduler::RefreshScheduler;
pub use source::{DataSource, SourceFuture};
pub use status::CacheStatus;
pub use tasks::{TaskId, TaskInfo, TaskManager, TaskStats, TaskStatus};
pub use version::{ImportWindowState, VersionInfo};

/// Default daily upstream publication time (UTC).
pub const DEFAULT_EXPECTED_UPDATE_TIME: (u32, u32) = (8, 0);

/// Resolved runtime configuration for the cache, its scheduler and the task
/// manager.
#[derive(Debug, Clone)]
pub struct Config {
    /// Poll interval when nothing better is known.
    pub base_refresh_interval: Duration,
    /// Poll interval once today's upstream data is in.
    pub max_refresh_interval: Duration,
    /// Age past which data must be refetched regardless of the adaptive interval.
    pub force_refresh_interval: Duration,
    /// How long a caller waits on someone else's refresh.
    pub refresh_timeout: Duration,
    pub max_retry_attempts: u32,
    pub retry_delay: Duration,
    /// Serve the last good data instead of failing when a refresh errors or times out.
    pub stale_if_error: bool,
    /// Wall-clock time (UTC) at which upstream usually publishes.
    pub expected_update_time: NaiveTime,
    /// Half-width of the window around `expected_update_time`.
    pub update_window: Duration,
    /// Minimum spacing between version probes.
    pub probe_interval: Duration,
    /// Consecutive null probes before an import window is declared.
    pub import_null_threshold: u32,
    pub suppress_refresh_during_import: bool,
    pub max_concurrent_tasks: usize,
    pub task_max_age_minutes: u64,
    pub task_cleanup_interval: Duration,
    pub memo_ttl: Duration,
    pub memo_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        let (h, m) = DEFAULT_EXPECTED_UPDATE_TIME;
        Self {
            base_refresh_interval: Duration::from_secs(300),
            max_refresh_interval: Duration::from_secs(3600),
            force_refresh_interval: Duration::from_secs(6 * 60 * 60),
            refresh_timeout: Duration::from_secs(30),
            max_retry_attempts: 3,
            retry_delay: Duration::from_secs(5),
            stale_if_error: true,
            expected_update_time: NaiveTime::from_hms_opt(h, m, 0).unwrap_or(NaiveTime::MIN),
            update_window: Duration::from_secs(1800),
            probe_interval: Duration::from_secs(60),
            import_null_threshold: 15,
            suppress_refresh_during_import: true,
            max_concurrent_tasks: 2,
            task_max_age_minutes: 60,
            task_cleanup_interval: Duration::from_secs(5 * 60),
            memo_ttl: Duration::from_secs(10 * 60),
            memo_capacity: 1024,
        }
    }
}

impl Config {
    /// Resolve an on-disk config over the defaults.
    pub fn from_file(file: &config_file::ConfigFile) -> Self {
        file.resolve()
    }

    /// Refresh-coordinator subset of this config.
    pub fn refresh_policy(&self) -> refresh::RefreshPolicy {
        refresh::RefreshPolicy {
            refresh_timeout: self.refresh_timeout,
            max_retry_attempts: self.max_retry_attempts.max(1),
            retry_delay: self.retry_delay,
            stale_if_error: self.stale_if_error,
            probe_interval: self.probe_interval,
            import_null_threshold: self.import_null_threshold,
        }
    }

    pub fn task_max_age(&self) -> Duration {
        Duration::from_secs(self.task_max_age_minutes.saturating_mul(60))
    }
}
