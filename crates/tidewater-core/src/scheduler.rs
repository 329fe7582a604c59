//! Background refresh loop for a [`Cache`].
//!
//! Sleeps for the cache's adaptive check interval, then probes (or, once
//! the data has aged past `force_refresh_interval`, refetches outright).
//! While an upstream import window is detected and suppression is on, a
//! cycle never forces a refetch; it only probes, so the window can close.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::Cache;
use crate::error::CacheError;
use crate::refresh::RefreshOutcome;
use crate::source::DataSource;

/// Lower bound on the sleep between cycles.
const MIN_CYCLE: Duration = Duration::from_secs(1);

pub struct RefreshScheduler<R> {
    cache: Arc<Cache<R>>,
    source: Arc<dyn DataSource<R>>,
}

impl<R: Send + Sync + 'static> RefreshScheduler<R> {
    pub fn new(cache: Arc<Cache<R>>, source: Arc<dyn DataSource<R>>) -> Self {
        Self { cache, source }
    }

    /// Start the loop on the current runtime. The first cycle runs
    /// immediately; the loop exits when `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(source = self.source.name(), "refresh scheduler started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.run_cycle() => {}
                }
                let wait = self.cache.next_check_interval().max(MIN_CYCLE);
                tracing::debug!(next_check_secs = wait.as_secs(), "scheduler sleeping");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
            }
            tracing::info!(source = self.source.name(), "refresh scheduler stopped");
        })
    }

    /// One scheduling decision plus the refresh it triggers.
    pub async fn run_cycle(&self) -> Result<RefreshOutcome, CacheError> {
        let importing = self.cache.import_window().detected;
        let suppress = importing && self.cache.config().suppress_refresh_during_import;

        let result = if self.cache.needs_force_refresh() && !suppress {
            tracing::info!(source = self.source.name(), "data too old, forcing refresh");
            self.cache.force_refresh(self.source.as_ref()).await
        } else {
            if suppress {
                tracing::debug!("import window open, probing only");
            }
            self.cache.refresh(self.source.as_ref()).await
        };

        match &result {
            Ok(outcome) => tracing::debug!(?outcome, "scheduled refresh finished"),
            Err(e) => tracing::warn!(error = %e, "scheduled refresh failed"),
        }
        result
    }
}
