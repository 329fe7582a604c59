//! Two-generation dataset cache with stale-while-revalidate reads.
//!
//! **current** – the latest successfully fetched snapshot.
//! **previous** – the snapshot `current` replaced; the stale fallback.
//!
//! Both slots live behind one [`ArcSwap`], so readers never block on a
//! refresh and never observe a half-swapped pair. Only the refresh leader
//! (see [`RefreshCoordinator`]) stores into it.
//!
//! Staleness is judged at read time from the generation's age and the
//! adaptive interval in [`interval`](crate::interval); it is never a stored
//! flag.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::Config;
use crate::error::CacheError;
use crate::interval;
use crate::refresh::{RefreshCoordinator, RefreshMode, RefreshOutcome, RefreshState};
use crate::source::DataSource;
use crate::status::{self, CacheStatus};
use crate::version::{ImportWindowState, VersionInfo};

/// An immutable snapshot of the upstream dataset.
#[derive(Debug)]
pub struct CacheGeneration<R> {
    pub records: Vec<R>,
    pub captured_at: DateTime<Utc>,
    pub version: Option<VersionInfo>,
    /// Monotonic generation number, starting at 1.
    pub seq: u64,
    captured: Instant,
}

impl<R> CacheGeneration<R> {
    pub fn age(&self) -> Duration {
        self.captured.elapsed()
    }
}

#[derive(Debug)]
struct Generations<R> {
    current: Option<Arc<CacheGeneration<R>>>,
    previous: Option<Arc<CacheGeneration<R>>>,
}

impl<R> Default for Generations<R> {
    fn default() -> Self {
        Self {
            current: None,
            previous: None,
        }
    }
}

/// What a reader gets back from [`Cache::get_data`].
#[derive(Debug)]
pub struct DataView<R> {
    generation: Option<Arc<CacheGeneration<R>>>,
    pub is_stale: bool,
}

impl<R> DataView<R> {
    /// Records of the served generation (empty when nothing is cached).
    pub fn records(&self) -> &[R] {
        self.generation
            .as_ref()
            .map(|g| g.records.as_slice())
            .unwrap_or(&[])
    }

    pub fn generation(&self) -> Option<&Arc<CacheGeneration<R>>> {
        self.generation.as_ref()
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }
}

/// Thread-safe, single-process cache of one upstream dataset.
pub struct Cache<R> {
    config: Config,
    generations: ArcSwap<Generations<R>>,
    coordinator: RefreshCoordinator,
    next_seq: AtomicU64,
    accesses: AtomicU64,
}

impl<R: Send + Sync + 'static> Cache<R> {
    pub fn new(config: Config) -> Self {
        let coordinator = RefreshCoordinator::new(config.refresh_policy());
        Self {
            config,
            generations: ArcSwap::from_pointee(Generations::default()),
            coordinator,
            next_seq: AtomicU64::new(1),
            accesses: AtomicU64::new(0),
        }
    }

    /// Read the cached records and whether they should be considered stale.
    ///
    /// While a refresh is in flight this waits for it (bounded by
    /// `refresh_timeout`) instead of racing it. On timeout the last good
    /// data is served marked stale, or [`CacheError::RefreshTimeout`] is
    /// returned when `stale_if_error` is off.
    pub async fn get_data(&self) -> Result<DataView<R>, CacheError> {
        self.accesses.fetch_add(1, Ordering::Relaxed);

        if self.coordinator.is_refreshing()
            && !self
                .coordinator
                .wait_idle(self.config.refresh_timeout)
                .await
        {
            if !self.config.stale_if_error {
                return Err(CacheError::RefreshTimeout(self.config.refresh_timeout));
            }
            tracing::debug!("refresh still running, serving last good generation");
            let gens = self.generations.load();
            let generation = gens.current.clone().or_else(|| gens.previous.clone());
            return Ok(DataView {
                generation,
                is_stale: true,
            });
        }

        Ok(self.peek())
    }

    /// Current generation without waiting and without counting an access.
    pub fn peek(&self) -> DataView<R> {
        let generation = self.generations.load().current.clone();
        let is_stale = self.judge_stale(generation.as_deref());
        DataView {
            generation,
            is_stale,
        }
    }

    /// The generation `current` replaced, if any.
    pub fn previous(&self) -> Option<Arc<CacheGeneration<R>>> {
        self.generations.load().previous.clone()
    }

    /// Probe upstream and refetch if it changed. Single-flight: concurrent
    /// callers join the running refresh instead of starting another.
    pub async fn refresh(&self, source: &dyn DataSource<R>) -> Result<RefreshOutcome, CacheError> {
        self.run_refresh(source, RefreshMode::Probe).await
    }

    /// Refetch unconditionally. Upstream is still probed, ignoring the
    /// throttle, so the version of the fetched data is remembered.
    pub async fn force_refresh(
        &self,
        source: &dyn DataSource<R>,
    ) -> Result<RefreshOutcome, CacheError> {
        self.run_refresh(source, RefreshMode::Force).await
    }

    async fn run_refresh(
        &self,
        source: &dyn DataSource<R>,
        mode: RefreshMode,
    ) -> Result<RefreshOutcome, CacheError> {
        self.coordinator
            .refresh(
                source,
                mode,
                || self.generations.load().current.is_some(),
                |records, version| self.install(records, version),
            )
            .await
    }

    /// Demote `current` to `previous` and publish the new generation.
    fn install(&self, records: Vec<R>, version: Option<VersionInfo>) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let fresh = Arc::new(CacheGeneration {
            records,
            captured_at: Utc::now(),
            version: version.or_else(|| self.coordinator.known_version()),
            seq,
            captured: Instant::now(),
        });
        let old = self.generations.load_full();
        self.generations.store(Arc::new(Generations {
            current: Some(fresh),
            previous: old.current.clone(),
        }));
    }

    fn judge_stale(&self, current: Option<&CacheGeneration<R>>) -> bool {
        let Some(generation) = current else {
            return true;
        };
        if self.coordinator.last_error().is_some() {
            return true;
        }
        generation.age() > self.next_check_interval()
    }

    /// Adaptive interval for the next staleness check, from the last known
    /// upstream version.
    pub fn next_check_interval(&self) -> Duration {
        interval::next_check_interval(
            Utc::now(),
            self.coordinator.known_version().as_ref(),
            &self.config,
        )
    }

    /// Whether the cached data is stale right now.
    pub fn is_stale(&self) -> bool {
        let gens = self.generations.load();
        self.judge_stale(gens.current.as_deref())
    }

    /// Whether the data is too old to serve without a blocking refresh,
    /// regardless of the adaptive interval.
    pub fn needs_force_refresh(&self) -> bool {
        match self.generations.load().current.as_deref() {
            None => true,
            Some(generation) => generation.age() > self.config.force_refresh_interval,
        }
    }

    pub fn refresh_state(&self) -> RefreshState {
        self.coordinator.state()
    }

    pub fn import_window(&self) -> ImportWindowState {
        self.coordinator.import_window()
    }

    pub fn accesses(&self) -> u64 {
        self.accesses.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn status(&self) -> CacheStatus {
        let gens = self.generations.load();
        let current = gens.current.as_deref();
        let state = self.coordinator.state();
        let import_window = self.coordinator.import_window();
        let counters = self.coordinator.counters();
        let age_secs = current.map(|g| g.age().as_secs());

        CacheStatus {
            is_stale: self.judge_stale(current),
            confidence: status::confidence_score(
                age_secs,
                self.config.force_refresh_interval.as_secs(),
                state.last_error.is_some(),
                import_window.detected,
            ),
            has_data: current.is_some(),
            record_count: current.map(|g| g.records.len()).unwrap_or(0),
            previous_record_count: gens.previous.as_ref().map(|g| g.records.len()),
            seconds_since_refresh: age_secs,
            seconds_until_expected_update: interval::seconds_until_expected_update(
                Utc::now(),
                self.config.expected_update_time,
            ),
            next_check_interval_secs: self.next_check_interval().as_secs(),
            needs_force_refresh: self.needs_force_refresh(),
            refresh_in_progress: state.in_progress(),
            waiter_count: state.waiter_count,
            last_error: state.last_error,
            last_version: self.coordinator.known_version(),
            import_window,
            accesses: self.accesses(),
            avg_refresh_ms: counters.avg_refresh_ms(),
            counters,
        }
    }
}

impl<R> std::fmt::Debug for Cache<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let gens = self.generations.load();
        f.debug_struct("Cache")
            .field(
                "current",
                &gens.current.as_ref().map(|g| (g.seq, g.records.len())),
            )
            .field(
                "previous",
                &gens.previous.as_ref().map(|g| (g.seq, g.records.len())),
            )
            .field("accesses", &self.accesses.load(Ordering::Relaxed))
            .field("coordinator", &self.coordinator)
            .finish()
    }
}
