//! Scripted data source for tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{DataSource, SourceFuture};
use crate::error::SourceError;
use crate::version::VersionInfo;

/// A configurable fetch response for [`MockSource`].
#[derive(Clone, Debug)]
pub enum MockFetch<R> {
    Records(Vec<R>),
    Error(String),
}

/// A configurable probe response for [`MockSource`].
#[derive(Clone, Debug)]
pub enum MockProbe {
    Version(VersionInfo),
    /// Upstream answered with nulls.
    Incomplete,
    Error(String),
    Unsupported,
}

/// A hand-rolled [`DataSource`] for tests.
///
/// Supports:
/// - A sequence of fetch responses (one per call, repeating the last).
/// - A sequence of probe responses, same rule.
/// - Optional per-fetch latency.
/// - Call counting via [`fetch_count()`](MockSource::fetch_count) and
///   [`probe_count()`](MockSource::probe_count).
pub struct MockSource<R> {
    name: &'static str,
    fetches: Mutex<Vec<MockFetch<R>>>,
    last_fetch: Mutex<MockFetch<R>>,
    probes: Mutex<Vec<MockProbe>>,
    last_probe: Mutex<MockProbe>,
    delay: Option<Duration>,
    fetch_count: AtomicUsize,
    probe_count: AtomicUsize,
}

impl<R: Clone + Send + Sync + 'static> MockSource<R> {
    /// A source that always returns `records` and cannot probe.
    pub fn new(name: &'static str, records: Vec<R>) -> Self {
        Self::with_fetches(name, vec![MockFetch::Records(records)])
    }

    /// A source whose fetch always fails.
    pub fn failing(name: &'static str, message: &str) -> Self {
        Self::with_fetches(name, vec![MockFetch::Error(message.to_string())])
    }

    /// Return `responses` in order, repeating the last one.
    pub fn with_fetches(name: &'static str, mut responses: Vec<MockFetch<R>>) -> Self {
        assert!(!responses.is_empty(), "need at least one fetch response");
        responses.reverse();
        let last = responses[0].clone();
        Self {
            name,
            fetches: Mutex::new(responses),
            last_fetch: Mutex::new(last),
            probes: Mutex::new(Vec::new()),
            last_probe: Mutex::new(MockProbe::Unsupported),
            delay: None,
            fetch_count: AtomicUsize::new(0),
            probe_count: AtomicUsize::new(0),
        }
    }

    /// Script probe responses, repeating the last one.
    pub fn with_probes(self, mut responses: Vec<MockProbe>) -> Self {
        assert!(!responses.is_empty(), "need at least one probe response");
        responses.reverse();
        *self.last_probe.lock().unwrap() = responses[0].clone();
        *self.probes.lock().unwrap() = responses;
        self
    }

    /// Simulated upstream latency per fetch.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Replace every pending and future fetch response.
    pub fn set_fetch(&self, response: MockFetch<R>) {
        self.fetches.lock().unwrap().clear();
        *self.last_fetch.lock().unwrap() = response;
    }

    /// Replace every pending and future probe response.
    pub fn set_probe(&self, response: MockProbe) {
        self.probes.lock().unwrap().clear();
        *self.last_probe.lock().unwrap() = response;
    }

    pub fn fetch_count(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }

    pub fn probe_count(&self) -> usize {
        self.probe_count.load(Ordering::SeqCst)
    }

    fn next_fetch(&self) -> MockFetch<R> {
        let mut seq = self.fetches.lock().unwrap();
        match seq.pop() {
            Some(resp) => {
                *self.last_fetch.lock().unwrap() = resp.clone();
                resp
            }
            None => self.last_fetch.lock().unwrap().clone(),
        }
    }

    fn next_probe(&self) -> MockProbe {
        let mut seq = self.probes.lock().unwrap();
        match seq.pop() {
            Some(resp) => {
                *self.last_probe.lock().unwrap() = resp.clone();
                resp
            }
            None => self.last_probe.lock().unwrap().clone(),
        }
    }
}

impl<R: Clone + Send + Sync + 'static> DataSource<R> for MockSource<R> {
    fn name(&self) -> &str {
        self.name
    }

    fn fetch(&self) -> SourceFuture<'_, Vec<R>> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        let response = self.next_fetch();
        let delay = self.delay;

        Box::pin(async move {
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            match response {
                MockFetch::Records(records) => Ok(records),
                MockFetch::Error(msg) => Err(SourceError::Fetch(msg)),
            }
        })
    }

    fn probe(&self) -> SourceFuture<'_, Option<VersionInfo>> {
        self.probe_count.fetch_add(1, Ordering::SeqCst);
        let response = self.next_probe();
        Box::pin(async move {
            match response {
                MockProbe::Version(v) => Ok(Some(v)),
                MockProbe::Incomplete => Ok(None),
                MockProbe::Error(msg) => Err(SourceError::Probe(msg)),
                MockProbe::Unsupported => Err(SourceError::ProbeUnsupported),
            }
        })
    }
}
