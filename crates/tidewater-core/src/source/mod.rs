//! Upstream data source trait.
//!
//! The cache never talks to upstream directly; callers inject a
//! [`DataSource`] that knows how to pull a full snapshot and, optionally,
//! a cheap version fingerprint.

pub mod mock;

use std::future::Future;
use std::pin::Pin;

use crate::error::SourceError;
use crate::version::VersionInfo;

/// Boxed future returned by [`DataSource`] methods.
pub type SourceFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SourceError>> + Send + 'a>>;

/// An upstream that yields full dataset snapshots of `R`.
///
/// `fetch` must be idempotent: the refresh coordinator retries it.
pub trait DataSource<R>: Send + Sync {
    /// Human-readable name used in logs.
    fn name(&self) -> &str;

    /// Pull a complete snapshot.
    fn fetch(&self) -> SourceFuture<'_, Vec<R>>;

    /// Cheap fingerprint check. `Ok(None)` means upstream answered with
    /// null fields, which happens while it is mid-import.
    fn probe(&self) -> SourceFuture<'_, Option<VersionInfo>> {
        Box::pin(async { Err(SourceError::ProbeUnsupported) })
    }
}
