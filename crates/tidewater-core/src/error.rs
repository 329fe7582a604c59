//! Error types shared across the cache, the upstream source and the task manager.

use std::time::Duration;

use thiserror::Error;

use crate::tasks::{TaskId, TaskStatus};

/// Error returned by a [`DataSource`](crate::source::DataSource).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// Full dataset fetch failed.
    #[error("fetch failed: {0}")]
    Fetch(String),
    /// Version fingerprint check failed.
    #[error("probe failed: {0}")]
    Probe(String),
    /// The source has no cheap change signal.
    #[error("source does not support version probes")]
    ProbeUnsupported,
}

impl From<String> for SourceError {
    fn from(s: String) -> Self {
        SourceError::Fetch(s)
    }
}

/// Error surfaced by [`Cache`](crate::cache::Cache) read and refresh paths.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Upstream fetch failed after exhausting every retry.
    #[error("refresh failed after {attempts} attempt(s): {message}")]
    Fetch { attempts: u32, message: String },
    /// Waited on an in-flight refresh for longer than the configured timeout.
    #[error("timed out after {:.1}s waiting for in-flight refresh", .0.as_secs_f64())]
    RefreshTimeout(Duration),
}

/// Error returned by [`TaskManager`](crate::tasks::TaskManager) operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("unknown task {0}")]
    NotFound(TaskId),
    /// Attempted to complete or fail a task that is not processing.
    #[error("task {id} cannot finish from state {from:?}")]
    InvalidTransition { id: TaskId, from: TaskStatus },
    #[error("timed out waiting for task {0}")]
    WaitTimeout(TaskId),
}
