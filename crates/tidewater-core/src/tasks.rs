//! Bounded-concurrency task manager.
//!
//! Every submitted unit of work gets a [`TaskId`] and moves through
//! `Requested → Processing → {Completed | Failed}`. At most
//! `max_concurrent` tasks hold a slot at once; the rest wait in a FIFO queue
//! and are promoted as slots free up. A slot is released when the task's work
//! ends, even if the task was completed or failed by hand before that. The task table, the queue and the
//! active counter live behind one mutex; tasks are spawned after it is
//! released.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::TaskError;

/// Boxed unit of work. `Err` text is stored on the task as its error.
pub type TaskWork<T> = Pin<Box<dyn Future<Output = Result<T, String>> + Send + 'static>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Requested,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Snapshot of one task, as returned by [`TaskManager::get`].
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo<T> {
    pub id: TaskId,
    pub status: TaskStatus,
    pub requested_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<T>,
    pub error: Option<String>,
    /// 1-based rank among queued tasks; `None` once the task has started.
    pub queue_position: Option<usize>,
    /// Manager-wide number of occupied slots at snapshot time.
    pub active_count: usize,
}

/// Counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    pub requested: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub max_concurrent: usize,
}

struct TaskRecord<T> {
    status: TaskStatus,
    requested_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    requested: Instant,
    started: Option<Instant>,
    finished: Option<Instant>,
    result: Option<T>,
    error: Option<String>,
}

impl<T> TaskRecord<T> {
    fn new() -> Self {
        Self {
            status: TaskStatus::Requested,
            requested_at: Utc::now(),
            started_at: None,
            finished_at: None,
            requested: Instant::now(),
            started: None,
            finished: None,
            result: None,
            error: None,
        }
    }

    fn mark_processing(&mut self) {
        self.status = TaskStatus::Processing;
        self.started_at = Some(Utc::now());
        self.started = Some(Instant::now());
    }

    fn finish(&mut self, id: TaskId, outcome: Result<T, String>) {
        self.finished_at = Some(Utc::now());
        self.finished = Some(Instant::now());
        let elapsed_ms = self
            .started
            .map(|s| s.elapsed().as_millis() as u64)
            .unwrap_or(0);
        match outcome {
            Ok(result) => {
                self.status = TaskStatus::Completed;
                self.result = Some(result);
                tracing::info!(task_id = %id, elapsed_ms, "task completed");
            }
            Err(error) => {
                tracing::warn!(task_id = %id, elapsed_ms, error = %error, "task failed");
                self.status = TaskStatus::Failed;
                self.error = Some(error);
            }
        }
    }

    /// Instant the task entered its current state.
    fn state_since(&self) -> Instant {
        self.finished.or(self.started).unwrap_or(self.requested)
    }
}

struct TaskTable<T> {
    tasks: HashMap<TaskId, TaskRecord<T>>,
    /// Requested tasks in submission order, with their pending work.
    queue: VecDeque<(TaskId, TaskWork<T>)>,
    /// Slots held by spawned work that has not ended yet.
    active: usize,
}

impl<T> TaskTable<T> {
    fn position(&self, id: TaskId) -> Option<usize> {
        self.queue.iter().position(|(q, _)| *q == id).map(|i| i + 1)
    }

    /// Fill free slots from the head of the queue.
    fn promote(&mut self, max_concurrent: usize) -> Vec<(TaskId, TaskWork<T>)> {
        let mut started = Vec::new();
        while self.active < max_concurrent {
            let Some((id, work)) = self.queue.pop_front() else {
                break;
            };
            let Some(record) = self.tasks.get_mut(&id) else {
                continue;
            };
            record.mark_processing();
            self.active += 1;
            started.push((id, work));
        }
        started
    }
}

struct Inner<T> {
    table: Mutex<TaskTable<T>>,
    max_concurrent: usize,
    /// Bumped on every state change so `wait` can re-check.
    changed: watch::Sender<u64>,
}

/// Runs submitted work with at most `max_concurrent` tasks in flight.
///
/// Cheap to clone; clones share the same table.
pub struct TaskManager<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for TaskManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> TaskManager<T> {
    fn lock(&self) -> std::sync::MutexGuard<'_, TaskTable<T>> {
        self.inner.table.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T> fmt::Debug for TaskManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.lock();
        f.debug_struct("TaskManager")
            .field("max_concurrent", &self.inner.max_concurrent)
            .field("active", &table.active)
            .field("queued", &table.queue.len())
            .field("tasks", &table.tasks.len())
            .finish()
    }
}

impl<T: Clone + Send + 'static> TaskManager<T> {
    pub fn new(max_concurrent: usize) -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                table: Mutex::new(TaskTable {
                    tasks: HashMap::new(),
                    queue: VecDeque::new(),
                    active: 0,
                }),
                max_concurrent: max_concurrent.max(1),
                changed,
            }),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    fn notify(&self) {
        self.inner.changed.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Register `work` and return its id without waiting for it.
    ///
    /// Starts immediately when a slot is free, otherwise queues it behind
    /// every earlier submission. Must be called from within a tokio runtime.
    pub fn submit<F>(&self, work: F) -> TaskId
    where
        F: Future<Output = Result<T, String>> + Send + 'static,
    {
        let id = TaskId::new();
        let work: TaskWork<T> = Box::pin(work);
        let to_start = {
            let mut table = self.lock();
            let mut record = TaskRecord::new();
            let to_start = if table.active < self.inner.max_concurrent {
                record.mark_processing();
                table.active += 1;
                Some(work)
            } else {
                table.queue.push_back((id, work));
                None
            };
            table.tasks.insert(id, record);
            tracing::info!(
                task_id = %id,
                active = table.active,
                queued = table.queue.len(),
                "task submitted"
            );
            to_start
        };

        if let Some(work) = to_start {
            self.start(id, work);
        }
        self.notify();
        id
    }

    fn start(&self, id: TaskId, work: TaskWork<T>) {
        let manager = self.clone();
        tokio::spawn(async move {
            // Inner spawn isolates panics from the bookkeeping task.
            let outcome = match tokio::spawn(work).await {
                Ok(outcome) => outcome,
                Err(join_err) => Err(panic_message(join_err)),
            };
            manager.settle(id, outcome);
        });
    }

    /// Mark a processing task as completed with `result`.
    ///
    /// The task's slot stays occupied until its work actually ends.
    pub fn complete(&self, id: TaskId, result: T) -> Result<(), TaskError> {
        self.finish(id, Ok(result))
    }

    /// Mark a processing task as failed.
    ///
    /// The task's slot stays occupied until its work actually ends.
    pub fn fail(&self, id: TaskId, error: impl Into<String>) -> Result<(), TaskError> {
        self.finish(id, Err(error.into()))
    }

    fn finish(&self, id: TaskId, outcome: Result<T, String>) -> Result<(), TaskError> {
        {
            let mut table = self.lock();
            let record = table.tasks.get_mut(&id).ok_or(TaskError::NotFound(id))?;
            if record.status != TaskStatus::Processing {
                let from = record.status;
                tracing::warn!(task_id = %id, from = ?from, "invalid task transition ignored");
                return Err(TaskError::InvalidTransition { id, from });
            }
            record.finish(id, outcome);
        }
        self.notify();
        Ok(())
    }

    /// The work spawned for `id` has ended. Records its outcome unless the
    /// task was already finished by hand, then frees the slot.
    fn settle(&self, id: TaskId, outcome: Result<T, String>) {
        let promoted = {
            let mut table = self.lock();
            match table.tasks.get_mut(&id) {
                Some(record) if record.status == TaskStatus::Processing => {
                    record.finish(id, outcome)
                }
                _ => tracing::debug!(task_id = %id, "work ended after task was already finished"),
            }
            table.active = table.active.saturating_sub(1);
            table.promote(self.inner.max_concurrent)
        };

        for (next, work) in promoted {
            tracing::info!(task_id = %next, "task promoted from queue");
            self.start(next, work);
        }
        self.notify();
    }

    /// 1-based queue rank of a `Requested` task.
    pub fn queue_position(&self, id: TaskId) -> Option<usize> {
        self.lock().position(id)
    }

    pub fn active_count(&self) -> usize {
        self.lock().active
    }

    pub fn get(&self, id: TaskId) -> Option<TaskInfo<T>> {
        let table = self.lock();
        let record = table.tasks.get(&id)?;
        Some(TaskInfo {
            id,
            status: record.status,
            requested_at: record.requested_at,
            started_at: record.started_at,
            finished_at: record.finished_at,
            result: record.result.clone(),
            error: record.error.clone(),
            queue_position: table.position(id),
            active_count: table.active,
        })
    }

    /// Suspend until the task is terminal, or give up after `timeout`.
    pub async fn wait(&self, id: TaskId, timeout: Duration) -> Result<TaskInfo<T>, TaskError> {
        let mut rx = self.inner.changed.subscribe();
        let watch = async {
            loop {
                let Some(info) = self.get(id) else {
                    return Err(TaskError::NotFound(id));
                };
                if info.status.is_terminal() {
                    return Ok(info);
                }
                if rx.changed().await.is_err() {
                    return Err(TaskError::NotFound(id));
                }
            }
        };
        tokio::time::timeout(timeout, watch)
            .await
            .unwrap_or(Err(TaskError::WaitTimeout(id)))
    }

    pub fn stats(&self) -> TaskStats {
        let table = self.lock();
        let mut stats = TaskStats {
            max_concurrent: self.inner.max_concurrent,
            ..Default::default()
        };
        for record in table.tasks.values() {
            match record.status {
                TaskStatus::Requested => stats.requested += 1,
                TaskStatus::Processing => stats.processing += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Remove tasks that have sat in their current state for longer than
    /// `max_age`. Processing tasks are never removed; stuck requested tasks
    /// are dropped together with their queued work. Returns the number removed.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let removed = {
            let mut table = self.lock();
            let expired: Vec<TaskId> = table
                .tasks
                .iter()
                .filter(|(_, r)| r.status != TaskStatus::Processing)
                .filter(|(_, r)| now.saturating_duration_since(r.state_since()) > max_age)
                .map(|(id, _)| *id)
                .collect();
            for id in &expired {
                table.tasks.remove(id);
            }
            table.queue.retain(|(id, _)| !expired.contains(id));
            expired.len()
        };

        if removed > 0 {
            tracing::info!(removed, "cleaned up expired tasks");
            self.notify();
        }
        removed
    }

    /// Run [`cleanup`](Self::cleanup) every `interval` until `cancel` fires.
    pub fn spawn_cleanup(
        &self,
        interval: Duration,
        max_age: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        manager.cleanup(max_age);
                    }
                }
            }
            tracing::debug!("task cleanup loop stopped");
        })
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    if !err.is_panic() {
        return format!("task aborted: {err}");
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("task panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("task panicked: {s}")
    } else {
        "task panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    const WAIT: Duration = Duration::from_secs(5);

    /// Work that finishes with `value` once the returned sender fires.
    fn gated(value: u32) -> (oneshot::Sender<()>, impl Future<Output = Result<u32, String>>) {
        let (tx, rx) = oneshot::channel::<()>();
        let work = async move {
            rx.await.map_err(|e| e.to_string())?;
            Ok(value)
        };
        (tx, work)
    }

    /// Gated work that also tracks how many instances run at once.
    fn tracked(
        value: u32,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    ) -> (oneshot::Sender<()>, impl Future<Output = Result<u32, String>>) {
        let (tx, rx) = oneshot::channel::<()>();
        let work = async move {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            let gate = rx.await;
            running.fetch_sub(1, Ordering::SeqCst);
            gate.map_err(|e| e.to_string())?;
            Ok(value)
        };
        (tx, work)
    }

    async fn eventually(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(WAIT, async {
            while !cond() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_submit_runs_immediately_when_slot_free() {
        let manager: TaskManager<u32> = TaskManager::new(2);
        let id = manager.submit(async { Ok(7) });
        let info = manager.wait(id, WAIT).await.unwrap();
        assert_eq!(info.status, TaskStatus::Completed);
        assert_eq!(info.result, Some(7));
        assert!(info.started_at.is_some());
        assert!(info.finished_at.is_some());
        assert_eq!(info.queue_position, None);
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_fifo_promotion() {
        let manager: TaskManager<u32> = TaskManager::new(2);
        let mut gates = Vec::new();
        let mut ids = Vec::new();
        for n in 1..=5 {
            let (tx, work) = gated(n);
            gates.push(Some(tx));
            ids.push(manager.submit(work));
        }

        assert_eq!(manager.get(ids[0]).unwrap().status, TaskStatus::Processing);
        assert_eq!(manager.get(ids[1]).unwrap().status, TaskStatus::Processing);
        assert_eq!(manager.queue_position(ids[2]), Some(1));
        assert_eq!(manager.queue_position(ids[3]), Some(2));
        assert_eq!(manager.queue_position(ids[4]), Some(3));
        assert_eq!(manager.queue_position(ids[0]), None);
        assert_eq!(manager.active_count(), 2);

        // Each freed slot goes to the oldest queued task.
        for done in 0..3 {
            gates[done].take().unwrap().send(()).unwrap();
            manager.wait(ids[done], WAIT).await.unwrap();
            let next = done + 2;
            assert_eq!(manager.get(ids[next]).unwrap().status, TaskStatus::Processing);
            for later in (next + 1)..5 {
                assert_eq!(manager.get(ids[later]).unwrap().status, TaskStatus::Requested);
            }
        }
        assert_eq!(manager.active_count(), 2);

        for gate in gates.iter_mut().filter_map(Option::take) {
            gate.send(()).unwrap();
        }
        for id in &ids {
            assert_eq!(manager.wait(*id, WAIT).await.unwrap().status, TaskStatus::Completed);
        }
        assert_eq!(manager.stats().completed, 5);
    }

    #[tokio::test]
    async fn test_failure_is_captured_and_frees_slot() {
        let manager: TaskManager<u32> = TaskManager::new(1);
        let failing = manager.submit(async { Err("upstream gone".to_string()) });
        let queued = manager.submit(async { Ok(1) });

        let info = manager.wait(failing, WAIT).await.unwrap();
        assert_eq!(info.status, TaskStatus::Failed);
        assert_eq!(info.error.as_deref(), Some("upstream gone"));
        assert_eq!(info.result, None);

        let info = manager.wait(queued, WAIT).await.unwrap();
        assert_eq!(info.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_panic_is_captured() {
        let manager: TaskManager<u32> = TaskManager::new(1);
        let id = manager.submit(async {
            let explode = true;
            if explode {
                panic!("boom");
            }
            Ok(0)
        });
        let info = manager.wait(id, WAIT).await.unwrap();
        assert_eq!(info.status, TaskStatus::Failed);
        assert!(info.error.unwrap().contains("boom"));
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_transitions() {
        let manager: TaskManager<u32> = TaskManager::new(1);
        let (gate, work) = gated(1);
        let running = manager.submit(work);
        let (_queued_gate, queued_work) = gated(2);
        let queued = manager.submit(queued_work);

        assert_eq!(
            manager.complete(queued, 9),
            Err(TaskError::InvalidTransition {
                id: queued,
                from: TaskStatus::Requested
            })
        );

        gate.send(()).unwrap();
        manager.wait(running, WAIT).await.unwrap();
        assert_eq!(
            manager.fail(running, "late"),
            Err(TaskError::InvalidTransition {
                id: running,
                from: TaskStatus::Completed
            })
        );
        // Rejected transition leaves the record as it was.
        assert_eq!(manager.get(running).unwrap().result, Some(1));

        let unknown = TaskId::new();
        assert_eq!(manager.complete(unknown, 0), Err(TaskError::NotFound(unknown)));
    }

    #[tokio::test]
    async fn test_manual_complete_of_processing_task() {
        let manager: TaskManager<u32> = TaskManager::new(1);
        let (gate, work) = gated(1);
        let id = manager.submit(work);
        manager.complete(id, 42).unwrap();
        let info = manager.get(id).unwrap();
        assert_eq!(info.status, TaskStatus::Completed);
        assert_eq!(info.result, Some(42));
        assert_eq!(manager.active_count(), 1);

        // Work ending later frees the slot but keeps the recorded result.
        drop(gate);
        eventually(|| manager.active_count() == 0).await;
        let info = manager.get(id).unwrap();
        assert_eq!(info.status, TaskStatus::Completed);
        assert_eq!(info.result, Some(42));
        assert_eq!(info.error, None);
    }

    #[tokio::test]
    async fn test_manual_finish_keeps_concurrency_bound() {
        let manager: TaskManager<u32> = TaskManager::new(1);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (gate_a, work_a) = tracked(1, running.clone(), peak.clone());
        let (gate_b, work_b) = tracked(2, running.clone(), peak.clone());
        let a = manager.submit(work_a);
        let b = manager.submit(work_b);
        eventually(|| running.load(Ordering::SeqCst) == 1).await;

        manager.complete(a, 99).unwrap();
        tokio::task::yield_now().await;
        assert_eq!(manager.get(b).unwrap().status, TaskStatus::Requested);
        assert_eq!(manager.queue_position(b), Some(1));
        assert_eq!(manager.active_count(), 1);

        gate_a.send(()).unwrap();
        eventually(|| manager.get(b).unwrap().status == TaskStatus::Processing).await;
        gate_b.send(()).unwrap();
        assert_eq!(manager.wait(b, WAIT).await.unwrap().result, Some(2));
        assert_eq!(manager.get(a).unwrap().result, Some(99));
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let manager: TaskManager<u32> = TaskManager::new(1);
        let (_gate, work) = gated(1);
        let id = manager.submit(work);
        assert_eq!(
            manager.wait(id, Duration::from_secs(1)).await.unwrap_err(),
            TaskError::WaitTimeout(id)
        );
        let unknown = TaskId::new();
        assert_eq!(
            manager.wait(unknown, WAIT).await.unwrap_err(),
            TaskError::NotFound(unknown)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_removes_old_terminal_tasks_only() {
        let manager: TaskManager<u32> = TaskManager::new(2);
        let done = manager.submit(async { Ok(1) });
        manager.wait(done, WAIT).await.unwrap();
        let (_gate, work) = gated(2);
        let running = manager.submit(work);

        tokio::time::advance(Duration::from_secs(30 * 60)).await;
        assert_eq!(manager.cleanup(Duration::from_secs(60 * 60)), 0);

        tokio::time::advance(Duration::from_secs(31 * 60)).await;
        assert_eq!(manager.cleanup(Duration::from_secs(60 * 60)), 1);
        assert!(manager.get(done).is_none());
        assert_eq!(manager.get(running).unwrap().status, TaskStatus::Processing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_drops_stuck_queued_tasks() {
        let manager: TaskManager<u32> = TaskManager::new(1);
        let (_gate, work) = gated(1);
        let running = manager.submit(work);
        let (_g2, stuck_work) = gated(2);
        let stuck = manager.submit(stuck_work);
        assert_eq!(manager.queue_position(stuck), Some(1));

        tokio::time::advance(Duration::from_secs(2 * 60 * 60)).await;
        assert_eq!(manager.cleanup(Duration::from_secs(60 * 60)), 1);
        assert!(manager.get(stuck).is_none());
        assert_eq!(manager.queue_position(stuck), None);
        assert!(manager.get(running).is_some());
        assert_eq!(manager.stats().requested, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_cleanup_runs_periodically() {
        let manager: TaskManager<u32> = TaskManager::new(1);
        let id = manager.submit(async { Ok(1) });
        manager.wait(id, WAIT).await.unwrap();

        let cancel = CancellationToken::new();
        let handle = manager.spawn_cleanup(
            Duration::from_secs(60),
            Duration::from_secs(90),
            cancel.clone(),
        );
        tokio::time::sleep(Duration::from_secs(181)).await;
        assert!(manager.get(id).is_none());

        cancel.cancel();
        handle.await.unwrap();
    }
}
