//! Integration tests for [`TaskManager`] scheduling and cleanup.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tidewater_core::{Config, TaskManager, TaskStatus};
use tokio::sync::oneshot;

const WAIT: Duration = Duration::from_secs(10);

/// Work that records when it starts, then finishes once released.
fn tracked(
    n: u32,
    started: Arc<Mutex<Vec<u32>>>,
) -> (
    oneshot::Sender<()>,
    impl std::future::Future<Output = Result<u32, String>> + Send + 'static,
) {
    let (tx, rx) = oneshot::channel::<()>();
    let work = async move {
        started.lock().unwrap().push(n);
        rx.await.map_err(|e| e.to_string())?;
        Ok(n)
    };
    (tx, work)
}

#[tokio::test]
async fn queued_tasks_start_in_submission_order() {
    let config = Config {
        max_concurrent_tasks: 2,
        ..Config::default()
    };
    let manager: TaskManager<u32> = TaskManager::new(config.max_concurrent_tasks);
    let started = Arc::new(Mutex::new(Vec::new()));

    let mut gates = Vec::new();
    let mut ids = Vec::new();
    for n in 1..=5 {
        let (gate, work) = tracked(n, started.clone());
        gates.push(gate);
        ids.push(manager.submit(work));
    }

    assert_eq!(manager.queue_position(ids[4]), Some(3));
    assert_eq!(manager.queue_position(ids[2]), Some(1));
    assert_eq!(manager.queue_position(ids[3]), Some(2));
    let info = manager.get(ids[4]).unwrap();
    assert_eq!(info.status, TaskStatus::Requested);
    assert_eq!(info.active_count, 2);

    // Release in submission order; each completion admits exactly one more.
    for (i, gate) in gates.into_iter().enumerate() {
        gate.send(()).unwrap();
        manager.wait(ids[i], WAIT).await.unwrap();
        assert!(manager.active_count() <= 2);
    }

    assert_eq!(*started.lock().unwrap(), vec![1, 2, 3, 4, 5]);
    let stats = manager.stats();
    assert_eq!(stats.completed, 5);
    assert_eq!(stats.processing, 0);
    assert_eq!(stats.requested, 0);
}

#[tokio::test]
async fn submit_does_not_block_caller() {
    let manager: TaskManager<u32> = TaskManager::new(1);
    let (_gate, work) = tracked(1, Arc::new(Mutex::new(Vec::new())));
    manager.submit(work);

    // A full manager still accepts work immediately.
    let queued = tokio::time::timeout(Duration::from_millis(50), async {
        manager.submit(async { Ok(2) })
    })
    .await
    .expect("submit returned immediately");
    assert_eq!(manager.queue_position(queued), Some(1));
}

#[tokio::test(start_paused = true)]
async fn cleanup_removes_only_aged_terminal_tasks() {
    let config = Config {
        task_max_age_minutes: 60,
        ..Config::default()
    };
    let manager: TaskManager<u32> = TaskManager::new(config.max_concurrent_tasks);

    let completed = manager.submit(async { Ok(1) });
    let failed = manager.submit(async { Err("bad input".to_string()) });
    manager.wait(completed, WAIT).await.unwrap();
    manager.wait(failed, WAIT).await.unwrap();

    let (_gate, long_running) = tracked(3, Arc::new(Mutex::new(Vec::new())));
    let processing = manager.submit(long_running);

    tokio::time::advance(Duration::from_secs(3 * 60 * 60)).await;
    let removed = manager.cleanup(config.task_max_age());

    assert_eq!(removed, 2);
    assert!(manager.get(completed).is_none());
    assert!(manager.get(failed).is_none());
    assert_eq!(
        manager.get(processing).unwrap().status,
        TaskStatus::Processing
    );
}

#[tokio::test]
async fn failing_work_never_disturbs_other_tasks() {
    let manager: TaskManager<String> = TaskManager::new(2);
    let ids: Vec<_> = (0..6)
        .map(|i| {
            manager.submit(async move {
                if i % 2 == 0 {
                    Err(format!("task {i} failed"))
                } else {
                    Ok(format!("task {i} ok"))
                }
            })
        })
        .collect();

    for (i, id) in ids.iter().enumerate() {
        let info = manager.wait(*id, WAIT).await.unwrap();
        if i % 2 == 0 {
            assert_eq!(info.status, TaskStatus::Failed);
            assert_eq!(info.error, Some(format!("task {i} failed")));
        } else {
            assert_eq!(info.status, TaskStatus::Completed);
            assert_eq!(info.result, Some(format!("task {i} ok")));
        }
    }
    assert_eq!(manager.active_count(), 0);
}
