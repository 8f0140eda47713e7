//! End-to-end scheduler scenarios against in-memory and failing stores.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, DurationRound, Utc};

use chime_core::error::{ChimeError, Result};
use chime_core::traits::Storage;
use chime_scheduler::store::{self, LAST_RUN_KEY, LastRunMarker, TASKS_KEY};
use chime_scheduler::{
    EventKind, MemoryStore, RecurrenceCalculator, RecurrenceRule, Scheduler, SchedulerEvent,
    SchedulerOptions, Task,
};

/// Delegates to a memory store but rejects every write of the task list.
struct TaskWritesFail {
    inner: MemoryStore,
    rejected: AtomicUsize,
}

#[async_trait]
impl Storage for TaskWritesFail {
    fn name(&self) -> &str {
        "task-writes-fail"
    }

    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.load(key).await
    }

    async fn save(&self, key: &str, blob: &[u8]) -> Result<()> {
        if key == TASKS_KEY {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(ChimeError::Storage("read-only volume".into()));
        }
        self.inner.save(key, blob).await
    }
}

/// Delegates to a memory store; every save takes 30 ms.
#[derive(Default)]
struct SlowSaves {
    inner: MemoryStore,
}

#[async_trait]
impl Storage for SlowSaves {
    fn name(&self) -> &str {
        "slow-saves"
    }

    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.load(key).await
    }

    async fn save(&self, key: &str, blob: &[u8]) -> Result<()> {
        tokio::time::sleep(StdDuration::from_millis(30)).await;
        self.inner.save(key, blob).await
    }
}

fn scheduler(storage: Arc<dyn Storage>) -> Scheduler {
    Scheduler::new(
        storage,
        Arc::new(RecurrenceCalculator::new()),
        SchedulerOptions::default(),
    )
}

fn collect(sched: &Scheduler, kind: EventKind) -> Arc<Mutex<Vec<SchedulerEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    sched.on(kind, move |e| sink.lock().unwrap().push(e.clone()));
    seen
}

/// A daily task whose last occurrence was a day ago.
fn daily_task_due_yesterday() -> Task {
    let now = Utc::now().duration_trunc(Duration::minutes(1)).unwrap();
    let due = now - Duration::days(1);
    Task::new("stand-up notes", due, RecurrenceRule::daily(due - Duration::days(7)))
}

#[tokio::test]
async fn recovery_after_two_days_down_reports_and_advances() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStore::new());
    let enabled = daily_task_due_yesterday();
    let mut disabled = daily_task_due_yesterday();
    disabled.enabled = false;
    store::save_tasks(storage.as_ref(), &[enabled.clone(), disabled.clone()])
        .await
        .unwrap();
    let two_days_ago = Utc::now() - Duration::days(2);
    store::save_last_run(storage.as_ref(), &LastRunMarker { timestamp: two_days_ago })
        .await
        .unwrap();

    let sched = scheduler(Arc::clone(&storage));
    let overdue = collect(&sched, EventKind::Overdue);
    let started = Utc::now();
    sched.recover_missed_tasks().await;

    let overdue = overdue.lock().unwrap().clone();
    assert!(overdue.iter().any(|e| e.task_id() == enabled.id));
    assert!(overdue.iter().all(|e| e.task_id() != disabled.id));

    let tasks = store::load_tasks(storage.as_ref()).await.unwrap();
    let after = |id: &str| tasks.iter().find(|t| t.id == id).unwrap().clone();
    assert!(after(&enabled.id).due_at > started);
    assert_eq!(after(&disabled.id).due_at, disabled.due_at);

    let marker = store::load_last_run(storage.as_ref()).await.unwrap().unwrap();
    assert!(marker.timestamp >= started);
}

#[tokio::test]
async fn marker_is_written_even_when_task_persist_fails() {
    let failing = Arc::new(TaskWritesFail {
        inner: MemoryStore::new(),
        rejected: AtomicUsize::new(0),
    });
    let task = daily_task_due_yesterday();
    let blob = serde_json::to_vec(&vec![task.clone()]).unwrap();
    failing.inner.save(TASKS_KEY, &blob).await.unwrap();
    let marker = LastRunMarker {
        timestamp: Utc::now() - Duration::days(2),
    };
    failing
        .inner
        .save(LAST_RUN_KEY, &serde_json::to_vec(&marker).unwrap())
        .await
        .unwrap();

    let sched = scheduler(failing.clone());
    let started = Utc::now();
    let report = sched.recover_missed_tasks().await;

    assert_eq!(report.failed, vec![task.id.clone()]);
    assert!(report.advanced.is_empty());
    assert_eq!(failing.rejected.load(Ordering::SeqCst), 1);

    let written = store::load_last_run(failing.as_ref()).await.unwrap().unwrap();
    assert!(written.timestamp >= started);
    // Not advanced, so the next pass or tick still sees it.
    let tasks = store::load_tasks(failing.as_ref()).await.unwrap();
    assert_eq!(tasks[0].due_at, task.due_at);
}

#[tokio::test]
async fn future_task_is_never_due() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStore::new());
    let due = Utc::now() + Duration::hours(1);
    let task = Task::new("later", due, RecurrenceRule::daily(due));
    store::save_task(storage.as_ref(), &task).await.unwrap();

    let sched = scheduler(storage);
    let seen = collect(&sched, EventKind::Due);
    assert!(sched.check_due_tasks().await.unwrap().is_empty());
    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn due_task_fires_once_across_ticks() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStore::new());
    let due = Utc::now() - Duration::minutes(5);
    let task = Task::new("now", due, RecurrenceRule::daily(due));
    store::save_task(storage.as_ref(), &task).await.unwrap();

    let sched = scheduler(storage);
    let seen = collect(&sched, EventKind::Due);
    sched.check_due_tasks().await.unwrap();
    sched.check_due_tasks().await.unwrap();
    sched.check_due_tasks().await.unwrap();
    assert_eq!(
        *seen.lock().unwrap(),
        vec![SchedulerEvent::Due {
            task_id: task.id.clone(),
            due_at: due
        }]
    );
}

#[tokio::test]
async fn panicking_listener_does_not_stop_recovery() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStore::new());
    let task = daily_task_due_yesterday();
    store::save_task(storage.as_ref(), &task).await.unwrap();
    store::save_last_run(
        storage.as_ref(),
        &LastRunMarker {
            timestamp: Utc::now() - Duration::days(2),
        },
    )
    .await
    .unwrap();

    let sched = scheduler(Arc::clone(&storage));
    sched.on(EventKind::Overdue, |_| panic!("listener bug"));
    let seen = collect(&sched, EventKind::Overdue);
    let report = sched.recover_missed_tasks().await;

    assert!(!seen.lock().unwrap().is_empty());
    assert_eq!(report.advanced, vec![task.id]);
}

#[tokio::test]
async fn completion_during_recovery_is_kept() {
    let slow = Arc::new(SlowSaves::default());
    let a = daily_task_due_yesterday();
    let b = daily_task_due_yesterday();
    store::save_tasks(&slow.inner, &[a.clone(), b.clone()])
        .await
        .unwrap();
    store::save_last_run(
        &slow.inner,
        &LastRunMarker {
            timestamp: Utc::now() - Duration::days(2),
        },
    )
    .await
    .unwrap();

    let sched = Arc::new(scheduler(slow.clone()));
    let recovery = tokio::spawn({
        let sched = Arc::clone(&sched);
        async move { sched.recover_missed_tasks().await }
    });
    tokio::time::sleep(StdDuration::from_millis(5)).await;
    let next = sched.complete_task(&a.id, Utc::now()).await.unwrap();
    let report = recovery.await.unwrap();

    assert!(report.failed.is_empty());
    assert!(report.advanced.contains(&b.id));
    let tasks = store::load_tasks(&slow.inner).await.unwrap();
    let stored_a = tasks.iter().find(|t| t.id == a.id).unwrap();
    assert!(stored_a.last_completed.is_some());
    assert_eq!(Some(stored_a.due_at), next);
    let stored_b = tasks.iter().find(|t| t.id == b.id).unwrap();
    assert!(stored_b.due_at > Utc::now());
}
