//! Scheduler Engine: the poll loop that reports due tasks, and the startup
//! recovery of occurrences missed while the process was down.
//! Uses tokio::interval for ticking (sleeps between checks).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use chime_core::config::SchedulerConfig;
use chime_core::error::{ChimeError, Result};
use chime_core::traits::Storage;

use crate::events::{EventBus, EventKind, SchedulerEvent};
use crate::recurrence::RecurrenceCalculator;
use crate::store::{self, LastRunMarker};
use crate::tasks::Task;

/// Poll loop and recovery settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerOptions {
    pub poll_interval: Duration,
    /// Max missed occurrences enumerated per task during recovery.
    pub recovery_cap: usize,
}

impl SchedulerOptions {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            recovery_cap: config.recovery_cap,
        }
    }
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

/// What a recovery pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    /// Marker the pass walked forward from; `None` on cold start.
    pub baseline: Option<DateTime<Utc>>,
    /// Overdue events emitted.
    pub overdue: usize,
    /// Tasks whose `due_at` was moved past now and persisted.
    pub advanced: Vec<String>,
    /// Tasks skipped this pass (invalid rule or persist failure).
    pub failed: Vec<String>,
    /// Tasks whose series has no occurrence after now; left unchanged.
    pub exhausted: Vec<String>,
}

struct Inner {
    storage: Arc<dyn Storage>,
    calculator: Arc<RecurrenceCalculator>,
    events: EventBus,
    options: SchedulerOptions,
    /// Last `due_at` reported per task.
    reported: Mutex<HashMap<String, DateTime<Utc>>>,
    ticking: AtomicBool,
    recovery: tokio::sync::Mutex<()>,
    /// Held across every load-modify-save of the task list.
    repository: tokio::sync::Mutex<()>,
    recovered: AtomicBool,
}

struct PollLoop {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// The scheduler: reports due tasks and recovers missed ones.
pub struct Scheduler {
    inner: Arc<Inner>,
    running: Mutex<Option<PollLoop>>,
}

impl Scheduler {
    pub fn new(
        storage: Arc<dyn Storage>,
        calculator: Arc<RecurrenceCalculator>,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                storage,
                calculator,
                events: EventBus::new(),
                options,
                reported: Mutex::new(HashMap::new()),
                ticking: AtomicBool::new(false),
                recovery: tokio::sync::Mutex::new(()),
                repository: tokio::sync::Mutex::new(()),
                recovered: AtomicBool::new(false),
            }),
            running: Mutex::new(None),
        }
    }

    /// Register an event listener.
    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&SchedulerEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, handler);
    }

    pub fn calculator(&self) -> &Arc<RecurrenceCalculator> {
        &self.inner.calculator
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.inner.storage
    }

    pub fn is_running(&self) -> bool {
        self.lock_running().is_some()
    }

    /// Start the poll loop. Recovery runs first if it has not run yet.
    /// Returns `false` if already running.
    pub fn start(&self) -> bool {
        let mut running = self.lock_running();
        if running.is_some() {
            return false;
        }
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(poll_loop(Arc::clone(&self.inner), rx));
        *running = Some(PollLoop { shutdown, handle });
        tracing::info!(
            "⏰ Scheduler started (check every {:?})",
            self.inner.options.poll_interval
        );
        true
    }

    /// Stop the poll loop and wait for it to exit. A pass already in
    /// progress finishes first. Returns `false` if not running.
    pub async fn stop(&self) -> bool {
        let poll = self.lock_running().take();
        let Some(poll) = poll else {
            return false;
        };
        let _ = poll.shutdown.send(true);
        if let Err(e) = poll.handle.await {
            tracing::warn!("⚠️ Scheduler loop ended abnormally: {e}");
        }
        tracing::info!("⏹️ Scheduler stopped");
        true
    }

    pub async fn check_due_tasks(&self) -> Result<Vec<SchedulerEvent>> {
        self.inner.check_due_tasks_at(Utc::now()).await
    }

    /// Emit `Due` for every enabled task with `due_at <= now`, once per
    /// `(task, due_at)`. Skipped (empty result) while another check runs.
    pub async fn check_due_tasks_at(&self, now: DateTime<Utc>) -> Result<Vec<SchedulerEvent>> {
        self.inner.check_due_tasks_at(now).await
    }

    pub async fn recover_missed_tasks(&self) -> RecoveryReport {
        self.inner.recover_missed_tasks_at(Utc::now()).await
    }

    /// Report occurrences missed since the last recorded pass as `Overdue`,
    /// move each affected task past `now`, then record `now` as the new
    /// baseline. Per-task failures are logged and skipped.
    pub async fn recover_missed_tasks_at(&self, now: DateTime<Utc>) -> RecoveryReport {
        self.inner.recover_missed_tasks_at(now).await
    }

    /// Mark a task's current occurrence done and persist the advanced task.
    /// Returns the new `due_at`, or `None` if the series ended.
    pub async fn complete_task(
        &self,
        task_id: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let calculator = &self.inner.calculator;
        self.inner
            .update_task(task_id, |task| task.complete(calculator, completed_at))
            .await?
            .ok_or_else(|| ChimeError::Storage(format!("No task with id {task_id}")))
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, Option<PollLoop>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(poll) = self.lock_running().take() {
            let _ = poll.shutdown.send(true);
        }
    }
}

async fn poll_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    if !inner.recovered.load(Ordering::SeqCst) {
        inner.recover_missed_tasks_at(Utc::now()).await;
    }

    let mut interval = tokio::time::interval(inner.options.poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
        if let Err(e) = inner.check_due_tasks_at(Utc::now()).await {
            tracing::warn!("⚠️ Due check failed: {e}");
        }
    }
}

impl Inner {
    /// Load the task list, apply `change` to one task and save the list, all
    /// under the repository lock. `Ok(None)` if the task is gone.
    async fn update_task<T>(
        &self,
        task_id: &str,
        change: impl FnOnce(&mut Task) -> Result<T>,
    ) -> Result<Option<T>> {
        let _repo = self.repository.lock().await;
        let storage = self.storage.as_ref();
        let mut tasks = store::load_tasks(storage).await?;
        let Some(task) = tasks.iter_mut().find(|t| t.id == task_id) else {
            return Ok(None);
        };
        let out = change(task)?;
        store::save_tasks(storage, &tasks).await?;
        Ok(Some(out))
    }

    async fn check_due_tasks_at(&self, now: DateTime<Utc>) -> Result<Vec<SchedulerEvent>> {
        if self.ticking.swap(true, Ordering::SeqCst) {
            tracing::debug!("⏭️ Previous due check still running, skipping tick");
            return Ok(Vec::new());
        }
        let result = self.collect_due(now).await;
        self.ticking.store(false, Ordering::SeqCst);

        let events = result?;
        for event in &events {
            tracing::info!("🔔 Task due: {}", event.task_id());
            self.events.emit(event);
        }
        Ok(events)
    }

    async fn collect_due(&self, now: DateTime<Utc>) -> Result<Vec<SchedulerEvent>> {
        let tasks = store::load_tasks(self.storage.as_ref()).await?;
        let mut reported = self.reported.lock().unwrap_or_else(PoisonError::into_inner);

        // Forget markers whose task moved on, was disabled, or is gone.
        reported.retain(|id, due_at| {
            tasks
                .iter()
                .any(|t| t.id == *id && t.enabled && t.due_at == *due_at)
        });

        let mut events = Vec::new();
        for task in tasks.iter().filter(|t| t.is_due(now)) {
            if reported.get(&task.id) == Some(&task.due_at) {
                continue;
            }
            reported.insert(task.id.clone(), task.due_at);
            events.push(SchedulerEvent::Due {
                task_id: task.id.clone(),
                due_at: task.due_at,
            });
        }
        Ok(events)
    }

    async fn recover_missed_tasks_at(&self, now: DateTime<Utc>) -> RecoveryReport {
        let _pass = self.recovery.lock().await;
        let mut report = RecoveryReport::default();
        let storage = self.storage.as_ref();

        match store::load_last_run(storage).await {
            Ok(Some(marker)) => {
                report.baseline = Some(marker.timestamp);
                self.walk_tasks(marker.timestamp, now, &mut report).await;
            }
            Ok(None) => tracing::info!("🆕 No last-run marker, cold start: nothing to recover"),
            Err(e) => tracing::warn!("⚠️ Could not read last-run marker, skipping recovery: {e}"),
        }

        if let Err(e) = store::save_last_run(storage, &LastRunMarker { timestamp: now }).await {
            tracing::warn!("⚠️ Could not write last-run marker: {e}");
        }
        self.recovered.store(true, Ordering::SeqCst);

        tracing::info!(
            "🔁 Recovery done: {} overdue, {} advanced, {} failed, {} exhausted",
            report.overdue,
            report.advanced.len(),
            report.failed.len(),
            report.exhausted.len()
        );
        report
    }

    async fn walk_tasks(&self, since: DateTime<Utc>, now: DateTime<Utc>, report: &mut RecoveryReport) {
        let storage = self.storage.as_ref();
        let tasks = match store::load_tasks(storage).await {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::warn!("⚠️ Could not load tasks for recovery: {e}");
                return;
            }
        };
        let cap = self.options.recovery_cap;

        for task in tasks.into_iter().filter(|t| t.is_due(now)) {
            // The stored due_at is itself an occurrence not yet reported.
            let mut missed = Vec::new();
            if task.due_at > since && cap > 0 {
                missed.push(task.due_at);
            }
            let after = task.due_at.max(since);
            match self.calculator.missed_occurrences(
                &task.id,
                &task.frequency,
                after,
                now,
                cap.saturating_sub(missed.len()),
            ) {
                Ok(window) => {
                    if window.truncated {
                        tracing::warn!(
                            "⚠️ Task '{}': more than {} missed occurrences, reporting the first {}",
                            task.title,
                            cap,
                            cap
                        );
                    }
                    missed.extend(window.occurrences);
                }
                Err(e) => {
                    tracing::warn!("⚠️ Task '{}' skipped: {e}", task.title);
                    report.failed.push(task.id);
                    continue;
                }
            }

            for missed_at in missed {
                self.events.emit(&SchedulerEvent::Overdue {
                    task_id: task.id.clone(),
                    missed_at,
                });
                report.overdue += 1;
            }

            match self.calculator.compute_next(&task.id, &task.frequency, now) {
                Ok(Some(next)) => {
                    // Only move the due date this pass saw; a completion that
                    // landed meanwhile already advanced the task.
                    let seen = task.due_at;
                    let advanced = self
                        .update_task(&task.id, |stored| {
                            let unchanged = stored.enabled && stored.due_at == seen;
                            if unchanged {
                                stored.due_at = next;
                            }
                            Ok(unchanged)
                        })
                        .await;
                    match advanced {
                        Ok(Some(true)) => {
                            tracing::debug!("⏩ Task '{}' advanced to {}", task.title, next);
                            report.advanced.push(task.id);
                        }
                        Ok(_) => {
                            tracing::debug!("⏩ Task '{}' changed during recovery, left as is", task.title);
                        }
                        Err(e) => {
                            tracing::warn!("⚠️ Could not persist task '{}': {e}", task.title);
                            report.failed.push(task.id);
                        }
                    }
                }
                Ok(None) => {
                    tracing::info!("🏁 Task '{}' has no occurrence after now", task.title);
                    report.exhausted.push(task.id);
                }
                Err(e) => {
                    tracing::warn!("⚠️ Task '{}' skipped: {e}", task.title);
                    report.failed.push(task.id);
                }
            }
        }
    }
}
