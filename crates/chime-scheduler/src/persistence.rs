//! Debounced, serialized, retried snapshot writes.
//!
//! [`PersistenceController`] is a handle to a small actor task:
//!
//! ```text
//! Idle ──request_save──▶ Waiting(debounce) ──elapsed──▶ Writing ──ok──▶ Idle
//!                          ▲                              │
//!                          └── request_save ◀── WritingWithPending
//! ```
//!
//! The actor owns a single pending slot, overwritten by every request. At
//! most one write is in flight; a failed write is retried with the same
//! snapshot until it succeeds, a newer snapshot supersedes it, or the
//! retry budget runs out.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use chime_core::config::PersistenceConfig;
use chime_core::error::{ChimeError, Result};
use chime_core::traits::{Storage, Writer};

/// Backoff between attempts on the same snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// 0 retries until the write succeeds or is superseded.
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &PersistenceConfig) -> Self {
        Self {
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            max_attempts: config.max_attempts,
        }
    }

    /// Delay after the `failures`-th consecutive failure (1-based):
    /// doubles each time, capped at `max_backoff`.
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts != 0 && attempts >= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&PersistenceConfig::default())
    }
}

/// Observable controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// A snapshot is pending its debounce.
    Waiting,
    Writing,
    /// Writing, with a newer snapshot already pending.
    WritingWithPending,
}

enum Command<S> {
    Save(S),
    Flush(oneshot::Sender<Result<()>>),
}

/// Handle to the persistence actor. Dropping it writes any pending
/// snapshot immediately and lets the actor exit.
pub struct PersistenceController<S> {
    tx: mpsc::UnboundedSender<Command<S>>,
    phase: watch::Receiver<Phase>,
}

impl<S: Send + Sync + 'static> PersistenceController<S> {
    /// Spawn the actor on the current tokio runtime.
    pub fn new(writer: Arc<dyn Writer<S>>, debounce: Duration, retry: RetryPolicy) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (phase_tx, phase) = watch::channel(Phase::Idle);
        let actor = Actor {
            writer,
            debounce,
            retry,
            pending: None,
            generation: 0,
            latest: Arc::new(AtomicU64::new(0)),
            waiters: Vec::new(),
            last_failure: None,
            phase: phase_tx,
        };
        tokio::spawn(actor.run(rx));
        Self { tx, phase }
    }

    pub fn from_config(writer: Arc<dyn Writer<S>>, config: &PersistenceConfig) -> Self {
        Self::new(
            writer,
            Duration::from_millis(config.debounce_ms),
            RetryPolicy::from_config(config),
        )
    }

    /// Replace the pending snapshot and restart the debounce. Never blocks.
    pub fn request_save(&self, state: S) {
        if self.tx.send(Command::Save(state)).is_err() {
            tracing::warn!("⚠️ Persistence actor is gone, snapshot dropped");
        }
    }

    /// Resolves once the debounce has elapsed and every resulting write has
    /// settled with nothing left pending.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(tx))
            .map_err(|_| ChimeError::Storage("Persistence actor is gone".into()))?;
        rx.await
            .map_err(|_| ChimeError::Storage("Persistence actor exited before flush".into()))?
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }
}

struct Pending<S> {
    state: S,
    generation: u64,
    eligible_at: Instant,
}

enum WriteOutcome {
    Written,
    Superseded,
    GaveUp { attempts: u32, reason: String },
}

struct Actor<S> {
    writer: Arc<dyn Writer<S>>,
    debounce: Duration,
    retry: RetryPolicy,
    pending: Option<Pending<S>>,
    generation: u64,
    /// Generation of the newest requested snapshot, read by retry loops.
    latest: Arc<AtomicU64>,
    waiters: Vec<oneshot::Sender<Result<()>>>,
    last_failure: Option<(u32, String)>,
    phase: watch::Sender<Phase>,
}

impl<S: Send + Sync + 'static> Actor<S> {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command<S>>) {
        let mut in_flight: Option<JoinHandle<WriteOutcome>> = None;
        let mut closed = false;

        loop {
            let eligible = self
                .pending
                .as_ref()
                .is_some_and(|p| closed || p.eligible_at <= Instant::now());
            if in_flight.is_none() && eligible {
                if let Some(pending) = self.pending.take() {
                    in_flight = Some(self.spawn_write(pending));
                }
            }

            self.publish_phase(in_flight.is_some());
            if in_flight.is_none() && self.pending.is_none() {
                self.resolve_waiters();
                if closed {
                    break;
                }
            }

            let deadline = self.pending.as_ref().map(|p| p.eligible_at);
            tokio::select! {
                cmd = rx.recv(), if !closed => match cmd {
                    Some(Command::Save(state)) => self.replace_pending(state),
                    Some(Command::Flush(waiter)) => self.waiters.push(waiter),
                    None => {
                        tracing::debug!("💾 Persistence handle dropped, draining");
                        closed = true;
                    }
                },
                outcome = join_write(&mut in_flight), if in_flight.is_some() => {
                    in_flight = None;
                    self.settle(outcome);
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                    if deadline.is_some() && in_flight.is_none() => {}
                else => break,
            }
        }
    }

    fn replace_pending(&mut self, state: S) {
        self.generation += 1;
        self.latest.store(self.generation, Ordering::SeqCst);
        self.pending = Some(Pending {
            state,
            generation: self.generation,
            eligible_at: Instant::now() + self.debounce,
        });
    }

    fn spawn_write(&self, pending: Pending<S>) -> JoinHandle<WriteOutcome> {
        tokio::spawn(write_with_retry(
            Arc::clone(&self.writer),
            pending.state,
            pending.generation,
            Arc::clone(&self.latest),
            self.retry.clone(),
        ))
    }

    fn settle(&mut self, outcome: WriteOutcome) {
        match outcome {
            WriteOutcome::Written => self.last_failure = None,
            WriteOutcome::Superseded => {}
            WriteOutcome::GaveUp { attempts, reason } => {
                tracing::error!("❌ Snapshot dropped after {} attempts: {}", attempts, reason);
                self.last_failure = Some((attempts, reason));
            }
        }
    }

    fn publish_phase(&self, writing: bool) {
        let phase = match (writing, self.pending.is_some()) {
            (false, false) => Phase::Idle,
            (false, true) => Phase::Waiting,
            (true, false) => Phase::Writing,
            (true, true) => Phase::WritingWithPending,
        };
        self.phase.send_if_modified(|current| {
            let changed = *current != phase;
            *current = phase;
            changed
        });
    }

    fn resolve_waiters(&mut self) {
        for waiter in self.waiters.drain(..) {
            let result = match &self.last_failure {
                Some((attempts, reason)) => Err(ChimeError::WriteGaveUp {
                    attempts: *attempts,
                    reason: reason.clone(),
                }),
                None => Ok(()),
            };
            let _ = waiter.send(result);
        }
    }
}

async fn join_write(handle: &mut Option<JoinHandle<WriteOutcome>>) -> WriteOutcome {
    match handle {
        Some(handle) => handle.await.unwrap_or_else(|e| WriteOutcome::GaveUp {
            attempts: 0,
            reason: format!("write task failed: {e}"),
        }),
        None => std::future::pending().await,
    }
}

async fn write_with_retry<S: Send + Sync>(
    writer: Arc<dyn Writer<S>>,
    state: S,
    generation: u64,
    latest: Arc<AtomicU64>,
    retry: RetryPolicy,
) -> WriteOutcome {
    let mut attempts = 0;
    loop {
        attempts += 1;
        match writer.write(&state).await {
            Ok(()) => {
                tracing::debug!("💾 Snapshot {} written (attempt {})", generation, attempts);
                return WriteOutcome::Written;
            }
            Err(e) if retry.exhausted(attempts) => {
                return WriteOutcome::GaveUp {
                    attempts,
                    reason: e.to_string(),
                };
            }
            Err(e) => {
                let delay = retry.backoff(attempts);
                tracing::warn!(
                    "⚠️ Snapshot {} write failed (attempt {}), retrying in {:?}: {}",
                    generation,
                    attempts,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
                if latest.load(Ordering::SeqCst) != generation {
                    tracing::debug!("💾 Snapshot {} superseded, abandoning retries", generation);
                    return WriteOutcome::Superseded;
                }
            }
        }
    }
}

/// Writes snapshots as JSON under one storage key.
pub struct BlobWriter<St> {
    storage: St,
    key: String,
}

impl<St: Storage> BlobWriter<St> {
    pub fn new(storage: St, key: &str) -> Self {
        Self {
            storage,
            key: key.to_string(),
        }
    }
}

#[async_trait]
impl<S, St> Writer<S> for BlobWriter<St>
where
    S: Serialize + Send + Sync,
    St: Storage,
{
    async fn write(&self, state: &S) -> Result<()> {
        let blob = serde_json::to_vec_pretty(state)?;
        self.storage.save(&self.key, &blob).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    /// Records every write; fails while `fail` says so.
    struct Recording {
        calls: Mutex<Vec<u32>>,
        delay: Duration,
        fail: Box<dyn Fn(u32, usize) -> bool + Send + Sync>,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl Recording {
        fn new() -> Arc<Self> {
            Self::build(Duration::ZERO, |_, _| false)
        }

        fn failing(fail: impl Fn(u32, usize) -> bool + Send + Sync + 'static) -> Arc<Self> {
            Self::build(Duration::ZERO, fail)
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Self::build(delay, |_, _| false)
        }

        fn build(
            delay: Duration,
            fail: impl Fn(u32, usize) -> bool + Send + Sync + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                delay,
                fail: Box::new(fail),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> Vec<u32> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Writer<u32> for Recording {
        async fn write(&self, state: &u32) -> Result<()> {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            let call_index = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(*state);
                calls.len()
            };
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            if (self.fail)(*state, call_index) {
                Err(ChimeError::Storage("disk full".into()))
            } else {
                Ok(())
            }
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            max_attempts,
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            initial_backoff: ms(100),
            max_backoff: ms(1000),
            max_attempts: 0,
        };
        assert_eq!(policy.backoff(1), ms(100));
        assert_eq!(policy.backoff(2), ms(200));
        assert_eq!(policy.backoff(4), ms(800));
        assert_eq!(policy.backoff(5), ms(1000));
        assert_eq!(policy.backoff(64), ms(1000));
        assert!(!policy.exhausted(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_into_one_write_of_last_state() {
        let writer = Recording::new();
        let ctl = PersistenceController::new(writer.clone(), ms(50), fast_retry(0));
        ctl.request_save(1);
        ctl.request_save(2);
        ctl.request_save(3);
        tokio::time::sleep(ms(250)).await;
        assert_eq!(writer.calls(), vec![3]);
        ctl.flush().await.unwrap();
        assert_eq!(writer.calls(), vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_same_state_until_success() {
        let writer = Recording::failing(|_, call| call <= 2);
        let ctl = PersistenceController::new(writer.clone(), ms(10), fast_retry(0));
        ctl.request_save(7);
        ctl.flush().await.unwrap();
        assert_eq!(writer.calls(), vec![7, 7, 7]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_during_write_waits_for_it() {
        let writer = Recording::slow(ms(80));
        let ctl = PersistenceController::new(writer.clone(), ms(10), fast_retry(0));
        ctl.request_save(1);
        tokio::time::sleep(ms(40)).await;
        assert_eq!(ctl.phase(), Phase::Writing);
        ctl.request_save(2);
        tokio::time::sleep(ms(5)).await;
        assert_eq!(ctl.phase(), Phase::WritingWithPending);
        ctl.flush().await.unwrap();
        assert_eq!(writer.calls(), vec![1, 2]);
        assert_eq!(writer.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(ctl.phase(), Phase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_waits_out_debounce() {
        let writer = Recording::new();
        let ctl = PersistenceController::new(writer.clone(), ms(100), fast_retry(0));
        ctl.request_save(1);
        tokio::time::sleep(ms(20)).await;
        assert_eq!(ctl.phase(), Phase::Waiting);
        ctl.flush().await.unwrap();
        assert_eq!(writer.calls(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_give_up_surfaces_through_flush() {
        let writer = Recording::failing(|_, _| true);
        let ctl = PersistenceController::new(writer.clone(), ms(10), fast_retry(2));
        ctl.request_save(1);
        let err = ctl.flush().await.unwrap_err();
        assert!(matches!(err, ChimeError::WriteGaveUp { attempts: 2, .. }));
        assert_eq!(writer.calls(), vec![1, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_state_supersedes_retries() {
        let writer = Recording::failing(|state, _| state == 1);
        let retry = RetryPolicy {
            initial_backoff: ms(150),
            max_backoff: ms(150),
            max_attempts: 0,
        };
        let ctl = PersistenceController::new(writer.clone(), ms(10), retry);
        ctl.request_save(1);
        tokio::time::sleep(ms(50)).await;
        ctl.request_save(2);
        ctl.flush().await.unwrap();
        assert_eq!(writer.calls(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_drains_pending_without_debounce() {
        let writer = Recording::new();
        let ctl = PersistenceController::new(writer.clone(), Duration::from_secs(60), fast_retry(0));
        ctl.request_save(9);
        drop(ctl);
        for _ in 0..50 {
            if !writer.calls().is_empty() {
                break;
            }
            tokio::time::sleep(ms(10)).await;
        }
        assert_eq!(writer.calls(), vec![9]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blob_writer_stores_json() {
        let store = Arc::new(MemoryStore::new());
        let writer = BlobWriter::new(Arc::clone(&store), "numbers");
        Writer::<Vec<u32>>::write(&writer, &vec![1, 2]).await.unwrap();
        let blob = store.load("numbers").await.unwrap().unwrap();
        let back: Vec<u32> = serde_json::from_slice(&blob).unwrap();
        assert_eq!(back, vec![1, 2]);
    }
}
