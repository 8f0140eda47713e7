//! Scheduler events and the listener registry they are delivered through.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Emitted by the scheduler; never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    /// The task reached its due time while the scheduler was running.
    Due {
        task_id: String,
        due_at: DateTime<Utc>,
    },
    /// An occurrence passed while the scheduler was not running.
    Overdue {
        task_id: String,
        missed_at: DateTime<Utc>,
    },
}

impl SchedulerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SchedulerEvent::Due { .. } => EventKind::Due,
            SchedulerEvent::Overdue { .. } => EventKind::Overdue,
        }
    }

    pub fn task_id(&self) -> &str {
        match self {
            SchedulerEvent::Due { task_id, .. } | SchedulerEvent::Overdue { task_id, .. } => {
                task_id
            }
        }
    }
}

/// Event type a listener subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Due,
    Overdue,
}

type Handler = Arc<dyn Fn(&SchedulerEvent) + Send + Sync>;

/// Synchronous fan-out to registered listeners.
///
/// Listeners run in registration order on the emitting task. A panicking
/// listener is logged and the remaining listeners still run.
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<Vec<(EventKind, Handler)>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for one event kind.
    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&SchedulerEvent) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((kind, Arc::new(handler)));
    }

    #[cfg(test)]
    fn listener_count(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn emit(&self, event: &SchedulerEvent) {
        let kind = event.kind();
        // Snapshot so listeners may register further listeners.
        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, h)| Arc::clone(h))
            .collect();

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                tracing::warn!(
                    "⚠️ Event listener panicked on {:?} for task {}",
                    kind,
                    event.task_id()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn due(id: &str) -> SchedulerEvent {
        SchedulerEvent::Due {
            task_id: id.into(),
            due_at: Utc::now(),
        }
    }

    #[test]
    fn test_emit_routes_by_kind_in_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let seen = Arc::clone(&seen);
            bus.on(EventKind::Due, move |e| {
                seen.lock().unwrap().push(format!("{tag}:{}", e.task_id()))
            });
        }
        let overdue_seen = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&overdue_seen);
        bus.on(EventKind::Overdue, move |_| *counter.lock().unwrap() += 1);

        bus.emit(&due("a"));
        assert_eq!(*seen.lock().unwrap(), vec!["first:a", "second:a"]);
        assert_eq!(*overdue_seen.lock().unwrap(), 0);
        assert_eq!(bus.listener_count(), 3);
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(0));
        bus.on(EventKind::Due, |_| panic!("listener bug"));
        let counter = Arc::clone(&hits);
        bus.on(EventKind::Due, move |_| *counter.lock().unwrap() += 1);

        bus.emit(&due("a"));
        bus.emit(&due("b"));
        assert_eq!(*hits.lock().unwrap(), 2);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_value(due("a")).unwrap();
        assert_eq!(json["type"], "due");
        assert_eq!(json["task_id"], "a");
    }
}
