//! # Chime Scheduler
//!
//! Recurring-reminder core: recurrence calculation, due-task polling with
//! downtime recovery, and debounced durable writes.
//!
//! ## Design Principles
//! - No singletons: every component takes its collaborators at construction
//! - Tokio timers only, zero overhead when idle
//! - At-least-once overdue reporting across crashes
//! - One write in flight, always carrying the newest snapshot
//!
//! ## Architecture
//! ```text
//! Scheduler (tokio interval)
//!   ├── start → recover_missed_tasks (once)
//!   │     ├── LastRunMarker → walk each enabled task forward
//!   │     ├── Overdue events, oldest first
//!   │     └── advance due_at past now → Storage
//!   └── every poll → check_due_tasks → Due events (once per due_at)
//!
//! RecurrenceCalculator (rrule + chrono-tz)
//!   └── compute_next / occurrences_between / validate / describe
//!
//! PersistenceController (actor)
//!   └── request_save → debounce → Writer::write (retry, backoff)
//! ```

mod describe;
pub mod engine;
pub mod events;
pub mod persistence;
pub mod recurrence;
pub mod rule;
pub mod sqlite;
pub mod store;
pub mod tasks;

pub use engine::{RecoveryReport, Scheduler, SchedulerOptions};
pub use events::{EventBus, EventKind, SchedulerEvent};
pub use persistence::{BlobWriter, Phase, PersistenceController, RetryPolicy};
pub use recurrence::{RecurrenceCalculator, Validation, Window};
pub use rule::{Frequency, Pattern, RecurrenceRule, SeriesEnd, TimeOfDay};
pub use sqlite::SqliteStore;
pub use store::{FileStore, LastRunMarker, MemoryStore};
pub use tasks::Task;
