//! Task definitions, the data model the scheduler reads and advances.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use chime_core::error::Result;

use crate::recurrence::RecurrenceCalculator;
use crate::rule::RecurrenceRule;

/// A recurring reminder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task ID.
    pub id: String,
    /// Human-readable title.
    pub title: String,
    /// Next scheduled occurrence.
    pub due_at: DateTime<Utc>,
    /// Disabled tasks are invisible to the scheduler.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub frequency: RecurrenceRule,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_completed: Option<DateTime<Utc>>,
}

fn default_enabled() -> bool {
    true
}

impl Task {
    /// Create an enabled task due at `due_at`.
    pub fn new(title: &str, due_at: DateTime<Utc>, frequency: RecurrenceRule) -> Self {
        Self {
            id: format!("task-{}", uuid::Uuid::new_v4()),
            title: title.to_string(),
            due_at,
            enabled: true,
            frequency,
            created_at: Utc::now(),
            last_completed: None,
        }
    }

    /// Create a task due at the first occurrence of `rule` (its start
    /// included). Returns `None` when the rule yields no occurrences.
    pub fn from_rule(
        calc: &RecurrenceCalculator,
        title: &str,
        rule: RecurrenceRule,
    ) -> Result<Option<Self>> {
        let mut task = Self::new(title, rule.interval_start(), rule);
        let anchor = task.frequency.interval_start() - Duration::seconds(1);
        match calc.compute_next(&task.id, &task.frequency, anchor)? {
            Some(first) => {
                task.due_at = first;
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    /// Next occurrence is computed from the completion time, not `due_at`.
    pub fn when_done(&self) -> bool {
        self.frequency.when_done()
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.due_at <= now
    }

    /// Mark the current occurrence done and advance `due_at`.
    ///
    /// `when_done` tasks advance from `completed_at`; all others advance
    /// from their current `due_at`, skipping occurrences already behind
    /// `completed_at`. When the series is exhausted the task is disabled and
    /// `None` is returned.
    pub fn complete(
        &mut self,
        calc: &RecurrenceCalculator,
        completed_at: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let base = if self.when_done() {
            completed_at
        } else {
            self.due_at.max(completed_at)
        };
        self.last_completed = Some(completed_at);
        match calc.compute_next(&self.id, &self.frequency, base)? {
            Some(next) => {
                tracing::debug!("✅ Task '{}' completed, next due {}", self.title, next);
                self.due_at = next;
                Ok(Some(next))
            }
            None => {
                tracing::info!("🏁 Task '{}' completed its series", self.title);
                self.enabled = false;
                Ok(None)
            }
        }
    }
}
