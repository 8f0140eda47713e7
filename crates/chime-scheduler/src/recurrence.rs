//! Recurrence calculator: turns a [`RecurrenceRule`] into concrete occurrences.
//!
//! Rule evaluation is delegated to the `rrule` crate. On top of it this module
//! adds fixed time-of-day pinning, a compiled-rule cache, validation with
//! distinct failure messages, and best-effort English descriptions.
//!
//! The calculator never decides which base date a task advances from; callers
//! pass the completion time for `when_done` tasks and the current due date
//! otherwise (see [`crate::tasks::Task::complete`]).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use rrule::{RRule, RRuleSet, Unvalidated};
use serde::Serialize;

use chime_core::error::{ChimeError, Result};

use crate::describe::RuleFields;
use crate::rule::{rrule_body_of, RecurrenceRule, TimeOfDay};

/// Outcome of [`RecurrenceCalculator::validate`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Validation {
    pub valid: bool,
    pub error: Option<String>,
}

impl Validation {
    fn ok() -> Self {
        Self { valid: true, error: None }
    }

    fn invalid(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(error.into()),
        }
    }
}

/// Occurrences collected from a bounded window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Window {
    /// Strictly ascending, duplicate-free.
    pub occurrences: Vec<DateTime<Utc>>,
    /// The cap was hit before the window was exhausted.
    pub truncated: bool,
}

type CacheKey = (String, String);

/// Computes occurrences for recurrence rules.
///
/// Compiled rules are cached per `(task_id, rule string)`. The cache sits
/// behind a mutex, so one calculator can be shared across threads via `Arc`.
/// It is unbounded for the lifetime of the instance; call
/// [`clear_cache`](Self::clear_cache) to release it.
pub struct RecurrenceCalculator {
    cache: Mutex<HashMap<CacheKey, Arc<RRuleSet>>>,
}

impl RecurrenceCalculator {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// First occurrence strictly after `from`, or `None` once the series has
    /// ended. Fails only when the rule text cannot be parsed.
    pub fn compute_next(
        &self,
        task_id: &str,
        rule: &RecurrenceRule,
        from: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let set = self.compiled(task_id, rule)?;
        let fixed = rule.fixed_time_of_day();
        for occurrence in set.as_ref() {
            // Pinning moves an occurrence within its local day only, and a
            // local day can be 25 hours long.
            if occurrence.with_timezone(&Utc) + Duration::days(2) <= from {
                continue;
            }
            let candidate = pin_time(task_id, &occurrence, fixed);
            if candidate > from {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    /// All occurrences in `[start, end]`, ascending and duplicate-free.
    pub fn compute_occurrences_between(
        &self,
        task_id: &str,
        rule: &RecurrenceRule,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        Ok(self
            .collect(task_id, rule, start, true, end, usize::MAX)?
            .occurrences)
    }

    /// Occurrences in `(after, until]`, at most `cap` of them.
    pub fn missed_occurrences(
        &self,
        task_id: &str,
        rule: &RecurrenceRule,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
        cap: usize,
    ) -> Result<Window> {
        self.collect(task_id, rule, after, false, until, cap)
    }

    /// Whether any occurrence falls on the local calendar day containing `date`.
    pub fn is_occurrence_on(
        &self,
        task_id: &str,
        rule: &RecurrenceRule,
        date: DateTime<Utc>,
    ) -> Result<bool> {
        let tz = rule.tz();
        let day = date.with_timezone(&tz).date_naive();
        let start = tz
            .from_local_datetime(&day.and_time(NaiveTime::MIN))
            .earliest()
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|| day.and_time(NaiveTime::MIN).and_utc());
        let end = day
            .succ_opt()
            .and_then(|next| tz.from_local_datetime(&next.and_time(NaiveTime::MIN)).earliest())
            .map(|d| d.with_timezone(&Utc) - Duration::nanoseconds(1))
            .unwrap_or(start + Duration::days(1) - Duration::nanoseconds(1));
        Ok(!self
            .compute_occurrences_between(task_id, rule, start, end)?
            .is_empty())
    }

    /// Check free rule text. Without a DTSTART line the rule is anchored at
    /// the start of today (UTC) purely for checking.
    pub fn validate(&self, rule_text: &str) -> Validation {
        let text = rule_text.trim();
        if text.is_empty() {
            return Validation::invalid("Rule is empty");
        }

        let body = rrule_body_of(text);
        let parsed: RRule<Unvalidated> = match body.parse() {
            Ok(parsed) => parsed,
            Err(e) => return Validation::invalid(format!("Malformed rule: {e}")),
        };

        let fields = RuleFields::parse(&body);
        if fields.as_ref().is_some_and(|f| f.interval == 0) {
            return Validation::invalid("Malformed rule: INTERVAL must be at least 1");
        }
        if let Some(until) = fields.as_ref().and_then(|f| f.until) {
            if until < Utc::now() {
                return Validation::invalid(format!(
                    "Rule has expired: UNTIL {} is in the past",
                    until.format("%Y-%m-%d %H:%M UTC")
                ));
            }
        }

        let set = match build_free_text(text, parsed) {
            Ok(set) => set,
            Err(e) => return Validation::invalid(format!("Malformed rule: {e}")),
        };
        if set.clone().all(1).dates.is_empty() {
            return Validation::invalid("Rule produces no occurrences");
        }
        if fields.as_ref().is_some_and(|f| f.count.is_some()) {
            if let Some(last) = (&set).into_iter().last() {
                let last = last.with_timezone(&Utc);
                if last < Utc::now() {
                    return Validation::invalid(format!(
                        "Rule has expired: last occurrence {} is in the past",
                        last.format("%Y-%m-%d %H:%M UTC")
                    ));
                }
            }
        }
        Validation::ok()
    }

    /// English rendering of a rule, or the input unchanged if it cannot be read.
    pub fn describe(&self, rule_text: &str) -> String {
        let text = rule_text.trim();
        let body = rrule_body_of(text);
        if body.is_empty() || body.parse::<RRule<Unvalidated>>().is_err() {
            return rule_text.to_string();
        }
        RuleFields::parse(&body)
            .and_then(|fields| fields.describe())
            .unwrap_or_else(|| rule_text.to_string())
    }

    pub fn clear_cache(&self) {
        self.lock_cache().clear();
    }

    pub fn cache_size(&self) -> usize {
        self.lock_cache().len()
    }

    fn collect(
        &self,
        task_id: &str,
        rule: &RecurrenceRule,
        lower: DateTime<Utc>,
        lower_inclusive: bool,
        upper: DateTime<Utc>,
        cap: usize,
    ) -> Result<Window> {
        let mut window = Window::default();
        if lower > upper || cap == 0 {
            return Ok(window);
        }
        let set = self.compiled(task_id, rule)?;
        let fixed = rule.fixed_time_of_day();
        for occurrence in set.as_ref() {
            let raw = occurrence.with_timezone(&Utc);
            if raw > upper + Duration::days(2) {
                break;
            }
            if raw + Duration::days(2) < lower {
                continue;
            }
            let pinned = pin_time(task_id, &occurrence, fixed);
            let above = if lower_inclusive { pinned >= lower } else { pinned > lower };
            if !above || pinned > upper || window.occurrences.last() == Some(&pinned) {
                continue;
            }
            if window.occurrences.len() == cap {
                window.truncated = true;
                break;
            }
            window.occurrences.push(pinned);
        }
        window.occurrences.sort_unstable();
        window.occurrences.dedup();
        Ok(window)
    }

    fn compiled(&self, task_id: &str, rule: &RecurrenceRule) -> Result<Arc<RRuleSet>> {
        let key = (task_id.to_string(), rule.to_rule_string());
        if let Some(set) = self.lock_cache().get(&key) {
            return Ok(Arc::clone(set));
        }
        let set = Arc::new(compile(rule)?);
        tracing::debug!("🧮 Compiled rule for task {}: {}", task_id, key.1.replace('\n', " "));
        self.lock_cache().insert(key, Arc::clone(&set));
        Ok(set)
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<CacheKey, Arc<RRuleSet>>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for RecurrenceCalculator {
    fn default() -> Self {
        Self::new()
    }
}

fn compile(rule: &RecurrenceRule) -> Result<RRuleSet> {
    let body = rule.rrule_body();
    let parsed: RRule<Unvalidated> = body
        .parse()
        .map_err(|e| ChimeError::invalid_rule(&body, e))?;
    let start = rule.local_start();
    let anchor = start.with_timezone(&rrule::Tz::Tz(start.timezone()));
    parsed
        .build(anchor)
        .map_err(|e| ChimeError::invalid_rule(&body, e))
}

/// Build free text, anchored by its own DTSTART line when it has one.
fn build_free_text(
    text: &str,
    parsed: RRule<Unvalidated>,
) -> std::result::Result<RRuleSet, rrule::RRuleError> {
    if text.contains("DTSTART") {
        return text.parse::<RRuleSet>();
    }
    let today = Utc::now().date_naive().and_time(NaiveTime::MIN).and_utc();
    parsed.build(today.with_timezone(&rrule::Tz::UTC))
}

/// Replace hour/minute of `occurrence` (in its own timezone) with the fixed
/// time, zeroing seconds. Malformed or non-existent local times leave the
/// occurrence as is.
fn pin_time(
    task_id: &str,
    occurrence: &DateTime<rrule::Tz>,
    fixed: Option<TimeOfDay>,
) -> DateTime<Utc> {
    let Some(fixed) = fixed else {
        return occurrence.with_timezone(&Utc);
    };
    let Some(time) = fixed.to_naive() else {
        tracing::warn!(
            "⚠️ Task {}: malformed fixed time {}:{}, using unpinned occurrence",
            task_id,
            fixed.hour,
            fixed.minute
        );
        return occurrence.with_timezone(&Utc);
    };
    let local = occurrence.date_naive().and_time(time);
    match occurrence.timezone().from_local_datetime(&local).earliest() {
        Some(pinned) => pinned.with_timezone(&Utc),
        None => {
            tracing::warn!(
                "⚠️ Task {}: {} does not exist locally on {}, using unpinned occurrence",
                task_id,
                fixed,
                occurrence.date_naive()
            );
            occurrence.with_timezone(&Utc)
        }
    }
}
