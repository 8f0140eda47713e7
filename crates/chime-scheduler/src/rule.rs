//! Recurrence rule model, the structured description of a repeating schedule.
//!
//! A [`RecurrenceRule`] is immutable once built. Every rule can render itself
//! as RFC 5545 text (`DTSTART` + `RRULE` lines); free-text rules can be
//! imported but are never decomposed back into structured fields.

use chrono::{DateTime, NaiveTime, TimeZone, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// Base repetition unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frequency {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Frequency {
    fn as_rrule(&self) -> &'static str {
        match self {
            Frequency::Hourly => "HOURLY",
            Frequency::Daily => "DAILY",
            Frequency::Weekly => "WEEKLY",
            Frequency::Monthly => "MONTHLY",
            Frequency::Yearly => "YEARLY",
        }
    }
}

/// Termination condition of a series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SeriesEnd {
    Never,
    /// Stop after this many occurrences.
    After(u32),
    /// Stop after this instant (inclusive).
    Until(DateTime<Utc>),
}

/// Local clock time every occurrence is pinned to.
///
/// Stored unchecked so a bad value read from storage degrades to the
/// un-pinned occurrence instead of failing the whole rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeOfDay {
    pub hour: u32,
    pub minute: u32,
}

impl TimeOfDay {
    pub fn new(hour: u32, minute: u32) -> Self {
        Self { hour, minute }
    }

    /// `None` when hour/minute are out of range.
    pub fn to_naive(&self) -> Option<NaiveTime> {
        NaiveTime::from_hms_opt(self.hour, self.minute, 0)
    }

    /// Parse "HH:MM".
    pub fn parse(s: &str) -> Option<Self> {
        let (h, m) = s.trim().split_once(':')?;
        Some(Self::new(h.parse().ok()?, m.parse().ok()?))
    }
}

impl std::fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// What repeats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Pattern {
    Every {
        frequency: Frequency,
        interval: u32,
        #[serde(default)]
        by_weekday: Vec<Weekday>,
        #[serde(default)]
        by_month_day: Vec<i8>,
        end: SeriesEnd,
    },
    /// RRULE body imported verbatim (e.g. "FREQ=MONTHLY;BYDAY=-1FR").
    Imported(String),
}

/// A recurrence rule anchored at `interval_start`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurrenceRule {
    pattern: Pattern,
    interval_start: DateTime<Utc>,
    #[serde(default = "default_timezone")]
    timezone: String,
    #[serde(default)]
    fixed_time_of_day: Option<TimeOfDay>,
    #[serde(default)]
    when_done: bool,
}

fn default_timezone() -> String {
    "UTC".into()
}

impl RecurrenceRule {
    /// Rule from a pattern, anchored in UTC.
    pub fn new(pattern: Pattern, interval_start: DateTime<Utc>) -> Self {
        Self {
            pattern,
            interval_start,
            timezone: default_timezone(),
            fixed_time_of_day: None,
            when_done: false,
        }
    }

    /// Every `interval` units of `frequency`, never ending.
    pub fn every(frequency: Frequency, interval: u32, interval_start: DateTime<Utc>) -> Self {
        Self::new(
            Pattern::Every {
                frequency,
                interval: interval.max(1),
                by_weekday: Vec::new(),
                by_month_day: Vec::new(),
                end: SeriesEnd::Never,
            },
            interval_start,
        )
    }

    pub fn daily(interval_start: DateTime<Utc>) -> Self {
        Self::every(Frequency::Daily, 1, interval_start)
    }

    /// Weekly on the given days (empty = the weekday of `interval_start`).
    pub fn weekly(interval_start: DateTime<Utc>, days: &[Weekday]) -> Self {
        Self::new(
            Pattern::Every {
                frequency: Frequency::Weekly,
                interval: 1,
                by_weekday: days.to_vec(),
                by_month_day: Vec::new(),
                end: SeriesEnd::Never,
            },
            interval_start,
        )
    }

    /// Import a free-text rule. Accepts a bare body ("FREQ=DAILY"), an
    /// "RRULE:" line, or a full block whose DTSTART line is ignored in
    /// favour of `interval_start`.
    pub fn imported(rule_text: &str, interval_start: DateTime<Utc>) -> Self {
        Self::new(Pattern::Imported(rrule_body_of(rule_text)), interval_start)
    }

    pub fn with_timezone(mut self, timezone: &str) -> Self {
        self.timezone = timezone.to_string();
        self
    }

    pub fn with_fixed_time(mut self, time: TimeOfDay) -> Self {
        self.fixed_time_of_day = Some(time);
        self
    }

    pub fn with_end(mut self, end: SeriesEnd) -> Self {
        if let Pattern::Every { end: current, .. } = &mut self.pattern {
            *current = end;
        }
        self
    }

    pub fn with_when_done(mut self, when_done: bool) -> Self {
        self.when_done = when_done;
        self
    }

    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    pub fn interval_start(&self) -> DateTime<Utc> {
        self.interval_start
    }

    pub fn timezone(&self) -> &str {
        &self.timezone
    }

    pub fn fixed_time_of_day(&self) -> Option<TimeOfDay> {
        self.fixed_time_of_day
    }

    pub fn when_done(&self) -> bool {
        self.when_done
    }

    /// Resolved IANA timezone; unknown identifiers fall back to UTC.
    pub fn tz(&self) -> chrono_tz::Tz {
        self.timezone.parse().unwrap_or_else(|_| {
            tracing::warn!("⚠️ Unknown timezone '{}', using UTC", self.timezone);
            chrono_tz::UTC
        })
    }

    /// Series anchor in the rule's timezone, with the fixed time applied
    /// when it is valid and exists on that local date.
    pub fn local_start(&self) -> DateTime<chrono_tz::Tz> {
        let tz = self.tz();
        let start = self.interval_start.with_timezone(&tz);
        let Some(time) = self.fixed_time_of_day.and_then(|t| t.to_naive()) else {
            return start;
        };
        tz.from_local_datetime(&start.date_naive().and_time(time))
            .earliest()
            .unwrap_or(start)
    }

    /// The RRULE body, without the "RRULE:" prefix.
    pub fn rrule_body(&self) -> String {
        match &self.pattern {
            Pattern::Imported(body) => body.clone(),
            Pattern::Every {
                frequency,
                interval,
                by_weekday,
                by_month_day,
                end,
            } => {
                let mut parts = vec![
                    format!("FREQ={}", frequency.as_rrule()),
                    format!("INTERVAL={}", (*interval).max(1)),
                ];
                if !by_weekday.is_empty() {
                    let days: Vec<&str> = by_weekday.iter().map(weekday_code).collect();
                    parts.push(format!("BYDAY={}", days.join(",")));
                }
                if !by_month_day.is_empty() {
                    let days: Vec<String> = by_month_day.iter().map(|d| d.to_string()).collect();
                    parts.push(format!("BYMONTHDAY={}", days.join(",")));
                }
                match end {
                    SeriesEnd::Never => {}
                    SeriesEnd::After(count) => parts.push(format!("COUNT={count}")),
                    SeriesEnd::Until(until) => {
                        parts.push(format!("UNTIL={}", until.format("%Y%m%dT%H%M%SZ")))
                    }
                }
                parts.join(";")
            }
        }
    }

    /// Full RFC 5545 text: DTSTART line plus RRULE line.
    pub fn to_rule_string(&self) -> String {
        let start = self.local_start();
        let dtstart = if start.timezone() == chrono_tz::UTC {
            format!("DTSTART:{}", start.format("%Y%m%dT%H%M%SZ"))
        } else {
            format!(
                "DTSTART;TZID={}:{}",
                start.timezone().name(),
                start.format("%Y%m%dT%H%M%S")
            )
        };
        format!("{dtstart}\nRRULE:{}", self.rrule_body())
    }
}

/// Extract the RRULE body from free text.
pub(crate) fn rrule_body_of(rule_text: &str) -> String {
    let text = rule_text.trim();
    text.lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("RRULE:"))
        .unwrap_or(text)
        .trim()
        .to_string()
}

pub(crate) fn weekday_code(day: &Weekday) -> &'static str {
    match day {
        Weekday::Mon => "MO",
        Weekday::Tue => "TU",
        Weekday::Wed => "WE",
        Weekday::Thu => "TH",
        Weekday::Fri => "FR",
        Weekday::Sat => "SA",
        Weekday::Sun => "SU",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap()
    }

    #[test]
    fn test_daily_rule_string() {
        let rule = RecurrenceRule::daily(start());
        assert_eq!(
            rule.to_rule_string(),
            "DTSTART:20260105T090000Z\nRRULE:FREQ=DAILY;INTERVAL=1"
        );
    }

    #[test]
    fn test_weekly_with_end_conditions() {
        let rule = RecurrenceRule::weekly(start(), &[Weekday::Mon, Weekday::Fri])
            .with_end(SeriesEnd::After(4));
        assert_eq!(rule.rrule_body(), "FREQ=WEEKLY;INTERVAL=1;BYDAY=MO,FR;COUNT=4");

        let until = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let rule = RecurrenceRule::every(Frequency::Monthly, 2, start())
            .with_end(SeriesEnd::Until(until));
        assert_eq!(
            rule.rrule_body(),
            "FREQ=MONTHLY;INTERVAL=2;UNTIL=20260301T000000Z"
        );
    }

    #[test]
    fn test_timezone_and_fixed_time_shape_dtstart() {
        let rule = RecurrenceRule::daily(start())
            .with_timezone("Europe/Berlin")
            .with_fixed_time(TimeOfDay::new(7, 30));
        assert_eq!(
            rule.to_rule_string(),
            "DTSTART;TZID=Europe/Berlin:20260105T073000\nRRULE:FREQ=DAILY;INTERVAL=1"
        );
    }

    #[test]
    fn test_malformed_fixed_time_keeps_anchor() {
        let rule = RecurrenceRule::daily(start()).with_fixed_time(TimeOfDay::new(25, 0));
        assert_eq!(rule.local_start().with_timezone(&Utc), start());
    }

    #[test]
    fn test_unknown_timezone_falls_back_to_utc() {
        let rule = RecurrenceRule::daily(start()).with_timezone("Mars/Olympus");
        assert_eq!(rule.tz(), chrono_tz::UTC);
    }

    #[test]
    fn test_imported_strips_prefix_and_dtstart() {
        let rule = RecurrenceRule::imported(
            "DTSTART:20200101T000000Z\nRRULE:FREQ=MONTHLY;BYDAY=-1FR",
            start(),
        );
        assert_eq!(rule.pattern(), &Pattern::Imported("FREQ=MONTHLY;BYDAY=-1FR".into()));
        assert!(rule.to_rule_string().starts_with("DTSTART:20260105T090000Z"));
    }

    #[test]
    fn test_time_of_day_parse() {
        assert_eq!(TimeOfDay::parse("09:05"), Some(TimeOfDay::new(9, 5)));
        assert_eq!(TimeOfDay::parse("nine"), None);
        assert!(TimeOfDay::new(24, 0).to_naive().is_none());
        assert_eq!(TimeOfDay::new(7, 3).to_string(), "07:03");
    }

    #[test]
    fn test_serde_roundtrip_preserves_rule() {
        let rule = RecurrenceRule::weekly(start(), &[Weekday::Wed]).with_when_done(true);
        let json = serde_json::to_string(&rule).unwrap();
        let back: RecurrenceRule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rule);
        assert!(back.when_done());
    }
}
