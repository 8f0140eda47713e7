//! Human-readable rendering of RRULE bodies.
//!
//! Syntax is checked by the rule library before anything here runs; this
//! module only reads the handful of fields worth putting into a sentence.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

/// The subset of RRULE fields used for descriptions and expiry checks.
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct RuleFields {
    pub freq: Option<String>,
    pub interval: u32,
    pub count: Option<u32>,
    pub until: Option<DateTime<Utc>>,
    pub by_day: Vec<String>,
    pub by_month_day: Vec<i32>,
    pub by_month: Vec<u32>,
    pub by_hour: Vec<u32>,
    pub by_minute: Vec<u32>,
}

impl RuleFields {
    /// Parse "KEY=VALUE;..." pairs. Unknown keys are ignored; a malformed
    /// value for a known key fails the parse.
    pub fn parse(body: &str) -> Option<Self> {
        let mut fields = RuleFields {
            interval: 1,
            ..Default::default()
        };
        for part in body.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part.split_once('=')?;
            match key.to_ascii_uppercase().as_str() {
                "FREQ" => fields.freq = Some(value.to_ascii_uppercase()),
                "INTERVAL" => fields.interval = value.parse().ok()?,
                "COUNT" => fields.count = Some(value.parse().ok()?),
                "UNTIL" => fields.until = Some(parse_until(value)?),
                "BYDAY" => fields.by_day = split_list(value, |s| Some(s.to_ascii_uppercase()))?,
                "BYMONTHDAY" => fields.by_month_day = split_list(value, |s| s.parse().ok())?,
                "BYMONTH" => fields.by_month = split_list(value, |s| s.parse().ok())?,
                "BYHOUR" => fields.by_hour = split_list(value, |s| s.parse().ok())?,
                "BYMINUTE" => fields.by_minute = split_list(value, |s| s.parse().ok())?,
                _ => {}
            }
        }
        Some(fields)
    }

    /// Render as an English phrase; `None` when FREQ is missing or unknown,
    /// or INTERVAL or COUNT is zero.
    pub fn describe(&self) -> Option<String> {
        if self.interval == 0 || self.count == Some(0) {
            return None;
        }
        let (singular, plural) = match self.freq.as_deref()? {
            "SECONDLY" => ("second", "seconds"),
            "MINUTELY" => ("minute", "minutes"),
            "HOURLY" => ("hour", "hours"),
            "DAILY" => ("day", "days"),
            "WEEKLY" => ("week", "weeks"),
            "MONTHLY" => ("month", "months"),
            "YEARLY" => ("year", "years"),
            _ => return None,
        };

        let mut text = if is_weekdays(&self.by_day) && self.interval == 1 {
            "every weekday".to_string()
        } else if self.interval == 1 {
            format!("every {singular}")
        } else {
            format!("every {} {plural}", self.interval)
        };

        if !self.by_day.is_empty() && !is_weekdays(&self.by_day) {
            let days: Option<Vec<String>> = self.by_day.iter().map(|d| day_phrase(d)).collect();
            text.push_str(&format!(" on {}", join_words(&days?)));
        }
        if !self.by_month_day.is_empty() {
            let days: Vec<String> = self.by_month_day.iter().map(|d| month_day_phrase(*d)).collect();
            text.push_str(&format!(" on the {}", join_words(&days)));
        }
        if !self.by_month.is_empty() {
            let months: Option<Vec<String>> = self
                .by_month
                .iter()
                .map(|m| month_name(*m).map(str::to_string))
                .collect();
            text.push_str(&format!(" in {}", join_words(&months?)));
        }
        if let ([hour], minutes) = (self.by_hour.as_slice(), self.by_minute.as_slice()) {
            let minute = minutes.first().copied().unwrap_or(0);
            text.push_str(&format!(" at {hour:02}:{minute:02}"));
        }
        match (self.count, self.until) {
            (Some(1), _) => text.push_str(", once"),
            (Some(n), _) => text.push_str(&format!(", {n} times")),
            (None, Some(until)) => text.push_str(&format!(" until {}", until.format("%B %-d, %Y"))),
            (None, None) => {}
        }
        Some(text)
    }
}

/// UNTIL accepts "YYYYMMDDTHHMMSSZ", "YYYYMMDDTHHMMSS" (read as UTC) and "YYYYMMDD".
pub(crate) fn parse_until(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    let stripped = value.strip_suffix('Z').unwrap_or(value);
    if let Ok(dt) = NaiveDateTime::parse_from_str(stripped, "%Y%m%dT%H%M%S") {
        return Some(dt.and_utc());
    }
    NaiveDate::parse_from_str(stripped, "%Y%m%d")
        .ok()
        .and_then(|d| d.and_hms_opt(23, 59, 59))
        .map(|dt| dt.and_utc())
}

fn split_list<T>(value: &str, parse: impl Fn(&str) -> Option<T>) -> Option<Vec<T>> {
    value.split(',').map(|s| parse(s.trim())).collect()
}

fn is_weekdays(days: &[String]) -> bool {
    let mut sorted: Vec<&str> = days.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted == ["FR", "MO", "TH", "TU", "WE"]
}

fn weekday_name(code: &str) -> Option<&'static str> {
    Some(match code {
        "MO" => "Monday",
        "TU" => "Tuesday",
        "WE" => "Wednesday",
        "TH" => "Thursday",
        "FR" => "Friday",
        "SA" => "Saturday",
        "SU" => "Sunday",
        _ => return None,
    })
}

/// "MO" -> "Monday", "-1FR" -> "the last Friday", "2TU" -> "the 2nd Tuesday".
fn day_phrase(code: &str) -> Option<String> {
    let split = code.len().checked_sub(2)?;
    if !code.is_char_boundary(split) {
        return None;
    }
    let (ordinal, day) = code.split_at(split);
    let name = weekday_name(day)?;
    if ordinal.is_empty() {
        return Some(name.to_string());
    }
    let n: i32 = ordinal.trim_start_matches('+').parse().ok()?;
    Some(format!("the {} {name}", ordinal_word(n)))
}

fn month_day_phrase(day: i32) -> String {
    if day < 0 {
        format!("{} day", ordinal_word(day))
    } else {
        ordinal_word(day)
    }
}

fn ordinal_word(n: i32) -> String {
    match n {
        -1 => "last".to_string(),
        -2 => "second to last".to_string(),
        n if n < 0 => format!("{} from last", ordinal_word(-n)),
        n => {
            let suffix = match (n % 10, n % 100) {
                (_, 11..=13) => "th",
                (1, _) => "st",
                (2, _) => "nd",
                (3, _) => "rd",
                _ => "th",
            };
            format!("{n}{suffix}")
        }
    }
}

fn month_name(month: u32) -> Option<&'static str> {
    const MONTHS: [&str; 12] = [
        "January", "February", "March", "April", "May", "June", "July", "August", "September",
        "October", "November", "December",
    ];
    MONTHS.get(month.checked_sub(1)? as usize).copied()
}

fn join_words(items: &[String]) -> String {
    match items {
        [] => String::new(),
        [one] => one.clone(),
        [init @ .., last] => format!("{} and {last}", init.join(", ")),
    }
}
