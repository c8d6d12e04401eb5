//! Cron expression parsing and next occurrence calculation.
//!
//! Supports standard five-field cron expressions
//! (`minute hour day-of-month month day-of-week`) with:
//!
//! - `*`, single values, comma lists and ranges (`1-5`)
//! - step suffixes (`*/15`, `0-30/10`, `5/20`)
//! - month names (`JAN`..`DEC`) and weekday names (`SUN`..`SAT`)
//! - weekday `7` as an alias for Sunday
//! - shortcuts: `@yearly`, `@annually`, `@monthly`, `@weekly`, `@daily`,
//!   `@midnight`, `@hourly`
//!
//! When both day-of-month and day-of-week are restricted (neither starts
//! with `*`), a date matches if it satisfies *either* field, as in classic
//! cron. Otherwise both must match.
//!
//! Occurrences are computed on the wall clock of the timezone of the
//! `after` instant, at one-minute resolution. Wall-clock times skipped by a
//! DST transition never fire; repeated wall-clock times fire once, at the
//! earlier instant.

use chrono::{
    DateTime, Datelike, Duration, Local, LocalResult, NaiveDate, NaiveDateTime, TimeZone,
    Timelike,
};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// How many years ahead to search before giving up on an expression.
///
/// February 29th can be eight years apart (e.g. 2096 to 2104).
const MAX_SEARCH_YEARS: i32 = 9;

const MONTH_NAMES: &[&str] = &[
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];

const WEEKDAY_NAMES: &[&str] = &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Errors that can occur when parsing or evaluating schedules.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    /// The expression could not be parsed or contains out-of-range values.
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidExpression { expression: String, reason: String },

    /// The expression is well-formed but never matches a real date.
    #[error("no more occurrences")]
    NoMoreOccurrences,
}

impl ScheduleError {
    fn invalid(expression: &str, reason: impl Into<String>) -> Self {
        ScheduleError::InvalidExpression {
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }
}

/// Parsing rules for a single cron field.
struct FieldBounds {
    name: &'static str,
    min: u32,
    max: u32,
    /// Names accepted in place of numbers; index 0 maps to `min`.
    names: &'static [&'static str],
}

const MINUTE: FieldBounds = FieldBounds {
    name: "minute",
    min: 0,
    max: 59,
    names: &[],
};

const HOUR: FieldBounds = FieldBounds {
    name: "hour",
    min: 0,
    max: 23,
    names: &[],
};

const DAY_OF_MONTH: FieldBounds = FieldBounds {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: &[],
};

const MONTH: FieldBounds = FieldBounds {
    name: "month",
    min: 1,
    max: 12,
    names: MONTH_NAMES,
};

// 7 is accepted and folded onto Sunday (0) after parsing.
const DAY_OF_WEEK: FieldBounds = FieldBounds {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: WEEKDAY_NAMES,
};

/// A parsed cron field: one bit per allowed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Field {
    bits: u64,
    /// The field text started with `*`.
    wildcard: bool,
}

impl Field {
    fn matches(&self, value: u32) -> bool {
        value < 64 && self.bits & (1u64 << value) != 0
    }

    fn parse(text: &str, bounds: &FieldBounds) -> Result<Self, String> {
        if text.is_empty() {
            return Err(format!("empty {} field", bounds.name));
        }

        let mut bits = 0u64;
        for part in text.split(',') {
            if part.is_empty() {
                return Err(format!("empty list element in {} field", bounds.name));
            }

            let (range, step) = match part.split_once('/') {
                Some((range, step)) => {
                    let step = parse_number(step)
                        .ok_or_else(|| format!("invalid step '{}' in {} field", step, bounds.name))?;
                    if step == 0 {
                        return Err(format!("step must be positive in {} field", bounds.name));
                    }
                    (range, Some(step))
                }
                None => (part, None),
            };

            let (low, high) = if range == "*" {
                (bounds.min, bounds.max)
            } else if let Some((low, high)) = range.split_once('-') {
                (parse_value(low, bounds)?, parse_value(high, bounds)?)
            } else {
                let value = parse_value(range, bounds)?;
                // `5/10` means "from 5 to the end, every 10".
                if step.is_some() {
                    (value, bounds.max)
                } else {
                    (value, value)
                }
            };

            if low > high {
                return Err(format!(
                    "range {}-{} is reversed in {} field",
                    low, high, bounds.name
                ));
            }

            let step = step.unwrap_or(1) as usize;
            for value in (low..=high).step_by(step) {
                bits |= 1u64 << value;
            }
        }

        Ok(Self {
            bits,
            wildcard: text.starts_with('*'),
        })
    }
}

fn parse_number(text: &str) -> Option<u32> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

fn parse_value(text: &str, bounds: &FieldBounds) -> Result<u32, String> {
    let value = match parse_number(text) {
        Some(value) => value,
        None => bounds
            .names
            .iter()
            .position(|name| name.eq_ignore_ascii_case(text))
            .map(|index| index as u32 + bounds.min)
            .ok_or_else(|| format!("invalid value '{}' in {} field", text, bounds.name))?,
    };

    if value < bounds.min || value > bounds.max {
        return Err(format!(
            "value {} out of range {}-{} in {} field",
            value, bounds.min, bounds.max, bounds.name
        ));
    }
    Ok(value)
}

/// A parsed five-field cron schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    /// The original expression string.
    expression: String,
    minutes: Field,
    hours: Field,
    days_of_month: Field,
    months: Field,
    days_of_week: Field,
}

impl Schedule {
    /// Parse a cron expression or shortcut.
    pub fn parse(expression: impl Into<String>) -> Result<Self, ScheduleError> {
        let expression = expression.into();
        let trimmed = expression.trim();

        let fields_text = if trimmed.starts_with('@') {
            Self::expand_shortcut(trimmed)
                .ok_or_else(|| ScheduleError::invalid(&expression, "unknown shortcut"))?
        } else {
            trimmed
        };

        let fields: Vec<&str> = fields_text.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(ScheduleError::invalid(
                &expression,
                format!("expected 5 fields, got {}", fields.len()),
            ));
        }

        let parse = |text: &str, bounds: &FieldBounds| {
            Field::parse(text, bounds).map_err(|reason| ScheduleError::invalid(&expression, reason))
        };

        let minutes = parse(fields[0], &MINUTE)?;
        let hours = parse(fields[1], &HOUR)?;
        let days_of_month = parse(fields[2], &DAY_OF_MONTH)?;
        let months = parse(fields[3], &MONTH)?;
        let mut days_of_week = parse(fields[4], &DAY_OF_WEEK)?;

        if days_of_week.matches(7) {
            days_of_week.bits = (days_of_week.bits & !(1u64 << 7)) | 1;
        }

        Ok(Self {
            expression,
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
        })
    }

    fn expand_shortcut(shortcut: &str) -> Option<&'static str> {
        match shortcut.to_ascii_lowercase().as_str() {
            "@yearly" | "@annually" => Some("0 0 1 1 *"),
            "@monthly" => Some("0 0 1 * *"),
            "@weekly" => Some("0 0 * * 0"),
            "@daily" | "@midnight" => Some("0 0 * * *"),
            "@hourly" => Some("0 * * * *"),
            _ => None,
        }
    }

    /// Get the original expression string.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Check whether a calendar date satisfies the day fields.
    fn matches_date(&self, date: NaiveDate) -> bool {
        if !self.months.matches(date.month()) {
            return false;
        }

        let dom = self.days_of_month.matches(date.day());
        let dow = self
            .days_of_week
            .matches(date.weekday().num_days_from_sunday());

        if self.days_of_month.wildcard || self.days_of_week.wildcard {
            dom && dow
        } else {
            dom || dow
        }
    }

    /// Get the first occurrence strictly after the given instant.
    ///
    /// The wall clock of `after`'s timezone is used for matching.
    pub fn next_after<Tz: TimeZone>(
        &self,
        after: &DateTime<Tz>,
    ) -> Result<DateTime<Tz>, ScheduleError> {
        let tz = after.timezone();
        let local = after.naive_local();
        let limit = local.year() + MAX_SEARCH_YEARS;

        let mut candidate = truncate_to_minute(local)? + Duration::minutes(1);

        while candidate.year() <= limit {
            if !self.months.matches(candidate.month()) {
                candidate = first_of_next_month(candidate)?;
                continue;
            }

            if !self.matches_date(candidate.date()) {
                candidate = start_of_day(candidate.date() + Duration::days(1))?;
                continue;
            }

            if !self.hours.matches(candidate.hour()) {
                candidate = truncate_to_hour(candidate)? + Duration::hours(1);
                continue;
            }

            if !self.minutes.matches(candidate.minute()) {
                candidate += Duration::minutes(1);
                continue;
            }

            match tz.from_local_datetime(&candidate) {
                LocalResult::Single(instant) if instant > *after => return Ok(instant),
                LocalResult::Ambiguous(earliest, _) if earliest > *after => return Ok(earliest),
                _ => {}
            }

            candidate += Duration::minutes(1);
        }

        Err(ScheduleError::NoMoreOccurrences)
    }

    /// Get the next N occurrences after the given instant.
    pub fn next_n_after<Tz: TimeZone>(
        &self,
        after: &DateTime<Tz>,
        n: usize,
    ) -> Result<Vec<DateTime<Tz>>, ScheduleError> {
        let mut results = Vec::with_capacity(n);
        let mut current = after.clone();
        for _ in 0..n {
            current = self.next_after(&current)?;
            results.push(current.clone());
        }
        Ok(results)
    }

    /// Get the next occurrence on the local machine clock.
    pub fn next(&self) -> Result<DateTime<Local>, ScheduleError> {
        self.next_after(&Local::now())
    }
}

impl FromStr for Schedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expression)
    }
}

/// Compute the next trigger instant of `expression` after `after`, on
/// local machine time.
pub fn next_trigger(
    expression: &str,
    after: DateTime<Local>,
) -> Result<DateTime<Local>, ScheduleError> {
    Schedule::parse(expression)?.next_after(&after)
}

fn truncate_to_minute(t: NaiveDateTime) -> Result<NaiveDateTime, ScheduleError> {
    t.date()
        .and_hms_opt(t.hour(), t.minute(), 0)
        .ok_or(ScheduleError::NoMoreOccurrences)
}

fn truncate_to_hour(t: NaiveDateTime) -> Result<NaiveDateTime, ScheduleError> {
    t.date()
        .and_hms_opt(t.hour(), 0, 0)
        .ok_or(ScheduleError::NoMoreOccurrences)
}

fn start_of_day(date: NaiveDate) -> Result<NaiveDateTime, ScheduleError> {
    date.and_hms_opt(0, 0, 0)
        .ok_or(ScheduleError::NoMoreOccurrences)
}

fn first_of_next_month(t: NaiveDateTime) -> Result<NaiveDateTime, ScheduleError> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or(ScheduleError::NoMoreOccurrences)
        .and_then(start_of_day)
}
