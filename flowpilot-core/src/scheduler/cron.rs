//! Five-field cron expressions evaluated in UTC
//!
//! `minute hour day-of-month month day-of-week`, each field accepting `*`,
//! values, `a-b` ranges, `/n` steps and comma lists. Months and weekdays
//! accept three-letter names; weekday 7 is Sunday. When both day fields are
//! restricted a time matches if either does.

use crate::error::{FlowError, FlowResult};
use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use std::fmt;
use std::str::FromStr;

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const WEEKDAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// Searches further out than this give up (e.g. `0 0 30 2 *`)
const MAX_SEARCH_YEARS: i64 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    /// Offset of names[0]
    name_base: u32,
}

const MINUTE: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
    names: &[],
    name_base: 0,
};
const HOUR: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
    names: &[],
    name_base: 0,
};
const DAY_OF_MONTH: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: &[],
    name_base: 0,
};
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: &MONTH_NAMES,
    name_base: 1,
};
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: &WEEKDAY_NAMES,
    name_base: 0,
};

impl CronExpression {
    pub fn parse(expression: &str) -> FlowResult<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(
                expression,
                format!("expected 5 fields, found {}", fields.len()),
            ));
        }

        let mut days_of_week = parse_field(fields[4], &DAY_OF_WEEK)
            .map_err(|msg| invalid(expression, msg))?;
        // 7 is an alias for Sunday
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            source: expression.trim().to_string(),
            minutes: parse_field(fields[0], &MINUTE).map_err(|msg| invalid(expression, msg))?,
            hours: parse_field(fields[1], &HOUR).map_err(|msg| invalid(expression, msg))?,
            days_of_month: parse_field(fields[2], &DAY_OF_MONTH)
                .map_err(|msg| invalid(expression, msg))?,
            months: parse_field(fields[3], &MONTH).map_err(|msg| invalid(expression, msg))?,
            days_of_week,
            dom_restricted: !fields[2].starts_with('*'),
            dow_restricted: !fields[4].starts_with('*'),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, time: DateTime<Utc>) -> bool {
        bit(self.minutes, time.minute())
            && bit(self.hours, time.hour())
            && bit(self.months, time.month())
            && self.day_matches(time)
    }

    fn day_matches(&self, time: DateTime<Utc>) -> bool {
        let dom = bit(self.days_of_month, time.day());
        let dow = bit(self.days_of_week, time.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// First matching minute strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let limit = after + Duration::days(366 * MAX_SEARCH_YEARS);
        let mut time = truncate_to_minute(after)? + Duration::minutes(1);

        while time <= limit {
            if !bit(self.months, time.month()) {
                let (year, month) = if time.month() == 12 {
                    (time.year() + 1, 1)
                } else {
                    (time.year(), time.month() + 1)
                };
                time = Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()?;
                continue;
            }
            if !self.day_matches(time) {
                let next_day = time.date_naive().succ_opt()?.and_hms_opt(0, 0, 0)?;
                time = Utc.from_utc_datetime(&next_day);
                continue;
            }
            if !bit(self.hours, time.hour()) {
                time = truncate_to_hour(time)? + Duration::hours(1);
                continue;
            }
            if !bit(self.minutes, time.minute()) {
                time += Duration::minutes(1);
                continue;
            }
            return Some(time);
        }
        None
    }

    /// The next `count` firing times after `after`
    pub fn upcoming(&self, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut times = Vec::with_capacity(count);
        let mut cursor = after;
        while times.len() < count {
            match self.next_after(cursor) {
                Some(next) => {
                    times.push(next);
                    cursor = next;
                }
                None => break,
            }
        }
        times
    }
}

impl FromStr for CronExpression {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

fn invalid(expression: &str, message: String) -> FlowError {
    FlowError::Validation(format!("Invalid cron expression '{}': {}", expression, message))
}

fn bit(mask: u64, value: u32) -> bool {
    mask & (1u64 << value) != 0
}

fn truncate_to_minute(time: DateTime<Utc>) -> Option<DateTime<Utc>> {
    time.with_second(0)?.with_nanosecond(0)
}

fn truncate_to_hour(time: DateTime<Utc>) -> Option<DateTime<Utc>> {
    truncate_to_minute(time)?.with_minute(0)
}

fn parse_field(field: &str, spec: &FieldSpec) -> Result<u64, String> {
    let mut mask = 0u64;
    for part in field.split(',') {
        if part.is_empty() {
            return Err(format!("empty list item in {} field", spec.name));
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step '{}' in {} field", step, spec.name))?;
                if step == 0 {
                    return Err(format!("step must be positive in {} field", spec.name));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (start, end) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            (parse_value(lo, spec)?, parse_value(hi, spec)?)
        } else {
            let value = parse_value(range, spec)?;
            // `5/15` runs from 5 to the end of the field
            if part.contains('/') {
                (value, spec.max)
            } else {
                (value, value)
            }
        };

        if start > end {
            return Err(format!("range {}-{} is reversed in {} field", start, end, spec.name));
        }
        let mut value = start;
        while value <= end {
            mask |= 1u64 << value;
            value += step;
        }
    }
    Ok(mask)
}

fn parse_value(token: &str, spec: &FieldSpec) -> Result<u32, String> {
    let lowered = token.to_ascii_lowercase();
    let value = match spec.names.iter().position(|name| *name == lowered) {
        Some(index) => index as u32 + spec.name_base,
        None => token
            .parse::<u32>()
            .map_err(|_| format!("invalid value '{}' in {} field", token, spec.name))?,
    };
    if value < spec.min || value > spec.max {
        return Err(format!(
            "value {} out of range {}-{} in {} field",
            value, spec.min, spec.max, spec.name
        ));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_every_five_minutes() {
        let cron = CronExpression::parse("*/5 * * * *").unwrap();
        assert_eq!(
            cron.next_after(at(2024, 3, 10, 14, 2, 30)),
            Some(at(2024, 3, 10, 14, 5, 0))
        );
        // Exactly on a boundary moves to the next one
        assert_eq!(
            cron.next_after(at(2024, 3, 10, 14, 5, 0)),
            Some(at(2024, 3, 10, 14, 10, 0))
        );
        assert_eq!(
            cron.next_after(at(2024, 12, 31, 23, 58, 0)),
            Some(at(2025, 1, 1, 0, 0, 0))
        );
    }

    #[test]
    fn test_daily_and_weekday_fields() {
        let nightly = CronExpression::parse("30 2 * * *").unwrap();
        assert_eq!(
            nightly.next_after(at(2024, 3, 10, 3, 0, 0)),
            Some(at(2024, 3, 11, 2, 30, 0))
        );

        // 2024-03-10 is a Sunday
        let weekdays = CronExpression::parse("0 9 * * mon-fri").unwrap();
        assert_eq!(
            weekdays.next_after(at(2024, 3, 9, 12, 0, 0)),
            Some(at(2024, 3, 11, 9, 0, 0))
        );

        let sunday = CronExpression::parse("0 0 * * 7").unwrap();
        assert_eq!(
            sunday.next_after(at(2024, 3, 4, 0, 0, 0)),
            Some(at(2024, 3, 10, 0, 0, 0))
        );
    }

    #[test]
    fn test_day_fields_are_ored_when_both_restricted() {
        // 1st of the month or any Friday
        let cron = CronExpression::parse("0 0 1 * fri").unwrap();
        assert_eq!(
            cron.next_after(at(2024, 3, 2, 0, 0, 0)),
            Some(at(2024, 3, 8, 0, 0, 0))
        );
    }

    #[test]
    fn test_month_names_lists_and_leap_days() {
        let cron = CronExpression::parse("0 12 29 feb *").unwrap();
        assert_eq!(
            cron.next_after(at(2025, 1, 1, 0, 0, 0)),
            Some(at(2028, 2, 29, 12, 0, 0))
        );

        let quarterly = CronExpression::parse("15 8 1 1,4,7,10 *").unwrap();
        assert_eq!(
            quarterly.upcoming(at(2024, 2, 1, 0, 0, 0), 2),
            vec![at(2024, 4, 1, 8, 15, 0), at(2024, 7, 1, 8, 15, 0)]
        );
    }

    #[test]
    fn test_impossible_date_gives_none() {
        let cron = CronExpression::parse("0 0 30 2 *").unwrap();
        assert_eq!(cron.next_after(at(2024, 1, 1, 0, 0, 0)), None);
    }

    #[test]
    fn test_invalid_expressions() {
        for expression in [
            "",
            "* * * *",
            "60 * * * *",
            "*/0 * * * *",
            "5-1 * * * *",
            "* * * foo *",
            "* * 0 * *",
            "a b c d e",
        ] {
            let err = CronExpression::parse(expression).unwrap_err();
            assert!(matches!(err, FlowError::Validation(_)), "{}", expression);
        }
    }
}
