//! Cron schedule parsing and next-fire computation.
//!
//! The accepted grammar is the classic 5-field form with `*`, single values
//! and comma-lists per field — no ranges, no steps. Expressions are
//! validated when configuration is accepted, never at fire time.

use crate::error::ConfigError;
use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use std::str::FromStr;

/// Upper bound on the next-fire scan: four years of minutes. Any satisfiable
/// expression in the accepted grammar fires well within this window.
const MAX_SCAN_MINUTES: i64 = 4 * 366 * 24 * 60;

#[derive(Debug, Clone, PartialEq, Eq)]
enum CronField {
    Any,
    Values(Vec<u32>),
}

impl CronField {
    fn matches(&self, value: u32) -> bool {
        match self {
            CronField::Any => true,
            CronField::Values(values) => values.contains(&value),
        }
    }

    fn is_any(&self) -> bool {
        matches!(self, CronField::Any)
    }
}

/// A validated 5-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

impl FromStr for CronSchedule {
    type Err = ConfigError;

    fn from_str(expression: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(ConfigError::new(format!(
                "cron expression must have 5 fields, got {}: {expression:?}",
                fields.len()
            )));
        }
        Ok(Self {
            minute: parse_field(fields[0], "minute", 0, 59)?,
            hour: parse_field(fields[1], "hour", 0, 23)?,
            day_of_month: parse_field(fields[2], "day of month", 1, 31)?,
            month: parse_field(fields[3], "month", 1, 12)?,
            day_of_week: parse_field(fields[4], "day of week", 0, 6)?,
        })
    }
}

fn parse_field(raw: &str, name: &str, min: u32, max: u32) -> Result<CronField, ConfigError> {
    if raw == "*" {
        return Ok(CronField::Any);
    }
    let mut values = Vec::new();
    for part in raw.split(',') {
        let value: u32 = part.parse().map_err(|_| {
            ConfigError::new(format!("cron {name} field: {part:?} is not a number"))
        })?;
        if value < min || value > max {
            return Err(ConfigError::new(format!(
                "cron {name} field: {value} outside {min}..={max}"
            )));
        }
        if !values.contains(&value) {
            values.push(value);
        }
    }
    Ok(CronField::Values(values))
}

impl CronSchedule {
    /// Whether the expression fires at `t` (second precision is ignored).
    pub fn matches(&self, t: &DateTime<Utc>) -> bool {
        if !self.minute.matches(t.minute())
            || !self.hour.matches(t.hour())
            || !self.month.matches(t.month())
        {
            return false;
        }
        let dom = self.day_of_month.matches(t.day());
        // chrono and cron agree on 0 = Sunday here.
        let dow = self.day_of_week.matches(t.weekday().num_days_from_sunday());
        // Standard cron: when both day fields are restricted, either one
        // matching fires the job.
        if self.day_of_month.is_any() || self.day_of_week.is_any() {
            dom && dow
        } else {
            dom || dow
        }
    }

    /// The first fire time strictly after `from`.
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = (from + Duration::minutes(1))
            .with_second(0)?
            .with_nanosecond(0)?;
        for _ in 0..MAX_SCAN_MINUTES {
            if self.matches(&t) {
                return Some(t);
            }
            t += Duration::minutes(1);
        }
        None
    }
}

/// Validate an expression without keeping the parse. Used when accepting
/// configuration edits.
pub fn validate_cron(expression: &str) -> Result<(), ConfigError> {
    CronSchedule::from_str(expression).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn accepts_the_supported_grammar() {
        for expr in [
            "0 2 * * *",
            "* * * * *",
            "0,30 * * * *",
            "15 6,18 1 * *",
            "0 0 * * 0,6",
            "59 23 31 12 6",
        ] {
            assert!(validate_cron(expr).is_ok(), "{expr} should parse");
        }
    }

    #[test]
    fn rejects_everything_else() {
        for expr in [
            "",
            "0 2 * *",
            "0 2 * * * *",
            "*/5 * * * *",
            "1-5 * * * *",
            "60 * * * *",
            "* 24 * * *",
            "* * 0 * *",
            "* * 32 * *",
            "* * * 13 *",
            "* * * * 7",
            "a * * * *",
            "1,,2 * * * *",
        ] {
            assert!(validate_cron(expr).is_err(), "{expr:?} should be rejected");
        }
    }

    #[test]
    fn next_fire_for_daily_schedule() {
        let schedule: CronSchedule = "0 2 * * *".parse().unwrap();
        assert_eq!(
            schedule.next_after(utc(2026, 8, 6, 1, 30)),
            Some(utc(2026, 8, 6, 2, 0))
        );
        // Exactly at the fire time: next one is tomorrow.
        assert_eq!(
            schedule.next_after(utc(2026, 8, 6, 2, 0)),
            Some(utc(2026, 8, 7, 2, 0))
        );
    }

    #[test]
    fn comma_lists_fire_on_each_value() {
        let schedule: CronSchedule = "0,30 * * * *".parse().unwrap();
        assert_eq!(
            schedule.next_after(utc(2026, 8, 6, 9, 1)),
            Some(utc(2026, 8, 6, 9, 30))
        );
        assert_eq!(
            schedule.next_after(utc(2026, 8, 6, 9, 31)),
            Some(utc(2026, 8, 6, 10, 0))
        );
    }

    #[test]
    fn restricted_day_fields_use_or_semantics() {
        // 2026-08-06 is a Thursday (weekday 4).
        let schedule: CronSchedule = "0 0 15 * 4".parse().unwrap();
        // Thursday the 6th matches via the weekday even though the day of
        // month says 15.
        assert!(schedule.matches(&utc(2026, 8, 6, 0, 0)));
        // Saturday the 15th matches via the day of month.
        assert!(schedule.matches(&utc(2026, 8, 15, 0, 0)));
        // Friday the 7th matches neither.
        assert!(!schedule.matches(&utc(2026, 8, 7, 0, 0)));
    }

    #[test]
    fn month_and_day_combination() {
        let schedule: CronSchedule = "0 12 1 1 *".parse().unwrap();
        assert_eq!(
            schedule.next_after(utc(2026, 8, 6, 0, 0)),
            Some(utc(2027, 1, 1, 12, 0))
        );
    }
}
