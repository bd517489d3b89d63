use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::{Result, SchedulerError};

/// A parsed, seconds-first cron expression.
///
/// Accepts 6 fields (`sec min hour dom month dow`), 7 fields (with year),
/// classic 5-field expressions (seconds default to `0`) and `@hourly`-style
/// descriptors.
#[derive(Debug, Clone)]
pub struct CronExpr {
    source: String,
    schedule: ::cron::Schedule,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        let trimmed = expr.trim();
        let invalid = |reason: String| SchedulerError::InvalidCron {
            expr: expr.to_string(),
            reason,
        };
        if trimmed.is_empty() {
            return Err(invalid("expression is empty".to_string()));
        }

        let normalized = if trimmed.starts_with('@') {
            trimmed.to_string()
        } else {
            match trimmed.split_whitespace().count() {
                5 => format!("0 {trimmed}"),
                6 | 7 => trimmed.to_string(),
                n => return Err(invalid(format!("expected 5, 6 or 7 fields, got {n}"))),
            }
        };

        let schedule = ::cron::Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))?;
        Ok(Self {
            source: trimmed.to_string(),
            schedule,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// First fire time strictly after `after`, or `None` if the expression
    /// never fires again.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

impl std::fmt::Display for CronExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, s).unwrap()
    }

    #[test]
    fn six_field_expression_has_second_granularity() {
        let cron = CronExpr::parse("*/5 * * * * *").unwrap();
        assert_eq!(cron.next_after(at(10, 0, 1)), Some(at(10, 0, 5)));
        assert_eq!(cron.next_after(at(10, 0, 5)), Some(at(10, 0, 10)));
    }

    #[test]
    fn five_field_expression_fires_on_the_minute() {
        let cron = CronExpr::parse("*/10 * * * *").unwrap();
        assert_eq!(cron.as_str(), "*/10 * * * *");
        assert_eq!(cron.next_after(at(10, 1, 30)), Some(at(10, 10, 0)));
    }

    #[test]
    fn descriptors_are_accepted() {
        let cron = CronExpr::parse("@hourly").unwrap();
        assert_eq!(cron.next_after(at(10, 15, 0)), Some(at(11, 0, 0)));
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        for bad in ["", "   ", "* * * *", "61 * * * * *", "not a cron at all ok"] {
            let err = CronExpr::parse(bad).unwrap_err();
            assert_eq!(err.kind(), fleet_core::ErrorKind::Validation, "{bad:?}");
        }
    }
}
