//! Five-field cron schedules: `minute hour day-of-month month day-of-week`.
//!
//! Fields accept `*`, numbers, lists (`1,5`), ranges (`1-5`) and steps
//! (`*/15`, `10-40/10`). Day-of-week runs 0-7 with both 0 and 7 meaning
//! Sunday. When day-of-month and day-of-week are both restricted a day
//! matches if either does.

use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use quote_oracle_types::Timestamp;

use crate::error::ScheduleError;

/// Upper bound on search steps before giving up on a schedule.
const MAX_SEARCH_STEPS: usize = 100_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expr: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// First matching minute boundary at or after `position` (UTC seconds).
    pub fn next_at_or_after(&self, position: Timestamp) -> Option<Timestamp> {
        let secs = i64::try_from(position.checked_add(59)? / 60 * 60).ok()?;
        let mut at = DateTime::<Utc>::from_timestamp(secs, 0)?.naive_utc();

        for _ in 0..MAX_SEARCH_STEPS {
            if !bit(self.months, at.month()) {
                let (year, month) = if at.month() == 12 {
                    (at.year() + 1, 1)
                } else {
                    (at.year(), at.month() + 1)
                };
                at = NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.day_matches(at.day(), at.weekday().num_days_from_sunday()) {
                at = (at.date() + Duration::days(1)).and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !bit(self.hours, at.hour()) {
                at = at.date().and_hms_opt(at.hour(), 0, 0)? + Duration::hours(1);
                continue;
            }
            if !bit(self.minutes, at.minute()) {
                at += Duration::minutes(1);
                continue;
            }
            return u64::try_from(at.and_utc().timestamp()).ok();
        }
        None
    }

    fn day_matches(&self, day_of_month: u32, day_of_week: u32) -> bool {
        let dom = bit(self.days_of_month, day_of_month);
        let dow = bit(self.days_of_week, day_of_week);
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }
}

impl FromStr for CronSchedule {
    type Err = ScheduleError;

    fn from_str(expr: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| ScheduleError::InvalidCron {
            expr: expr.to_string(),
            reason,
        };

        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(format!("expected 5 fields, got {}", fields.len())));
        }

        let minutes = parse_field(fields[0], 0, 59).map_err(invalid)?;
        let hours = parse_field(fields[1], 0, 23).map_err(invalid)?;
        let days_of_month = parse_field(fields[2], 1, 31).map_err(invalid)?;
        let months = parse_field(fields[3], 1, 12).map_err(invalid)?;
        let mut days_of_week = parse_field(fields[4], 0, 7).map_err(invalid)?;
        if bit(days_of_week, 7) {
            days_of_week |= 1;
        }

        Ok(Self {
            expr: expr.to_string(),
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted: fields[2] != "*",
            dow_restricted: fields[4] != "*",
        })
    }
}

fn bit(mask: u64, n: u32) -> bool {
    n < 64 && mask & (1u64 << n) != 0
}

fn parse_field(field: &str, min: u32, max: u32) -> Result<u64, String> {
    let mut mask = 0u64;
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step '{}'", step))?;
                if step == 0 {
                    return Err("step must be positive".to_string());
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            (parse_number(lo, min, max)?, parse_number(hi, min, max)?)
        } else {
            let n = parse_number(range, min, max)?;
            // `5/10` means "from 5 to the end, every 10".
            if part.contains('/') {
                (n, max)
            } else {
                (n, n)
            }
        };
        if lo > hi {
            return Err(format!("empty range {}-{}", lo, hi));
        }

        let mut n = lo;
        while n <= hi {
            mask |= 1u64 << n;
            n += step;
        }
    }
    Ok(mask)
}

fn parse_number(s: &str, min: u32, max: u32) -> Result<u32, String> {
    let n: u32 = s.parse().map_err(|_| format!("invalid number '{}'", s))?;
    if n < min || n > max {
        return Err(format!("{} out of range {}-{}", n, min, max));
    }
    Ok(n)
}
