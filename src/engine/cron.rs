use chrono::{DateTime, Datelike, Duration, Timelike, Utc};

use crate::error::AppError;

/// Parsed 5-field cron expression (minute, hour, day-of-month, month,
/// day-of-week with 0 = Sunday). Backs the `schedule` trigger kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minutes: Vec<u32>,
    hours: Vec<u32>,
    days_of_month: Vec<u32>,
    months: Vec<u32>,
    days_of_week: Vec<u32>,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, AppError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(AppError::validation(format!(
                "cron expression needs 5 fields, got {}",
                fields.len()
            )));
        }
        Ok(Self {
            minutes: parse_field(fields[0], 0, 59)?,
            hours: parse_field(fields[1], 0, 23)?,
            days_of_month: parse_field(fields[2], 1, 31)?,
            months: parse_field(fields[3], 1, 12)?,
            days_of_week: parse_field(fields[4], 0, 6)?,
        })
    }

    pub fn matches(&self, dt: DateTime<Utc>) -> bool {
        self.minutes.contains(&dt.minute())
            && self.hours.contains(&dt.hour())
            && self.days_of_month.contains(&dt.day())
            && self.months.contains(&dt.month())
            && self.days_of_week.contains(&dt.weekday().num_days_from_sunday())
    }

    /// The most recent fire minute inside `(now - window_minutes, now]`, if
    /// any. Heartbeats run on an interval, so a schedule is "due" when a tick
    /// landed anywhere in the window since the previous run.
    pub fn due_within(&self, now: DateTime<Utc>, window_minutes: i64) -> Option<DateTime<Utc>> {
        let mut cursor = truncate_to_minute(now);
        for _ in 0..=window_minutes.max(0) {
            if self.matches(cursor) {
                return Some(cursor);
            }
            cursor -= Duration::minutes(1);
        }
        None
    }

    /// The next fire minute strictly after `from`, or `None` when nothing
    /// matches within a four-year horizon (unsatisfiable day/month combos).
    pub fn next_fire_time(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut current = truncate_to_minute(from) + Duration::minutes(1);
        let max_iterations = 4 * 366 * 24 * 60;

        for _ in 0..max_iterations {
            if self.matches(current) {
                return Some(current);
            }

            // Skip ahead past whole non-matching months/days/hours instead of
            // crawling minute by minute.
            if !self.months.contains(&current.month()) {
                let next_month = if current.month() == 12 {
                    current
                        .with_year(current.year() + 1)
                        .and_then(|d| d.with_month(1))
                        .and_then(|d| d.with_day(1))
                } else {
                    current
                        .with_month(current.month() + 1)
                        .and_then(|d| d.with_day(1))
                };
                match next_month.and_then(|d| d.with_hour(0)).and_then(|d| d.with_minute(0)) {
                    Some(d) => current = d,
                    None => return None,
                }
                continue;
            }

            if !self.days_of_month.contains(&current.day())
                || !self
                    .days_of_week
                    .contains(&current.weekday().num_days_from_sunday())
            {
                match (current + Duration::days(1)).with_hour(0).and_then(|d| d.with_minute(0)) {
                    Some(d) => current = d,
                    None => return None,
                }
                continue;
            }

            if !self.hours.contains(&current.hour()) {
                match (current + Duration::hours(1)).with_minute(0) {
                    Some(d) => current = d,
                    None => return None,
                }
                continue;
            }

            current += Duration::minutes(1);
        }

        None
    }
}

fn truncate_to_minute(dt: DateTime<Utc>) -> DateTime<Utc> {
    dt.with_second(0)
        .and_then(|d| d.with_nanosecond(0))
        .unwrap_or(dt)
}

/// One cron field. Supports `*`, `*/N`, `N`, `N-M`, `N,M,P` and combinations.
fn parse_field(field: &str, min: u32, max: u32) -> Result<Vec<u32>, AppError> {
    let mut values = Vec::new();
    for part in field.split(',') {
        let part = part.trim();
        if let Some((base, step_str)) = part.split_once('/') {
            let step: u32 = step_str
                .parse()
                .map_err(|_| AppError::validation(format!("invalid cron step '{step_str}'")))?;
            if step == 0 {
                return Err(AppError::validation("cron step cannot be zero"));
            }
            let (lo, hi) = if base == "*" {
                (min, max)
            } else if base.contains('-') {
                parse_range_bounds(base, min, max)?
            } else {
                let start: u32 = base
                    .parse()
                    .map_err(|_| AppError::validation(format!("invalid cron value '{base}'")))?;
                (start, max)
            };
            let mut v = lo;
            while v <= hi {
                values.push(v);
                v += step;
            }
        } else if part.contains('-') {
            let (lo, hi) = parse_range_bounds(part, min, max)?;
            values.extend(lo..=hi);
        } else if part == "*" {
            values.extend(min..=max);
        } else {
            let v: u32 = part
                .parse()
                .map_err(|_| AppError::validation(format!("invalid cron value '{part}'")))?;
            if v < min || v > max {
                return Err(AppError::validation(format!(
                    "cron value {v} out of range {min}-{max}"
                )));
            }
            values.push(v);
        }
    }
    values.sort_unstable();
    values.dedup();
    if values.is_empty() {
        return Err(AppError::validation("empty cron field"));
    }
    Ok(values)
}

fn parse_range_bounds(s: &str, min: u32, max: u32) -> Result<(u32, u32), AppError> {
    let (lo_str, hi_str) = s
        .split_once('-')
        .ok_or_else(|| AppError::validation(format!("invalid cron range '{s}'")))?;
    let lo: u32 = lo_str
        .parse()
        .map_err(|_| AppError::validation(format!("invalid cron range start '{lo_str}'")))?;
    let hi: u32 = hi_str
        .parse()
        .map_err(|_| AppError::validation(format!("invalid cron range end '{hi_str}'")))?;
    if lo < min || hi > max || lo > hi {
        return Err(AppError::validation(format!(
            "cron range {lo}-{hi} out of bounds {min}-{max}"
        )));
    }
    Ok((lo, hi))
}
