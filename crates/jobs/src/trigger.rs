//! Immediate and recurring triggers.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use subman_core::{JobId, TriggerId};

use crate::error::JobError;

/// When a request runs.
#[derive(Debug, Clone, Default)]
pub enum Trigger {
    /// Queue once, now.
    #[default]
    Immediate,
    /// Fire repeatedly on a schedule; each firing is a fresh submission.
    Recurring(Schedule),
}

impl Trigger {
    pub fn cron(expression: &str) -> Result<Self, JobError> {
        Schedule::cron(expression).map(Trigger::Recurring)
    }

    pub fn every(interval: Duration) -> Result<Self, JobError> {
        Schedule::every(interval).map(Trigger::Recurring)
    }

    pub fn is_recurring(&self) -> bool {
        matches!(self, Trigger::Recurring(_))
    }
}

#[derive(Debug, Clone)]
pub enum Schedule {
    /// Seconds-resolution cron expression (`sec min hour dom month dow [year]`).
    Cron {
        expression: String,
        schedule: Box<cron::Schedule>,
    },
    /// Fixed interval measured from the tick that fired, so a late tick
    /// pushes every later fire back.
    Every(Duration),
}

impl Schedule {
    pub fn cron(expression: &str) -> Result<Self, JobError> {
        let schedule = cron::Schedule::from_str(expression)
            .map_err(|e| JobError::InvalidSchedule(format!("{expression}: {e}")))?;
        Ok(Schedule::Cron {
            expression: expression.to_string(),
            schedule: Box::new(schedule),
        })
    }

    pub fn every(interval: Duration) -> Result<Self, JobError> {
        if interval.is_zero() {
            return Err(JobError::InvalidSchedule(
                "interval must be greater than zero".to_string(),
            ));
        }
        Ok(Schedule::Every(interval))
    }

    /// Next fire time strictly after `after`, if the schedule has one.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Cron { schedule, .. } => schedule.after(&after).next(),
            Schedule::Every(interval) => {
                let step = chrono::Duration::from_std(*interval).ok()?;
                after.checked_add_signed(step)
            }
        }
    }
}

impl FromStr for Schedule {
    type Err = JobError;

    /// `every <n><ms|s|m|h>` or a cron expression.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.strip_prefix("every ") {
            Some(rest) => Schedule::every(parse_interval(rest.trim())?),
            None => Schedule::cron(trimmed),
        }
    }
}

fn parse_interval(s: &str) -> Result<Duration, JobError> {
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| JobError::InvalidSchedule(format!("bad interval: {s}")))?;
    let interval = match unit.trim() {
        "ms" => Duration::from_millis(value),
        "s" | "" => Duration::from_secs(value),
        "m" => Duration::from_secs(value * 60),
        "h" => Duration::from_secs(value * 3600),
        other => {
            return Err(JobError::InvalidSchedule(format!(
                "unknown interval unit `{other}`"
            )));
        }
    };
    Ok(interval)
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Cron { expression, .. } => f.write_str(expression),
            Schedule::Every(interval) => write!(f, "every {}ms", interval.as_millis()),
        }
    }
}

impl Serialize for Schedule {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Snapshot of a registered recurring trigger.
#[derive(Debug, Clone, Serialize)]
pub struct TriggerInfo {
    pub id: TriggerId,
    pub job_key: String,
    pub name: String,
    pub schedule: Schedule,
    pub next_fire: Option<DateTime<Utc>>,
    /// Jobs spawned so far.
    pub spawned: u64,
    /// Ticks skipped because the previous run was still active or was rejected.
    pub skipped: u64,
    pub last_job: Option<JobId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn cron_schedule_computes_next_fire() {
        let schedule = Schedule::cron("0 0 3 * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let next = schedule.next_after(from).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 2, 3, 0, 0).unwrap());
        assert_eq!(schedule.to_string(), "0 0 3 * * *");
    }

    #[test]
    fn invalid_cron_is_rejected() {
        assert!(matches!(
            Schedule::cron("not a cron"),
            Err(JobError::InvalidSchedule(_))
        ));
    }

    #[test]
    fn interval_schedule_adds_interval() {
        let schedule = Schedule::every(Duration::from_millis(250)).unwrap();
        let from = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert_eq!(
            schedule.next_after(from).unwrap(),
            from + chrono::Duration::milliseconds(250)
        );
        assert!(Schedule::every(Duration::ZERO).is_err());
    }

    #[test]
    fn parses_interval_and_cron_strings() {
        assert!(matches!(
            "every 30s".parse::<Schedule>().unwrap(),
            Schedule::Every(d) if d == Duration::from_secs(30)
        ));
        assert!(matches!(
            "every 500ms".parse::<Schedule>().unwrap(),
            Schedule::Every(d) if d == Duration::from_millis(500)
        ));
        assert!(matches!(
            "0 */5 * * * *".parse::<Schedule>().unwrap(),
            Schedule::Cron { .. }
        ));
        assert!("every 5 weeks".parse::<Schedule>().is_err());
    }
}
