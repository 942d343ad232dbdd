use crate::jobs::JobError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// When a trigger fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerSchedule {
    /// Fire once, at or after the given time.
    At(DateTime<Utc>),
    /// Fire at `anchor + k * interval` for every k >= 0.
    Every {
        interval: Duration,
        anchor: DateTime<Utc>,
    },
}

impl TriggerSchedule {
    pub fn at(time: DateTime<Utc>) -> Self {
        TriggerSchedule::At(time)
    }

    /// Build a recurring schedule, rejecting intervals the scheduler cannot
    /// step with.
    pub fn every(interval: Duration, anchor: DateTime<Utc>) -> Result<Self, JobError> {
        let schedule = TriggerSchedule::Every { interval, anchor };
        schedule.validate()?;
        Ok(schedule)
    }

    pub fn validate(&self) -> Result<(), JobError> {
        match self {
            TriggerSchedule::At(_) => Ok(()),
            TriggerSchedule::Every { interval, .. } => {
                if interval.is_zero() {
                    return Err(JobError::SchedulerMisconfiguration(
                        "interval must be greater than zero".to_string(),
                    ));
                }
                if interval.as_millis() == 0 {
                    return Err(JobError::SchedulerMisconfiguration(format!(
                        "interval {:?} is below the 1ms resolution",
                        interval
                    )));
                }
                if chrono::Duration::from_std(*interval).is_err() {
                    return Err(JobError::SchedulerMisconfiguration(format!(
                        "interval {:?} is out of range",
                        interval
                    )));
                }
                Ok(())
            }
        }
    }

    pub fn is_recurring(&self) -> bool {
        matches!(self, TriggerSchedule::Every { .. })
    }

    /// First fire time for a trigger armed at `now`.
    ///
    /// A one-shot fires at its time even if that is already past. A
    /// recurring rule starts at its anchor, or at the first slot at or after
    /// `now` when the anchor is in the past.
    pub fn first_fire_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            TriggerSchedule::At(time) => *time,
            TriggerSchedule::Every { interval, anchor } => {
                slot_at_or_after(*anchor, *interval, now, false)
            }
        }
    }

    /// Next fire time after a fire handled at `now`: the first slot strictly
    /// after `now`. Slots missed while the scheduler was late are skipped.
    /// `None` for one-shots.
    pub fn next_fire_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            TriggerSchedule::At(_) => None,
            TriggerSchedule::Every { interval, anchor } => {
                Some(slot_at_or_after(*anchor, *interval, now, true))
            }
        }
    }
}

fn slot_at_or_after(
    anchor: DateTime<Utc>,
    interval: Duration,
    now: DateTime<Utc>,
    strictly_after: bool,
) -> DateTime<Utc> {
    let elapsed_ms = (now - anchor).num_milliseconds();
    if elapsed_ms < 0 || (elapsed_ms == 0 && !strictly_after) {
        return anchor;
    }
    let interval_ms = (interval.as_millis() as i64).max(1);
    let mut slots = elapsed_ms / interval_ms;
    if strictly_after || elapsed_ms % interval_ms != 0 {
        slots += 1;
    }
    anchor + chrono::Duration::milliseconds(slots.saturating_mul(interval_ms))
}

/// Serializable schedule information.
#[derive(Debug, Clone, Serialize)]
pub struct TriggerScheduleInfo {
    #[serde(rename = "type")]
    pub schedule_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchor: Option<String>,
}

impl From<&TriggerSchedule> for TriggerScheduleInfo {
    fn from(schedule: &TriggerSchedule) -> Self {
        match schedule {
            TriggerSchedule::At(time) => TriggerScheduleInfo {
                schedule_type: "at".to_string(),
                at: Some(time.to_rfc3339()),
                interval_ms: None,
                anchor: None,
            },
            TriggerSchedule::Every { interval, anchor } => TriggerScheduleInfo {
                schedule_type: "every".to_string(),
                at: None,
                interval_ms: Some(interval.as_millis() as u64),
                anchor: Some(anchor.to_rfc3339()),
            },
        }
    }
}
