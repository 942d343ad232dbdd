use super::schedule::{TriggerSchedule, TriggerScheduleInfo};
use crate::jobs::{JobId, WorkUnit};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// Produces a fresh work unit for every fire.
pub type WorkUnitFactory = Arc<dyn Fn() -> Box<dyn WorkUnit> + Send + Sync>;

/// Where a trigger is in its firing lifecycle.
///
/// `Idle -> Armed -> (fire) -> Armed` for recurring rules, and
/// `Idle -> Armed -> (fire) -> Retired` for one-shots. Disabled triggers
/// are `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerState {
    Idle,
    Armed,
    Retired,
}

/// A timed rule that submits a new job each time it fires.
#[derive(Clone)]
pub struct TriggerDefinition {
    pub id: String,
    pub schedule: TriggerSchedule,
    pub factory: WorkUnitFactory,
    pub enabled: bool,
}

impl TriggerDefinition {
    pub fn new<F>(id: impl Into<String>, schedule: TriggerSchedule, factory: F) -> Self
    where
        F: Fn() -> Box<dyn WorkUnit> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            schedule,
            factory: Arc::new(factory),
            enabled: true,
        }
    }

    /// Register the trigger without arming it.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

impl std::fmt::Debug for TriggerDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerDefinition")
            .field("id", &self.id)
            .field("schedule", &self.schedule)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// Serializable trigger information.
#[derive(Debug, Clone, Serialize)]
pub struct TriggerInfo {
    pub id: String,
    pub schedule: TriggerScheduleInfo,
    pub enabled: bool,
    pub state: TriggerState,
    pub next_fire_at: Option<String>,
    pub last_fired_at: Option<String>,
    pub fire_count: u64,
    pub last_job_id: Option<JobId>,
}

/// A registered definition plus its firing bookkeeping.
pub(crate) struct TriggerEntry {
    definition: TriggerDefinition,
    state: TriggerState,
    next_fire_at: Option<DateTime<Utc>>,
    last_fired_at: Option<DateTime<Utc>>,
    fire_count: u64,
    last_job_id: Option<JobId>,
}

impl TriggerEntry {
    pub(crate) fn new(definition: TriggerDefinition, now: DateTime<Utc>) -> Self {
        let mut entry = Self {
            definition,
            state: TriggerState::Idle,
            next_fire_at: None,
            last_fired_at: None,
            fire_count: 0,
            last_job_id: None,
        };
        entry.arm(now);
        entry
    }

    pub(crate) fn id(&self) -> &str {
        &self.definition.id
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.definition.enabled
    }

    pub(crate) fn next_fire_at(&self) -> Option<DateTime<Utc>> {
        match self.state {
            TriggerState::Armed => self.next_fire_at,
            _ => None,
        }
    }

    /// Recompute the state and next fire time from the definition.
    fn arm(&mut self, now: DateTime<Utc>) {
        // A spent one-shot stays spent
        if self.state == TriggerState::Retired {
            return;
        }
        if !self.definition.enabled {
            self.state = TriggerState::Idle;
            self.next_fire_at = None;
            return;
        }
        self.state = TriggerState::Armed;
        self.next_fire_at = Some(self.definition.schedule.first_fire_at(now));
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool, now: DateTime<Utc>) {
        self.definition.enabled = enabled;
        self.arm(now);
    }

    pub(crate) fn factory(&self) -> WorkUnitFactory {
        Arc::clone(&self.definition.factory)
    }

    /// If the trigger is due at `now`, advance its schedule and return the
    /// factory for the unit to submit. At most one fire per call.
    pub(crate) fn take_due(&mut self, now: DateTime<Utc>) -> Option<WorkUnitFactory> {
        let due = self.definition.enabled
            && self.state == TriggerState::Armed
            && self.next_fire_at.is_some_and(|next| next <= now);
        if !due {
            return None;
        }

        match self.definition.schedule.next_fire_after(now) {
            Some(next) => self.next_fire_at = Some(next),
            None => {
                self.state = TriggerState::Retired;
                self.next_fire_at = None;
            }
        }
        Some(self.factory())
    }

    pub(crate) fn record_fire(&mut self, at: DateTime<Utc>, job_id: JobId) {
        self.fire_count += 1;
        self.last_fired_at = Some(at);
        self.last_job_id = Some(job_id);
    }

    pub(crate) fn info(&self) -> TriggerInfo {
        TriggerInfo {
            id: self.definition.id.clone(),
            schedule: TriggerScheduleInfo::from(&self.definition.schedule),
            enabled: self.definition.enabled,
            state: self.state,
            next_fire_at: self.next_fire_at().map(|dt| dt.to_rfc3339()),
            last_fired_at: self.last_fired_at.map(|dt| dt.to_rfc3339()),
            fire_count: self.fire_count,
            last_job_id: self.last_job_id,
        }
    }
}
