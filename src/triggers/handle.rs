use super::trigger::{TriggerDefinition, TriggerEntry, TriggerInfo, WorkUnitFactory};
use crate::jobs::{panic_message, JobError, JobHandle, JobRegistry, WorkUnit};
use crate::metrics;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info};

/// Command sent to the scheduler loop.
pub enum SchedulerCommand {
    /// Definitions changed; recompute the next wake-up.
    Reschedule,
}

/// Shared state between scheduler and handle.
pub struct SharedTriggerState {
    /// Registered triggers keyed by id; iteration is ascending id order.
    pub(crate) triggers: BTreeMap<String, TriggerEntry>,
}

/// Call a trigger's factory. Must not be called with the trigger table
/// locked; a panicking factory becomes an error.
fn build_unit(trigger_id: &str, factory: &WorkUnitFactory) -> Result<Box<dyn WorkUnit>, JobError> {
    std::panic::catch_unwind(AssertUnwindSafe(|| factory())).map_err(|payload| {
        JobError::UnitFactoryPanicked {
            trigger: trigger_id.to_string(),
            message: panic_message(payload.as_ref()),
        }
    })
}

/// Build a unit with trigger `trigger_id`'s factory, submit it and record
/// the fire.
pub(crate) async fn submit_fire(
    registry: &JobRegistry,
    shared_state: &RwLock<SharedTriggerState>,
    trigger_id: &str,
    factory: WorkUnitFactory,
    fired_at: DateTime<Utc>,
) -> Result<Arc<JobHandle>, JobError> {
    let unit = match build_unit(trigger_id, &factory) {
        Ok(unit) => unit,
        Err(e) => {
            error!("{}", e);
            return Err(e);
        }
    };

    let triggered_by = format!("trigger:{}", trigger_id);
    let job = match registry.submit_boxed(unit, &triggered_by).await {
        Ok(job) => job,
        Err(e) => {
            error!("Trigger {} could not submit its job: {}", trigger_id, e);
            return Err(e);
        }
    };

    metrics::record_trigger_fired(trigger_id);
    info!("Trigger {} fired, submitted job {}", trigger_id, job.id());

    let mut state = shared_state.write().await;
    if let Some(entry) = state.triggers.get_mut(trigger_id) {
        entry.record_fire(fired_at, job.id());
    }
    Ok(job)
}

/// Handle to register, inspect and control triggers.
#[derive(Clone)]
pub struct SchedulerHandle {
    /// Channel to wake the scheduler loop
    command_tx: mpsc::Sender<SchedulerCommand>,
    /// Shared trigger table
    shared_state: Arc<RwLock<SharedTriggerState>>,
    /// Registry fired jobs are submitted to
    registry: JobRegistry,
}

impl SchedulerHandle {
    pub(crate) fn new(
        command_tx: mpsc::Sender<SchedulerCommand>,
        shared_state: Arc<RwLock<SharedTriggerState>>,
        registry: JobRegistry,
    ) -> Self {
        Self {
            command_tx,
            shared_state,
            registry,
        }
    }

    fn wake_scheduler(&self) {
        // A full channel already holds a pending wake-up
        let _ = self.command_tx.try_send(SchedulerCommand::Reschedule);
    }

    /// Register a trigger and arm it if enabled.
    pub async fn register(&self, definition: TriggerDefinition) -> Result<TriggerInfo, JobError> {
        definition.schedule.validate()?;

        let info = {
            let mut state = self.shared_state.write().await;
            if state.triggers.contains_key(&definition.id) {
                return Err(JobError::DuplicateTrigger(definition.id));
            }
            let entry = TriggerEntry::new(definition, Utc::now());
            let info = entry.info();
            state.triggers.insert(info.id.clone(), entry);
            info
        };

        info!(
            "Registered trigger: {} ({}, next fire: {})",
            info.id,
            info.schedule.schedule_type,
            info.next_fire_at.as_deref().unwrap_or("none")
        );
        self.wake_scheduler();
        Ok(info)
    }

    /// Remove a trigger. Jobs it already submitted are not affected.
    pub async fn unregister(&self, trigger_id: &str) -> Result<(), JobError> {
        let removed = self.shared_state.write().await.triggers.remove(trigger_id);
        match removed {
            Some(_) => {
                info!("Unregistered trigger: {}", trigger_id);
                self.wake_scheduler();
                Ok(())
            }
            None => Err(JobError::TriggerNotFound(trigger_id.to_string())),
        }
    }

    pub async fn enable(&self, trigger_id: &str) -> Result<TriggerInfo, JobError> {
        self.set_enabled(trigger_id, true).await
    }

    /// Stop future fires. Jobs already submitted keep running.
    pub async fn disable(&self, trigger_id: &str) -> Result<TriggerInfo, JobError> {
        self.set_enabled(trigger_id, false).await
    }

    async fn set_enabled(&self, trigger_id: &str, enabled: bool) -> Result<TriggerInfo, JobError> {
        let info = {
            let mut state = self.shared_state.write().await;
            let entry = state
                .triggers
                .get_mut(trigger_id)
                .ok_or_else(|| JobError::TriggerNotFound(trigger_id.to_string()))?;
            entry.set_enabled(enabled, Utc::now());
            entry.info()
        };
        info!(
            "Trigger {} {}",
            trigger_id,
            if enabled { "enabled" } else { "disabled" }
        );
        self.wake_scheduler();
        Ok(info)
    }

    pub async fn get(&self, trigger_id: &str) -> Result<TriggerInfo, JobError> {
        let state = self.shared_state.read().await;
        state
            .triggers
            .get(trigger_id)
            .map(TriggerEntry::info)
            .ok_or_else(|| JobError::TriggerNotFound(trigger_id.to_string()))
    }

    /// All triggers in ascending id order.
    pub async fn list(&self) -> Vec<TriggerInfo> {
        let state = self.shared_state.read().await;
        state.triggers.values().map(TriggerEntry::info).collect()
    }

    pub async fn trigger_exists(&self, trigger_id: &str) -> bool {
        self.shared_state.read().await.triggers.contains_key(trigger_id)
    }

    /// Fire a trigger immediately, regardless of its schedule or enabled
    /// flag. The schedule is left as it was: a pending one-shot still fires
    /// at its time.
    pub async fn fire_now(&self, trigger_id: &str) -> Result<Arc<JobHandle>, JobError> {
        let factory = {
            let state = self.shared_state.read().await;
            state
                .triggers
                .get(trigger_id)
                .map(TriggerEntry::factory)
                .ok_or_else(|| JobError::TriggerNotFound(trigger_id.to_string()))?
        };
        submit_fire(
            &self.registry,
            &self.shared_state,
            trigger_id,
            factory,
            Utc::now(),
        )
        .await
    }
}
