use super::handle::{submit_fire, SchedulerCommand, SchedulerHandle, SharedTriggerState};
use super::trigger::WorkUnitFactory;
use crate::jobs::{JobHandle, JobRegistry};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Tuning for the scheduler loop.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Longest the loop sleeps before re-checking the trigger table.
    pub max_tick: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_tick: Duration::from_secs(60),
        }
    }
}

/// Fires due triggers by submitting their jobs to a [`JobRegistry`].
pub struct TriggerScheduler {
    /// Shared state accessible by SchedulerHandle
    shared_state: Arc<RwLock<SharedTriggerState>>,

    /// Registry fired jobs are submitted to.
    registry: JobRegistry,

    /// Receiver for commands from SchedulerHandle
    command_receiver: mpsc::Receiver<SchedulerCommand>,

    /// Token to signal scheduler shutdown.
    shutdown_token: CancellationToken,

    settings: SchedulerSettings,
}

impl TriggerScheduler {
    fn new(
        shared_state: Arc<RwLock<SharedTriggerState>>,
        registry: JobRegistry,
        command_receiver: mpsc::Receiver<SchedulerCommand>,
        shutdown_token: CancellationToken,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            shared_state,
            registry,
            command_receiver,
            shutdown_token,
            settings,
        }
    }

    /// Get the number of registered triggers.
    pub async fn trigger_count(&self) -> usize {
        self.shared_state.read().await.triggers.len()
    }

    /// Main scheduler loop. Returns once the shutdown token is cancelled.
    pub async fn run(&mut self) {
        let trigger_count = self.trigger_count().await;
        info!(
            "Starting trigger scheduler with {} registered triggers",
            trigger_count
        );

        loop {
            let sleep_duration = self.time_until_next_fire(Utc::now()).await;
            debug!(
                "Scheduler sleeping for {:?} until next trigger",
                sleep_duration
            );

            tokio::select! {
                _ = tokio::time::sleep(sleep_duration) => {
                    self.tick(Utc::now()).await;
                }
                Some(cmd) = self.command_receiver.recv() => {
                    self.handle_command(cmd);
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Scheduler received shutdown signal");
                    break;
                }
            }
        }

        info!("Trigger scheduler stopped");
    }

    fn handle_command(&mut self, cmd: SchedulerCommand) {
        match cmd {
            SchedulerCommand::Reschedule => {
                debug!("Trigger definitions changed, rescheduling");
            }
        }
    }

    /// Calculate how long to sleep before the next trigger is due.
    async fn time_until_next_fire(&self, now: DateTime<Utc>) -> Duration {
        let mut min_duration = self.settings.max_tick;

        let state = self.shared_state.read().await;
        for entry in state.triggers.values() {
            if !entry.is_enabled() {
                continue;
            }
            if let Some(next_fire) = entry.next_fire_at() {
                if next_fire <= now {
                    return Duration::ZERO;
                }
                let duration = (next_fire - now).to_std().unwrap_or(Duration::ZERO);
                if duration < min_duration {
                    min_duration = duration;
                }
            }
        }

        min_duration
    }

    /// Fire every enabled trigger that is due at `now`, in ascending id
    /// order, at most once each. Returns the submitted jobs.
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<Arc<JobHandle>> {
        // Factories run after the lock is released
        let due: Vec<(String, WorkUnitFactory)> = {
            let mut state = self.shared_state.write().await;
            state
                .triggers
                .values_mut()
                .filter_map(|entry| {
                    let factory = entry.take_due(now)?;
                    Some((entry.id().to_string(), factory))
                })
                .collect()
        };

        let mut submitted = Vec::with_capacity(due.len());
        for (trigger_id, factory) in due {
            // Failures are logged by submit_fire; other triggers still fire
            if let Ok(job) =
                submit_fire(&self.registry, &self.shared_state, &trigger_id, factory, now).await
            {
                submitted.push(job);
            }
        }
        submitted
    }
}

/// Create a scheduler and its handle.
pub fn create_scheduler(
    registry: JobRegistry,
    shutdown_token: CancellationToken,
    settings: SchedulerSettings,
) -> (TriggerScheduler, SchedulerHandle) {
    let (command_tx, command_rx) = mpsc::channel(100);
    let shared_state = Arc::new(RwLock::new(SharedTriggerState {
        triggers: BTreeMap::new(),
    }));

    let scheduler = TriggerScheduler::new(
        Arc::clone(&shared_state),
        registry.clone(),
        command_rx,
        shutdown_token,
        settings,
    );

    let handle = SchedulerHandle::new(command_tx, shared_state, registry);

    (scheduler, handle)
}
