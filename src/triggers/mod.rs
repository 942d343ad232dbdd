//! Timed and recurring triggers.
//!
//! A [`TriggerScheduler`] loop watches registered [`TriggerDefinition`]s and,
//! when one is due, submits a fresh work unit through the same
//! [`JobRegistry`](crate::jobs::JobRegistry) path callers use.

mod handle;
mod schedule;
mod scheduler;
mod trigger;

pub use handle::SchedulerHandle;
pub use schedule::{TriggerSchedule, TriggerScheduleInfo};
pub use scheduler::{create_scheduler, SchedulerSettings, TriggerScheduler};
pub use trigger::{TriggerDefinition, TriggerInfo, TriggerState, WorkUnitFactory};
