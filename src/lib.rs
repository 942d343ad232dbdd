//! jobhost library
//!
//! Background job execution: a registry of asynchronously running jobs with
//! buffered output, cooperative cancellation and timed triggers.

pub mod config;
pub mod jobs;
pub mod metrics;
pub mod triggers;

// Re-export commonly used types for convenience
pub use jobs::{
    CommandUnit, FnUnit, JobContext, JobError, JobHandle, JobId, JobInfo, JobRegistry, JobState,
    OutputRecord, OutputStream, ReceiveMode, WorkUnit, WorkUnitError, WorkerMode,
};
pub use triggers::{
    create_scheduler, SchedulerHandle, SchedulerSettings, TriggerDefinition, TriggerInfo,
    TriggerSchedule, TriggerScheduler, TriggerState,
};
