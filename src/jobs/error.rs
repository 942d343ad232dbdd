use super::handle::{JobId, JobState};
use thiserror::Error;

/// Errors returned by registry and scheduler operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Trigger not found: {0}")]
    TriggerNotFound(String),

    #[error("Invalid state transition for job {id}: {from} -> {to}")]
    InvalidStateTransition {
        id: JobId,
        from: JobState,
        to: JobState,
    },

    #[error("Job {id} is already {state}")]
    AlreadyTerminal { id: JobId, state: JobState },

    #[error("Job {id} is still {state}")]
    NotTerminal { id: JobId, state: JobState },

    #[error("Scheduler misconfiguration: {0}")]
    SchedulerMisconfiguration(String),

    #[error("Trigger already registered: {0}")]
    DuplicateTrigger(String),

    #[error("Trigger {trigger} could not build its work unit: {message}")]
    UnitFactoryPanicked { trigger: String, message: String },

    #[error("Job registry is shutting down")]
    ShuttingDown,
}

impl JobError {
    /// True for the errors that reject an operation because of the job's
    /// current lifecycle state.
    pub fn is_invalid_state_transition(&self) -> bool {
        matches!(
            self,
            JobError::InvalidStateTransition { .. }
                | JobError::AlreadyTerminal { .. }
                | JobError::NotTerminal { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, JobError::JobNotFound(_) | JobError::TriggerNotFound(_))
    }
}

/// Errors a work unit reports back to the executor.
///
/// These never escape the registry: they only move the job into `Failed`
/// (or `Stopped` for [`WorkUnitError::Cancelled`]).
#[derive(Debug, Error)]
pub enum WorkUnitError {
    #[error("{0}")]
    Failed(String),

    #[error("Job was cancelled")]
    Cancelled,
}

impl WorkUnitError {
    pub fn failed(message: impl Into<String>) -> Self {
        WorkUnitError::Failed(message.into())
    }
}

impl From<std::io::Error> for WorkUnitError {
    fn from(e: std::io::Error) -> Self {
        WorkUnitError::Failed(format!("IO error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_state_transition_grouping() {
        let id = JobId::new(7);
        assert!(JobError::NotTerminal {
            id,
            state: JobState::Running
        }
        .is_invalid_state_transition());
        assert!(JobError::AlreadyTerminal {
            id,
            state: JobState::Completed
        }
        .is_invalid_state_transition());
        assert!(!JobError::JobNotFound(id).is_invalid_state_transition());
        assert!(JobError::JobNotFound(id).is_not_found());
        assert!(JobError::TriggerNotFound("t".to_string()).is_not_found());
    }

    #[test]
    fn test_error_messages() {
        let err = JobError::AlreadyTerminal {
            id: JobId::new(3),
            state: JobState::Failed,
        };
        assert_eq!(err.to_string(), "Job 3 is already failed");

        let err = WorkUnitError::failed("boom");
        assert_eq!(err.to_string(), "boom");
    }
}
