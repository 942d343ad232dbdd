use super::error::JobError;
use super::output::{OutputBuffer, OutputStream};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Process-unique job identifier. Never reused within a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct JobId(u64);

impl JobId {
    pub fn new(id: u64) -> Self {
        JobId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    NotStarted,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Stopped
        )
    }

    /// Transitions only move forward: `NotStarted -> Running -> terminal`,
    /// plus `NotStarted -> Stopped` for jobs cancelled before they started.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        match (self, next) {
            (JobState::NotStarted, JobState::Running) => true,
            (JobState::NotStarted, JobState::Stopped) => true,
            (JobState::Running, next) => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::NotStarted => "not_started",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Serializable summary of a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: JobId,
    pub name: String,
    pub triggered_by: String,
    pub state: JobState,
    pub created_at: String,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub failure: Option<String>,
    pub has_more_data: bool,
}

struct JobStatus {
    state: JobState,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    failure: Option<String>,
}

/// The record of one job: identity, state, timestamps and output.
pub struct JobHandle {
    id: JobId,
    name: String,
    triggered_by: String,
    created_at: DateTime<Utc>,
    status: Mutex<JobStatus>,
    state_tx: watch::Sender<JobState>,
    output: OutputBuffer,
    cancel_token: CancellationToken,
}

impl JobHandle {
    pub(crate) fn new(
        id: JobId,
        name: impl Into<String>,
        triggered_by: impl Into<String>,
        cancel_token: CancellationToken,
    ) -> Self {
        let (state_tx, _) = watch::channel(JobState::NotStarted);
        Self {
            id,
            name: name.into(),
            triggered_by: triggered_by.into(),
            created_at: Utc::now(),
            status: Mutex::new(JobStatus {
                state: JobState::NotStarted,
                started_at: None,
                ended_at: None,
                failure: None,
            }),
            state_tx,
            output: OutputBuffer::new(),
            cancel_token,
        }
    }

    fn status(&self) -> MutexGuard<'_, JobStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn triggered_by(&self) -> &str {
        &self.triggered_by
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> JobState {
        self.status().state
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.status().started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.status().ended_at
    }

    /// The captured error, set only in the `Failed` state.
    pub fn failure(&self) -> Option<String> {
        self.status().failure.clone()
    }

    /// Read access to the job's output. Appends go through [`JobContext`].
    ///
    /// [`JobContext`]: super::JobContext
    pub fn output(&self) -> &OutputBuffer {
        &self.output
    }

    /// True while the buffer holds records nobody has drained yet.
    pub fn has_more_data(&self) -> bool {
        !self.output.is_empty()
    }

    pub fn is_stop_requested(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    pub(crate) fn append(&self, stream: OutputStream, text: impl Into<String>) -> bool {
        self.output.push(stream, text)
    }

    /// Ask the worker to stop. Fails if the job already finished.
    pub(crate) fn request_stop(&self) -> Result<(), JobError> {
        let status = self.status();
        if status.state.is_terminal() {
            return Err(JobError::AlreadyTerminal {
                id: self.id,
                state: status.state,
            });
        }
        self.cancel_token.cancel();
        Ok(())
    }

    pub(crate) fn mark_running(&self) -> Result<(), JobError> {
        self.transition(JobState::Running, None)
    }

    pub(crate) fn finish(&self, state: JobState, failure: Option<String>) -> Result<(), JobError> {
        self.transition(state, failure)
    }

    fn transition(&self, next: JobState, failure: Option<String>) -> Result<(), JobError> {
        {
            let mut status = self.status();
            if !status.state.can_transition_to(next) {
                return Err(JobError::InvalidStateTransition {
                    id: self.id,
                    from: status.state,
                    to: next,
                });
            }
            let now = Utc::now();
            status.state = next;
            if next == JobState::Running {
                status.started_at = Some(now);
            }
            if next.is_terminal() {
                status.ended_at = Some(now);
            }
            if next == JobState::Failed {
                status.failure = failure;
            }
        }

        if next.is_terminal() {
            self.output.freeze();
        }
        self.state_tx.send_replace(next);
        Ok(())
    }

    /// Resolve once the job reaches a terminal state.
    pub async fn wait_terminal(&self) {
        let mut rx = self.state_tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail
        let _ = rx.wait_for(|state| state.is_terminal()).await;
    }

    pub fn info(&self) -> JobInfo {
        let status = self.status();
        JobInfo {
            id: self.id,
            name: self.name.clone(),
            triggered_by: self.triggered_by.clone(),
            state: status.state,
            created_at: self.created_at.to_rfc3339(),
            started_at: status.started_at.map(|dt| dt.to_rfc3339()),
            ended_at: status.ended_at.map(|dt| dt.to_rfc3339()),
            failure: status.failure.clone(),
            has_more_data: self.has_more_data(),
        }
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}
