use super::error::WorkUnitError;
use super::handle::{JobHandle, JobId};
use super::output::OutputStream;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Granularity of cancellation checks inside [`JobContext::sleep`].
const SLEEP_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Context provided to a work unit while it runs.
///
/// It is the unit's only way to produce output and to observe stop
/// requests. Cancellation is cooperative: long-running units should call
/// [`JobContext::checkpoint`] (or check [`JobContext::is_cancelled`])
/// between steps. A unit that never checks runs to completion.
#[derive(Clone)]
pub struct JobContext {
    handle: Arc<JobHandle>,
}

impl JobContext {
    pub(crate) fn new(handle: Arc<JobHandle>) -> Self {
        Self { handle }
    }

    pub fn job_id(&self) -> JobId {
        self.handle.id()
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.handle.cancel_token().is_cancelled()
    }

    /// Yield point: returns `Err(WorkUnitError::Cancelled)` once a stop was
    /// requested, so units can bail out with `?`.
    pub fn checkpoint(&self) -> Result<(), WorkUnitError> {
        if self.is_cancelled() {
            Err(WorkUnitError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Write a record to the output stream.
    pub fn emit(&self, text: impl Into<String>) {
        self.write(OutputStream::Output, text);
    }

    /// Write a record to the error stream.
    pub fn emit_error(&self, text: impl Into<String>) {
        self.write(OutputStream::Error, text);
    }

    /// Write a record to the informational stream.
    pub fn emit_info(&self, text: impl Into<String>) {
        self.write(OutputStream::Info, text);
    }

    pub fn write(&self, stream: OutputStream, text: impl Into<String>) {
        if !self.handle.append(stream, text) {
            debug!(
                "Dropped {} record for job {}: output already frozen",
                stream.as_str(),
                self.handle.id()
            );
        }
    }

    /// Block the worker for `duration`, waking early if the job is stopped.
    pub fn sleep(&self, duration: Duration) -> Result<(), WorkUnitError> {
        let deadline = Instant::now() + duration;
        loop {
            self.checkpoint()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep(SLEEP_POLL_INTERVAL.min(deadline - now));
        }
    }
}
