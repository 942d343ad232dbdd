use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Which stream an output record was written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Output,
    Error,
    Info,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Output => "output",
            OutputStream::Error => "error",
            OutputStream::Info => "info",
        }
    }
}

/// A single record produced by a running job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRecord {
    pub stream: OutputStream,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// How a read should treat the records it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveMode {
    /// Leave the records in the buffer for a later read.
    Keep,
    /// Remove the returned records from the buffer.
    Drain,
}

#[derive(Default)]
struct BufferState {
    records: Vec<OutputRecord>,
    frozen: bool,
}

/// Ordered, append-only sink for a job's output.
///
/// Only the job's own worker appends; once the job reaches a terminal state
/// the buffer is frozen and further appends are rejected.
#[derive(Default)]
pub struct OutputBuffer {
    state: Mutex<BufferState>,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    // Every critical section leaves the state consistent, so a poisoned
    // lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a record. Returns false if the buffer is frozen.
    pub fn push(&self, stream: OutputStream, text: impl Into<String>) -> bool {
        let mut state = self.lock();
        if state.frozen {
            return false;
        }
        state.records.push(OutputRecord {
            stream,
            text: text.into(),
            at: Utc::now(),
        });
        true
    }

    /// Return the current contents, removing them if `mode` is `Drain`.
    pub fn read(&self, mode: ReceiveMode) -> Vec<OutputRecord> {
        let mut state = self.lock();
        match mode {
            ReceiveMode::Keep => state.records.clone(),
            ReceiveMode::Drain => std::mem::take(&mut state.records),
        }
    }

    pub fn freeze(&self) {
        self.lock().frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.lock().frozen
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for OutputBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("OutputBuffer")
            .field("records", &state.records.len())
            .field("frozen", &state.frozen)
            .finish()
    }
}
