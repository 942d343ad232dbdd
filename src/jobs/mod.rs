//! Job execution and lifecycle management.
//!
//! A [`JobRegistry`] accepts [`WorkUnit`]s, hands them to the [`Executor`]
//! and keeps a [`JobHandle`] per submission so callers can query, wait on,
//! read output from, stop and remove jobs.

mod command;
mod context;
mod error;
mod executor;
mod handle;
mod output;
mod registry;
mod work_unit;

pub use command::CommandUnit;
pub use context::JobContext;
pub use error::{JobError, WorkUnitError};
pub use executor::{Executor, WorkerMode};
pub(crate) use executor::panic_message;
pub use handle::{JobHandle, JobId, JobInfo, JobState};
pub use output::{OutputBuffer, OutputRecord, OutputStream, ReceiveMode};
pub use registry::JobRegistry;
pub use work_unit::{FnUnit, WorkUnit};
