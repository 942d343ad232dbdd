//! Common test infrastructure
//!
//! Shared helpers for the end-to-end job and trigger tests. Timing-based
//! scenarios are expressed in multiples of [`UNIT`].

#![allow(dead_code)]

use jobhost::jobs::{FnUnit, JobContext, JobRegistry, OutputRecord, WorkUnitError, WorkerMode};
use std::time::Duration;

/// One scheduling unit for timing-based tests.
pub const UNIT: Duration = Duration::from_millis(100);

pub fn units(n: u32) -> Duration {
    UNIT * n
}

pub fn pooled_registry() -> JobRegistry {
    JobRegistry::new(WorkerMode::Pooled)
}

pub fn dedicated_registry() -> JobRegistry {
    JobRegistry::new(WorkerMode::Dedicated)
}

/// A unit that sleeps for `delay` (honouring stop requests) and then emits
/// `text` on the output stream.
pub fn sleep_then_emit(
    name: &str,
    delay: Duration,
    text: &'static str,
) -> FnUnit<impl Fn(&JobContext) -> Result<(), WorkUnitError> + Send + Sync + 'static> {
    FnUnit::new(name, move |ctx: &JobContext| {
        ctx.sleep(delay)?;
        ctx.emit(text);
        Ok(())
    })
}

/// A unit that loops until it is stopped.
pub fn until_stopped(
    name: &str,
) -> FnUnit<impl Fn(&JobContext) -> Result<(), WorkUnitError> + Send + Sync + 'static> {
    FnUnit::new(name, |ctx: &JobContext| loop {
        ctx.sleep(Duration::from_millis(10))?;
    })
}

pub fn texts(records: &[OutputRecord]) -> Vec<String> {
    records.iter().map(|r| r.text.clone()).collect()
}
