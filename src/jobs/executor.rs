use super::context::JobContext;
use super::error::WorkUnitError;
use super::handle::{JobHandle, JobState};
use super::work_unit::WorkUnit;
use crate::metrics;
use clap::ValueEnum;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Where a job's work unit runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum WorkerMode {
    /// On tokio's blocking thread pool.
    #[default]
    Pooled,
    /// On a dedicated OS thread per job.
    Dedicated,
}

impl WorkerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerMode::Pooled => "pooled",
            WorkerMode::Dedicated => "dedicated",
        }
    }
}

/// Runs work units and drives their job's state transitions.
#[derive(Debug, Clone, Copy, Default)]
pub struct Executor {
    mode: WorkerMode,
}

/// What came back from the worker: the unit's own result, or a message
/// describing why the worker died.
type WorkerOutcome = Result<Result<(), WorkUnitError>, String>;

impl Executor {
    pub fn new(mode: WorkerMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> WorkerMode {
        self.mode
    }

    /// Start executing `unit` for `handle`. Returns immediately; the
    /// returned task finishes once the job is terminal.
    pub fn spawn(&self, handle: Arc<JobHandle>, unit: Box<dyn WorkUnit>) -> JoinHandle<()> {
        let mode = self.mode;
        tokio::spawn(async move { run_job(mode, handle, unit).await })
    }
}

async fn run_job(mode: WorkerMode, handle: Arc<JobHandle>, unit: Box<dyn WorkUnit>) {
    let job_id = handle.id();

    if handle.is_stop_requested() {
        info!("Job {} ({}) stopped before it started", job_id, handle.name());
        match handle.finish(JobState::Stopped, None) {
            Ok(()) => metrics::record_job_finished("stopped", Default::default(), false),
            Err(e) => warn!("Could not stop job {}: {}", job_id, e),
        }
        return;
    }

    if let Err(e) = handle.mark_running() {
        error!("Could not start job {}: {}", job_id, e);
        return;
    }
    metrics::record_job_started();
    info!(
        "Starting job: {} ({}, worker: {}, triggered_by: {})",
        job_id,
        handle.name(),
        mode.as_str(),
        handle.triggered_by()
    );

    let ctx = JobContext::new(Arc::clone(&handle));
    let start_time = Instant::now();
    let outcome = match mode {
        WorkerMode::Pooled => run_pooled(unit, ctx).await,
        WorkerMode::Dedicated => run_dedicated(unit, ctx, job_id.as_u64()).await,
    };
    let elapsed = start_time.elapsed();

    let (state, failure, status_label) = match outcome {
        Ok(Ok(())) => {
            info!("Job {} completed successfully in {:?}", job_id, elapsed);
            (JobState::Completed, None, "completed")
        }
        Ok(Err(WorkUnitError::Cancelled)) => {
            info!("Job {} was stopped after {:?}", job_id, elapsed);
            (JobState::Stopped, None, "stopped")
        }
        Ok(Err(WorkUnitError::Failed(msg))) => {
            error!("Job {} failed after {:?}: {}", job_id, elapsed, msg);
            (JobState::Failed, Some(msg), "failed")
        }
        Err(msg) => {
            error!("Job {} panicked after {:?}: {}", job_id, elapsed, msg);
            (JobState::Failed, Some(msg), "panic")
        }
    };

    if let Err(e) = handle.finish(state, failure) {
        error!("Could not record end of job {}: {}", job_id, e);
    }
    metrics::record_job_finished(status_label, elapsed, true);
}

async fn run_pooled(unit: Box<dyn WorkUnit>, ctx: JobContext) -> WorkerOutcome {
    tokio::task::spawn_blocking(move || unit.invoke(&ctx))
        .await
        .map_err(|e| format!("Task panic: {}", e))
}

async fn run_dedicated(unit: Box<dyn WorkUnit>, ctx: JobContext, job_id: u64) -> WorkerOutcome {
    let (tx, rx) = oneshot::channel();
    std::thread::Builder::new()
        .name(format!("job-{}", job_id))
        .spawn(move || {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| unit.invoke(&ctx)));
            let _ = tx.send(result.map_err(|payload| panic_message(payload.as_ref())));
        })
        .map_err(|e| format!("Failed to spawn worker thread: {}", e))?;

    rx.await
        .map_err(|_| "Worker thread exited without reporting a result".to_string())?
        .map_err(|msg| format!("Task panic: {}", msg))
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{FnUnit, JobId, ReceiveMode};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn new_handle(id: u64) -> Arc<JobHandle> {
        Arc::new(JobHandle::new(
            JobId::new(id),
            "executor-test",
            "manual",
            CancellationToken::new(),
        ))
    }

    async fn execute(mode: WorkerMode, unit: impl WorkUnit + 'static) -> Arc<JobHandle> {
        let handle = new_handle(1);
        Executor::new(mode)
            .spawn(handle.clone(), Box::new(unit))
            .await
            .unwrap();
        handle
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_completed_job_in_both_modes() {
        for mode in [WorkerMode::Pooled, WorkerMode::Dedicated] {
            let handle = execute(
                mode,
                FnUnit::new("ok", |ctx: &JobContext| {
                    ctx.emit("hello");
                    Ok(())
                }),
            )
            .await;

            assert_eq!(handle.state(), JobState::Completed, "mode {:?}", mode);
            assert!(handle.started_at().is_some());
            assert!(handle.ended_at().is_some());
            let records = handle.output().read(ReceiveMode::Keep);
            assert_eq!(records[0].text, "hello");
            assert!(handle.output().is_frozen());
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failure_is_captured() {
        let handle = execute(
            WorkerMode::Pooled,
            FnUnit::new("fails", |ctx: &JobContext| {
                ctx.emit("partial");
                Err(WorkUnitError::failed("boom"))
            }),
        )
        .await;

        assert_eq!(handle.state(), JobState::Failed);
        assert_eq!(handle.failure().as_deref(), Some("boom"));
        assert_eq!(handle.output().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_panic_marks_job_failed() {
        for mode in [WorkerMode::Pooled, WorkerMode::Dedicated] {
            let handle = execute(
                mode,
                FnUnit::new("panics", |_ctx: &JobContext| -> Result<(), WorkUnitError> {
                    panic!("kaboom")
                }),
            )
            .await;

            assert_eq!(handle.state(), JobState::Failed, "mode {:?}", mode);
            let failure = handle.failure().unwrap();
            assert!(failure.contains("panic"), "failure was {}", failure);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stop_before_start() {
        let handle = new_handle(2);
        handle.request_stop().unwrap();

        Executor::new(WorkerMode::Pooled)
            .spawn(
                handle.clone(),
                Box::new(FnUnit::new("never", |_ctx: &JobContext| {
                    panic!("must not run")
                })),
            )
            .await
            .unwrap();

        assert_eq!(handle.state(), JobState::Stopped);
        assert!(handle.started_at().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cooperative_stop_while_running() {
        let handle = new_handle(3);
        let task = Executor::new(WorkerMode::Dedicated).spawn(
            handle.clone(),
            Box::new(FnUnit::new("loops", |ctx: &JobContext| loop {
                ctx.sleep(Duration::from_millis(5))?;
            })),
        );

        while handle.state() != JobState::Running {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.request_stop().unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(handle.state(), JobState::Stopped);
        assert!(handle.failure().is_none());
    }

    #[test]
    fn test_worker_mode_parsing() {
        assert_eq!(
            WorkerMode::from_str("pooled", true).unwrap(),
            WorkerMode::Pooled
        );
        assert_eq!(
            WorkerMode::from_str("DEDICATED", true).unwrap(),
            WorkerMode::Dedicated
        );
        assert!(WorkerMode::from_str("process", true).is_err());
        assert_eq!(WorkerMode::default(), WorkerMode::Pooled);
    }
}
