use super::error::JobError;
use super::executor::{Executor, WorkerMode};
use super::handle::{JobHandle, JobId, JobState};
use super::output::{OutputRecord, ReceiveMode};
use super::work_unit::WorkUnit;
use crate::metrics;
use futures::future::{join_all, select_all};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Trigger label for jobs submitted directly by a caller.
pub const MANUAL_TRIGGER: &str = "manual";

struct JobEntry {
    handle: Arc<JobHandle>,
    /// Task driving the job; taken during shutdown.
    worker: Option<JoinHandle<()>>,
}

struct RegistryInner {
    /// Jobs keyed by id. Ids are handed out in increasing order, so
    /// iteration order is submission order.
    jobs: RwLock<BTreeMap<JobId, JobEntry>>,
    next_id: AtomicU64,
    executor: Executor,
    /// Parent of every job's cancellation token; cancelled on shutdown.
    shutdown_token: CancellationToken,
}

/// Table of live jobs and the entry point for every job operation.
///
/// Cloning is cheap and all clones share the same table. Separate
/// registries are fully independent.
#[derive(Clone)]
pub struct JobRegistry {
    inner: Arc<RegistryInner>,
}

impl JobRegistry {
    pub fn new(worker_mode: WorkerMode) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                jobs: RwLock::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
                executor: Executor::new(worker_mode),
                shutdown_token: CancellationToken::new(),
            }),
        }
    }

    pub fn worker_mode(&self) -> WorkerMode {
        self.inner.executor.mode()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown_token.is_cancelled()
    }

    /// Submit a unit of work. Returns as soon as the job is registered.
    pub async fn submit<W: WorkUnit + 'static>(&self, unit: W) -> Result<Arc<JobHandle>, JobError> {
        self.submit_boxed(Box::new(unit), MANUAL_TRIGGER).await
    }

    /// Submit an already boxed unit, recording who triggered it.
    pub async fn submit_boxed(
        &self,
        unit: Box<dyn WorkUnit>,
        triggered_by: &str,
    ) -> Result<Arc<JobHandle>, JobError> {
        if self.is_shutting_down() {
            return Err(JobError::ShuttingDown);
        }

        let mut jobs = self.inner.jobs.write().await;
        // Checked again under the lock: shutdown flips the token while
        // holding it, so no job can slip in after shutdown collected workers.
        if self.is_shutting_down() {
            return Err(JobError::ShuttingDown);
        }

        let id = JobId::new(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let handle = Arc::new(JobHandle::new(
            id,
            unit.name(),
            triggered_by,
            self.inner.shutdown_token.child_token(),
        ));
        let worker = self.inner.executor.spawn(Arc::clone(&handle), unit);
        jobs.insert(
            id,
            JobEntry {
                handle: Arc::clone(&handle),
                worker: Some(worker),
            },
        );
        drop(jobs);

        metrics::record_job_submitted();
        debug!(
            "Submitted job {} ({}, triggered_by: {})",
            id,
            handle.name(),
            triggered_by
        );
        Ok(handle)
    }

    pub async fn get(&self, id: JobId) -> Result<Arc<JobHandle>, JobError> {
        let jobs = self.inner.jobs.read().await;
        jobs.get(&id)
            .map(|entry| Arc::clone(&entry.handle))
            .ok_or(JobError::JobNotFound(id))
    }

    /// Snapshot of all jobs in submission order.
    pub async fn list(&self) -> Vec<Arc<JobHandle>> {
        let jobs = self.inner.jobs.read().await;
        jobs.values().map(|entry| Arc::clone(&entry.handle)).collect()
    }

    pub async fn list_by_state(&self, state: JobState) -> Vec<Arc<JobHandle>> {
        self.list()
            .await
            .into_iter()
            .filter(|handle| handle.state() == state)
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn handles_for(&self, ids: &[JobId]) -> Result<Vec<Arc<JobHandle>>, JobError> {
        let jobs = self.inner.jobs.read().await;
        ids.iter()
            .map(|id| {
                jobs.get(id)
                    .map(|entry| Arc::clone(&entry.handle))
                    .ok_or(JobError::JobNotFound(*id))
            })
            .collect()
    }

    fn terminal_ids(handles: &[Arc<JobHandle>]) -> BTreeSet<JobId> {
        handles
            .iter()
            .filter(|handle| handle.state().is_terminal())
            .map(|handle| handle.id())
            .collect()
    }

    /// Wait until every job in `ids` is terminal or `timeout` elapses.
    ///
    /// Returns the ids that reached a terminal state. Jobs still running at
    /// the deadline are simply left out; unknown ids fail the call before
    /// any waiting happens.
    pub async fn wait(
        &self,
        ids: &[JobId],
        timeout: Duration,
    ) -> Result<BTreeSet<JobId>, JobError> {
        let handles = self.handles_for(ids).await?;
        let all_done = join_all(handles.iter().map(|handle| handle.wait_terminal()));
        if tokio::time::timeout(timeout, all_done).await.is_err() {
            debug!("Wait on {} jobs timed out after {:?}", ids.len(), timeout);
        }
        Ok(Self::terminal_ids(&handles))
    }

    /// Wait until at least one job in `ids` is terminal or `timeout` elapses.
    pub async fn wait_any(
        &self,
        ids: &[JobId],
        timeout: Duration,
    ) -> Result<BTreeSet<JobId>, JobError> {
        let handles = self.handles_for(ids).await?;
        if handles.is_empty() {
            return Ok(BTreeSet::new());
        }
        let any_done = select_all(
            handles
                .iter()
                .map(|handle| Box::pin(handle.wait_terminal())),
        );
        let _ = tokio::time::timeout(timeout, any_done).await;
        Ok(Self::terminal_ids(&handles))
    }

    /// Read a job's buffered output. Never waits for new output.
    pub async fn receive(
        &self,
        id: JobId,
        mode: ReceiveMode,
    ) -> Result<Vec<OutputRecord>, JobError> {
        let handle = self.get(id).await?;
        Ok(handle.output().read(mode))
    }

    /// Request cooperative cancellation. Returns once the request is issued;
    /// the job moves to `Stopped` when its worker acknowledges.
    pub async fn stop(&self, id: JobId) -> Result<(), JobError> {
        let handle = self.get(id).await?;
        handle.request_stop()?;
        info!("Stop requested for job {} ({})", id, handle.name());
        Ok(())
    }

    /// Request cancellation of every job that has not finished yet.
    /// Returns the number of jobs signalled.
    pub async fn stop_all(&self) -> usize {
        let mut count = 0;
        for handle in self.list().await {
            if handle.request_stop().is_ok() {
                count += 1;
            }
        }
        if count > 0 {
            info!("Stop requested for {} jobs", count);
        }
        count
    }

    /// Delete a terminal job and release its output.
    pub async fn remove(&self, id: JobId) -> Result<(), JobError> {
        let mut jobs = self.inner.jobs.write().await;
        let state = jobs
            .get(&id)
            .map(|entry| entry.handle.state())
            .ok_or(JobError::JobNotFound(id))?;
        if !state.is_terminal() {
            return Err(JobError::NotTerminal { id, state });
        }
        jobs.remove(&id);
        debug!("Removed job {}", id);
        Ok(())
    }

    /// Delete every terminal job, returning the removed ids.
    pub async fn remove_finished(&self) -> Vec<JobId> {
        let mut jobs = self.inner.jobs.write().await;
        let finished: Vec<JobId> = jobs
            .values()
            .filter(|entry| entry.handle.state().is_terminal())
            .map(|entry| entry.handle.id())
            .collect();
        for id in &finished {
            jobs.remove(id);
        }
        finished
    }

    /// Stop accepting work, stop every job and wait up to `grace` for the
    /// workers to exit. Jobs stay in the table so their final state and
    /// output remain readable.
    pub async fn shutdown(&self, grace: Duration) {
        let workers: Vec<JoinHandle<()>> = {
            let mut jobs = self.inner.jobs.write().await;
            self.inner.shutdown_token.cancel();
            jobs.values_mut()
                .filter_map(|entry| entry.worker.take())
                .collect()
        };

        info!(
            "Shutting down job registry, waiting for {} workers...",
            workers.len()
        );
        if tokio::time::timeout(grace, join_all(workers)).await.is_err() {
            warn!(
                "Some jobs did not finish within {:?}; leaving them behind",
                grace
            );
        }
        info!("Job registry shutdown complete");
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("worker_mode", &self.worker_mode())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}
