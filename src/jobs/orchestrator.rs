//! Conversion orchestrator: the entry point callers use to start and observe jobs.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bookforge_common::config::RetentionConfig;
use bookforge_common::{Completion, Error, FanOutGroupId, JobFailure, JobKey, JobStatus, Result};
use bookforge_db::models::JobRecord;
use bookforge_db::pool::get_conn;
use bookforge_db::queries::fanout as queue;
use dashmap::{DashMap, DashSet};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;

use super::fanout::{distributed, FanOutJoinCoordinator, FanOutOutcome, FanOutPlan};
use super::progress::ProgressChannel;
use super::store::{JobStore, SweepReport};
use super::worker::{ShutdownReport, WorkItem, WorkerManager};

/// The body of a conversion job.
///
/// Implementations report progress through `progress` and must stop their
/// external operation and return [`JobOutcome::Cancelled`] once it answers
/// `false`.
#[async_trait]
pub trait ConversionJob: Send + Sync + 'static {
    async fn run(&self, progress: &ProgressChannel) -> JobOutcome;
}

/// Terminal result of a job body.
#[derive(Debug)]
pub enum JobOutcome {
    /// Finished; the value is the result path.
    Converted(String),
    /// The external operation failed; the reason is stored verbatim.
    Failed(String),
    Cancelled,
    /// Split into sub-tasks; the coordinator produces the terminal result.
    FanOut(FanOutPlan),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOutcome {
    Started,
    /// A run for this key is in flight; nothing was changed.
    AlreadyActive,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    #[serde(flatten)]
    pub record: JobRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

/// Active records plus worker diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveJobs {
    pub jobs: Vec<JobRecord>,
    pub count: usize,
    pub worker_count: usize,
    pub work_items: Vec<WorkItem>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RecoveryReport {
    pub reaped: usize,
    pub swept: SweepReport,
}

#[derive(Clone)]
pub struct ConversionOrchestrator {
    store: JobStore,
    workers: WorkerManager,
    fanout: FanOutJoinCoordinator,
    /// Keys whose job body runs in this process.
    owned: Arc<DashSet<JobKey>>,
    /// Fan-out jobs this process dispatched to the queue.
    deferred: Arc<DashMap<JobKey, FanOutGroupId>>,
    /// Groups cancelled on shutdown with nothing left running; joined by
    /// [`Self::shutdown`].
    unjoined: Arc<Mutex<Vec<FanOutGroupId>>>,
}

impl ConversionOrchestrator {
    pub fn new(store: JobStore, workers: WorkerManager, fanout: FanOutJoinCoordinator) -> Self {
        let owned: Arc<DashSet<JobKey>> = Arc::new(DashSet::new());
        let deferred: Arc<DashMap<JobKey, FanOutGroupId>> = Arc::new(DashMap::new());
        let unjoined: Arc<Mutex<Vec<FanOutGroupId>>> = Arc::new(Mutex::new(Vec::new()));

        {
            let store = store.clone();
            let owned = owned.clone();
            let deferred = deferred.clone();
            let unjoined = unjoined.clone();
            workers.on_shutdown(move || {
                let keys: Vec<JobKey> = owned.iter().map(|k| k.key().clone()).collect();
                match store.mark_interrupted(&keys) {
                    Ok(n) => tracing::info!(interrupted = n, "Marked active jobs as interrupted"),
                    Err(e) => tracing::error!(error = %e, "Failed to mark active jobs as interrupted"),
                }

                let dispatched: Vec<JobKey> = deferred.iter().map(|e| e.key().clone()).collect();
                for key in dispatched {
                    let Some((_, group_id)) = deferred.remove(&key) else {
                        continue;
                    };
                    match interrupt_dispatched(&store, &key, group_id) {
                        Ok(true) => unjoined.lock().push(group_id),
                        Ok(false) => {}
                        Err(e) => tracing::error!(
                            subject_id = %key.subject_id,
                            %group_id,
                            error = %e,
                            "Failed to cancel dispatched fan-out group"
                        ),
                    }
                }
            });
        }

        Self {
            store,
            workers,
            fanout,
            owned,
            deferred,
            unjoined,
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn workers(&self) -> &WorkerManager {
        &self.workers
    }

    /// Start `job` for `key` unless a run is already in flight.
    ///
    /// Failures of the job itself never surface here; they end up in the
    /// record. Errors are reserved for the store and for shutdown.
    pub fn start_job(&self, key: JobKey, job: Arc<dyn ConversionJob>) -> Result<StartOutcome> {
        if self.workers.is_shutdown_requested() {
            return Err(Error::Conflict("shutdown in progress".into()));
        }
        if !self.store.upsert_starting(&key)? {
            tracing::warn!(
                subject_id = %key.subject_id,
                kind = %key.kind,
                "Conversion already in progress"
            );
            return Ok(StartOutcome::AlreadyActive);
        }
        self.owned.insert(key.clone());
        // A group left from an earlier run of this key is no longer ours to cancel.
        self.deferred.remove(&key);

        let name = format!("{}_conversion_{}", key.kind, key.subject_id);
        let this = self.clone();
        let job_key = key.clone();
        let spawned = self.workers.run(name, move |ctx| async move {
            this.execute(job_key, job, ctx.shutdown).await
        });

        if let Err(e) = spawned {
            return self.abandon_start(&key, e);
        }

        tracing::info!(subject_id = %key.subject_id, kind = %key.kind, "Conversion started");
        Ok(StartOutcome::Started)
    }

    /// Shutdown raced the start and the work item was refused. The record
    /// must not stay active, and the caller gets the refusal.
    fn abandon_start(&self, key: &JobKey, refused: Error) -> Result<StartOutcome> {
        tracing::warn!(subject_id = %key.subject_id, error = %refused, "Job not scheduled");
        self.owned.remove(key);
        self.store
            .complete(key, &Completion::failure(JobFailure::Cancelled))?;
        Err(refused)
    }

    async fn execute(
        self,
        key: JobKey,
        job: Arc<dyn ConversionJob>,
        shutdown: tokio_util::sync::CancellationToken,
    ) -> anyhow::Result<()> {
        let _owned = OwnedKey {
            owned: self.owned.clone(),
            key: key.clone(),
        };
        let channel = ProgressChannel::new(self.store.clone(), key.clone(), shutdown);

        let outcome = AssertUnwindSafe(job.run(&channel))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| JobOutcome::Failed("conversion job panicked".into()));

        let completion = match outcome {
            JobOutcome::Converted(path) => Completion::success(path),
            JobOutcome::Failed(reason) => {
                Completion::failure(JobFailure::ExternalOperationFailed(reason))
            }
            JobOutcome::Cancelled => Completion::failure(JobFailure::Cancelled),
            JobOutcome::FanOut(plan) => match self.fanout.run(&key, plan, &channel).await {
                FanOutOutcome::Finished(completion) => completion,
                FanOutOutcome::Deferred(group_id) => {
                    self.deferred.insert(key.clone(), group_id);
                    // Shutdown may have swept `deferred` before the insert.
                    if self.workers.is_shutdown_requested() {
                        if let Some((_, group_id)) = self.deferred.remove(&key) {
                            if interrupt_dispatched(&self.store, &key, group_id)? {
                                distributed::join_settled(
                                    &self.store,
                                    self.fanout.registry(),
                                    group_id,
                                    "shutdown",
                                )
                                .await?;
                            }
                        }
                    }
                    return Ok(());
                }
            },
        };

        self.store.complete(&key, &completion)?;
        Ok(())
    }

    /// Never fails: store errors are logged and reported as `NotStarted`.
    pub fn get_status(&self, key: &JobKey) -> StatusReport {
        let record = match self.store.get(key) {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(subject_id = %key.subject_id, error = %e, "Failed to read job status");
                JobRecord::not_started(key)
            }
        };
        let download_url = (record.status == JobStatus::Completed)
            .then(|| key.kind.download_path(&key.subject_id));
        StatusReport {
            record,
            download_url,
        }
    }

    pub fn list_active(&self) -> Result<ActiveJobs> {
        let jobs = self.store.list_active()?;
        Ok(ActiveJobs {
            count: jobs.len(),
            jobs,
            worker_count: self.workers.active_count(),
            work_items: self.workers.active_items(),
        })
    }

    /// Mark every job this process started as interrupted and wait up to
    /// `timeout` for bodies to return.
    ///
    /// Fan-out groups this process dispatched are cancelled so queue workers
    /// start none of their remaining sub-tasks. Groups with nothing running
    /// are joined here; the others are joined by the worker settling their
    /// last running task.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        let report = self.workers.request_shutdown(timeout).await;

        let groups = std::mem::take(&mut *self.unjoined.lock());
        for group_id in groups {
            let joined =
                distributed::join_settled(&self.store, self.fanout.registry(), group_id, "shutdown")
                    .await;
            if let Err(e) = joined {
                tracing::error!(%group_id, error = %e, "Failed to join cancelled fan-out group");
            }
        }
        report
    }

    /// Start-up recovery: fail orphaned in-flight records, then apply retention.
    pub fn recover(&self, retention: &RetentionConfig) -> Result<RecoveryReport> {
        let reaped = self.store.reap_in_flight(retention.liveness_timeout())?;
        let swept = self.store.sweep_stale(retention.max_age())?;
        Ok(RecoveryReport { reaped, swept })
    }
}

/// Cancel the queued remainder of a dispatched group and mark its record
/// interrupted.
///
/// Returns `true` when nothing of the group is still running, so the caller
/// owns its join. A group that is already gone was joined; nothing changes.
fn interrupt_dispatched(store: &JobStore, key: &JobKey, group_id: FanOutGroupId) -> Result<bool> {
    let owns_join = {
        let conn = get_conn(store.pool())?;
        match queue::cancel_group(&conn, group_id)? {
            Some(owns_join) => owns_join,
            None => return Ok(false),
        }
    };
    store.mark_interrupted([key])?;
    tracing::info!(
        subject_id = %key.subject_id,
        kind = %key.kind,
        %group_id,
        owns_join,
        "Interrupted dispatched fan-out job"
    );
    Ok(owns_join)
}

/// Removes a key from the owned set when the job body returns.
struct OwnedKey {
    owned: Arc<DashSet<JobKey>>,
    key: JobKey,
}

impl Drop for OwnedKey {
    fn drop(&mut self) {
        self.owned.remove(&self.key);
    }
}
