//! Distributed execution through the shared SQLite task queue.
//!
//! [`DistributedQueue`] only dispatches: it writes a group and its tasks and
//! returns. [`QueueWorker`]s in any process sharing the database claim
//! tasks, run the registered handler and settle the task. The worker whose
//! settle brings the group counter to its total runs the join and removes
//! the group.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bookforge_common::{Completion, FanOutGroupId, JobFailure, JobKey, JobStatus};
use bookforge_db::models::{FanOutGroup, FanOutTask, TaskState};
use bookforge_db::pool::get_conn;
use bookforge_db::queries::fanout;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{
    finalize, run_guarded, ExecutionStrategy, FanOutPlan, FanOutRegistry, Gathered,
    RegisteredPlan, SubTask, SubTaskOutcome, SubTaskResult, FANOUT_PROGRESS_SHARE,
};
use crate::jobs::progress::{ProgressChannel, ProgressReporter};
use crate::jobs::store::{cutoff, JobStore};

/// A claimed task not touched for this long is assumed abandoned and requeued.
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(300);

/// Name for the `i`th queue worker of this process.
pub fn worker_name(i: usize) -> String {
    format!("worker-{}-{}", std::process::id(), i)
}

/// Dispatches sub-tasks to the shared queue.
#[derive(Clone)]
pub struct DistributedQueue {
    store: JobStore,
}

impl DistributedQueue {
    pub fn new(store: JobStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ExecutionStrategy for DistributedQueue {
    async fn execute(
        &self,
        key: &JobKey,
        plan: &FanOutPlan,
        _registered: &RegisteredPlan,
        channel: &ProgressChannel,
    ) -> anyhow::Result<Gathered> {
        let group_id = {
            let conn = get_conn(self.store.pool())?;
            fanout::create_group(&conn, key, &plan.plan, &plan.context, &plan.inputs)?
        };
        channel.report(0.0);
        Ok(Gathered::Deferred(group_id))
    }
}

/// Long-running consumer of the fan-out queue.
pub struct QueueWorker {
    name: String,
    store: JobStore,
    registry: Arc<FanOutRegistry>,
    poll_interval: Duration,
    lease_timeout: Duration,
    shutdown: CancellationToken,
}

impl QueueWorker {
    pub fn new(
        name: impl Into<String>,
        store: JobStore,
        registry: Arc<FanOutRegistry>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            registry,
            poll_interval: Duration::from_millis(500),
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
            shutdown,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_lease_timeout(mut self, lease_timeout: Duration) -> Self {
        self.lease_timeout = lease_timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Poll until shutdown. A task already claimed is always settled first.
    pub async fn run(&self) {
        tracing::info!(worker = %self.name, "Queue worker started");

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match self.process_next().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(worker = %self.name, error = %e, "Error processing queue");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = self.shutdown.cancelled() => break,
            }
        }

        tracing::info!(worker = %self.name, "Queue worker stopped");
    }

    /// Claim and settle one task. Returns `Ok(false)` when the queue is empty.
    pub async fn process_next(&self) -> anyhow::Result<bool> {
        let recovered = {
            let conn = get_conn(self.store.pool())?;
            fanout::requeue_abandoned_tasks(&conn, cutoff(self.lease_timeout))?
        };
        if recovered.requeued > 0 {
            tracing::warn!(worker = %self.name, requeued = recovered.requeued, "Requeued abandoned sub-tasks");
        }
        if recovered.cancelled > 0 {
            tracing::warn!(
                worker = %self.name,
                cancelled = recovered.cancelled,
                "Settled abandoned sub-tasks of cancelled groups"
            );
        }
        let joined_any = !recovered.joinable.is_empty();
        for group_id in recovered.joinable {
            if !join_settled(&self.store, &self.registry, group_id, &self.name).await? {
                tracing::warn!(worker = %self.name, %group_id, "Settled group vanished before join");
            }
        }

        let (task, group) = {
            let conn = get_conn(self.store.pool())?;
            let Some(task) = fanout::dequeue_next_task(&conn, &self.name)? else {
                return Ok(joined_any);
            };
            let group = fanout::get_group(&conn, task.group_id)?.ok_or_else(|| {
                anyhow::anyhow!("fan-out group {} vanished under task {}", task.group_id, task.index)
            })?;
            (task, group)
        };

        tracing::debug!(
            worker = %self.name,
            group_id = %group.id,
            index = task.index,
            total = group.total,
            "Claimed sub-task"
        );

        let outcome = match self.registry.get(&group.plan) {
            Some(registered) => {
                let reporter = LeaseReporter::new(self, group.id, task.index);
                let sub_task = SubTask {
                    index: task.index,
                    payload: task.payload.clone(),
                };
                run_guarded(
                    registered.handler.as_ref(),
                    &sub_task,
                    &group.context,
                    &reporter,
                )
                .await
            }
            None => SubTaskOutcome::Failed {
                reason: format!("unknown fan-out plan '{}'", group.plan),
            },
        };

        let (state, artifact, error) = match &outcome {
            SubTaskOutcome::Succeeded { artifact } => {
                (TaskState::Succeeded, Some(artifact.as_str()), None)
            }
            SubTaskOutcome::Failed { reason } => (TaskState::Failed, None, Some(reason.as_str())),
            SubTaskOutcome::Cancelled => (TaskState::Cancelled, None, Some("cancelled")),
        };

        let settled = {
            let conn = get_conn(self.store.pool())?;
            fanout::record_task_result(
                &conn,
                group.id,
                task.index,
                &self.name,
                state,
                artifact,
                error,
            )?
        };
        let Some((settled, total)) = settled else {
            tracing::warn!(
                worker = %self.name,
                group_id = %group.id,
                index = task.index,
                "Late sub-task result ignored; lease was lost"
            );
            return Ok(true);
        };

        let key = group.key();
        let percent = settled as f64 / total as f64 * FANOUT_PROGRESS_SHARE;
        if let Err(e) = self
            .store
            .update_progress(&key, percent, JobStatus::Converting)
        {
            tracing::warn!(subject_id = %key.subject_id, error = %e, "Failed to record progress");
        }

        if settled >= total {
            join_group(&self.store, &self.registry, &group, &self.name).await?;
        }
        Ok(true)
    }
}

/// Aggregate or discard, write the completion and delete the group.
///
/// Runs once per group: only the caller whose write settled the last task
/// gets here.
async fn join_group(
    store: &JobStore,
    registry: &FanOutRegistry,
    group: &FanOutGroup,
    joined_by: &str,
) -> anyhow::Result<()> {
    let key = group.key();
    // The flag may have been set after the caller loaded the group.
    let (tasks, interrupted) = {
        let conn = get_conn(store.pool())?;
        let interrupted = fanout::get_group(&conn, group.id)?
            .map_or(group.cancelled, |current| current.cancelled);
        (fanout::load_tasks(&conn, group.id)?, interrupted)
    };
    let results: Vec<SubTaskResult> = tasks.into_iter().map(task_result).collect();

    tracing::info!(
        joined_by,
        group_id = %group.id,
        subject_id = %key.subject_id,
        sub_tasks = results.len(),
        interrupted,
        "All sub-tasks settled; joining"
    );

    let completion = match registry.get(&group.plan) {
        Some(registered) => {
            finalize(
                registered.aggregator.as_ref(),
                &key,
                &group.context,
                results,
                interrupted,
            )
            .await
        }
        None => Completion::failure(JobFailure::ExternalOperationFailed(format!(
            "unknown fan-out plan '{}'",
            group.plan
        ))),
    };

    store.complete(&key, &completion)?;
    let conn = get_conn(store.pool())?;
    fanout::delete_group(&conn, group.id)?;
    Ok(())
}

/// Join a group whose last task the caller settled, or which the caller
/// cancelled with nothing left running. Returns `false` when the group no
/// longer exists.
pub async fn join_settled(
    store: &JobStore,
    registry: &FanOutRegistry,
    group_id: FanOutGroupId,
    joined_by: &str,
) -> anyhow::Result<bool> {
    let group = {
        let conn = get_conn(store.pool())?;
        fanout::get_group(&conn, group_id)?
    };
    match group {
        Some(group) => {
            join_group(store, registry, &group, joined_by).await?;
            Ok(true)
        }
        None => Ok(false),
    }
}

fn task_result(task: FanOutTask) -> SubTaskResult {
    let outcome = match (task.state, task.artifact) {
        (TaskState::Succeeded, Some(artifact)) => SubTaskOutcome::Succeeded { artifact },
        (TaskState::Cancelled, _) => SubTaskOutcome::Cancelled,
        (_, _) => SubTaskOutcome::Failed {
            reason: task.error.unwrap_or_else(|| "no result recorded".into()),
        },
    };
    SubTaskResult {
        index: task.index,
        outcome,
    }
}

/// Sub-task side of the channel for queued work: refreshes the task lease
/// and asks the handler to stop on shutdown, when the lease was lost, or
/// when the group was cancelled.
struct LeaseReporter<'a> {
    worker: &'a QueueWorker,
    group_id: FanOutGroupId,
    index: usize,
    last_touch: Mutex<Instant>,
}

impl<'a> LeaseReporter<'a> {
    fn new(worker: &'a QueueWorker, group_id: FanOutGroupId, index: usize) -> Self {
        Self {
            worker,
            group_id,
            index,
            last_touch: Mutex::new(Instant::now()),
        }
    }
}

impl ProgressReporter for LeaseReporter<'_> {
    fn report(&self, _percent: f64) -> bool {
        if self.worker.shutdown.is_cancelled() {
            return false;
        }

        let mut last = self.last_touch.lock();
        if last.elapsed() < self.worker.lease_timeout / 4 {
            return true;
        }
        *last = Instant::now();

        let touched = get_conn(self.worker.store.pool())
            .and_then(|conn| fanout::touch_task(&conn, self.group_id, self.index, &self.worker.name));
        match touched {
            Ok(true) => true,
            Ok(false) => {
                tracing::warn!(
                    worker = %self.worker.name,
                    group_id = %self.group_id,
                    index = self.index,
                    "Sub-task lease lost or group cancelled; stopping"
                );
                false
            }
            Err(e) => {
                tracing::warn!(worker = %self.worker.name, error = %e, "Failed to refresh lease");
                true
            }
        }
    }
}
