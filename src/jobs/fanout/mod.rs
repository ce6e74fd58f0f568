//! Fan-out/fan-in of one job into independent sub-tasks.
//!
//! A job body that wants to split its work returns a [`FanOutPlan`]: a
//! registered plan name, a shared context and one input per sub-task. The
//! [`FanOutJoinCoordinator`] hands the plan to an [`ExecutionStrategy`]
//! ([`local::LocalPool`] or [`distributed::DistributedQueue`]) and, once every
//! sub-task has settled, applies the all-or-nothing join policy exactly once.

pub mod distributed;
pub mod local;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use bookforge_common::{Completion, FanOutGroupId, JobFailure, JobKey};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::progress::{ProgressChannel, ProgressReporter};

/// Share of the progress range covered by sub-tasks; the rest belongs to the join.
pub const FANOUT_PROGRESS_SHARE: f64 = 90.0;

/// One unit of a fanned-out job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    /// 0-based position; the join orders artifacts by it.
    pub index: usize,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubTaskOutcome {
    Succeeded { artifact: String },
    Failed { reason: String },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubTaskResult {
    pub index: usize,
    pub outcome: SubTaskOutcome,
}

/// Runs a single sub-task.
///
/// `progress` only carries the continue/stop answer; job-level progress is
/// derived from the number of settled sub-tasks.
#[async_trait]
pub trait SubTaskHandler: Send + Sync {
    async fn run(
        &self,
        task: &SubTask,
        context: &Value,
        progress: &dyn ProgressReporter,
    ) -> SubTaskOutcome;
}

/// Builds the final artifact from sub-task artifacts, or throws them away.
#[async_trait]
pub trait Aggregator: Send + Sync {
    /// `artifacts` are in sub-task index order. Returns the final artifact path.
    async fn aggregate(
        &self,
        key: &JobKey,
        context: &Value,
        artifacts: &[String],
    ) -> anyhow::Result<String>;

    /// Remove the artifacts of a job that will not be aggregated.
    async fn discard(&self, key: &JobKey, context: &Value, artifacts: &[String]);
}

/// The handler/aggregator pair registered under a plan name.
#[derive(Clone)]
pub struct RegisteredPlan {
    pub handler: Arc<dyn SubTaskHandler>,
    pub aggregator: Arc<dyn Aggregator>,
}

/// Plans by name. Distributed workers resolve queued groups through it, so
/// every process that runs workers must register the same plans.
#[derive(Clone, Default)]
pub struct FanOutRegistry {
    plans: HashMap<String, RegisteredPlan>,
}

impl FanOutRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn SubTaskHandler>,
        aggregator: Arc<dyn Aggregator>,
    ) {
        self.plans.insert(
            name.into(),
            RegisteredPlan {
                handler,
                aggregator,
            },
        );
    }

    pub fn with_plan(
        mut self,
        name: impl Into<String>,
        handler: Arc<dyn SubTaskHandler>,
        aggregator: Arc<dyn Aggregator>,
    ) -> Self {
        self.register(name, handler, aggregator);
        self
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredPlan> {
        self.plans.get(name)
    }

    pub fn plan_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.plans.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// What a job body returns to request a fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanOutPlan {
    pub plan: String,
    /// Shared by every sub-task and the aggregator.
    pub context: Value,
    /// One payload per sub-task, in index order.
    pub inputs: Vec<Value>,
}

/// How a strategy hands back sub-task results.
#[derive(Debug)]
pub enum Gathered {
    /// All sub-tasks settled in this process.
    Ready(Vec<SubTaskResult>),
    /// Sub-tasks were queued; the join runs in whichever worker settles the last one.
    Deferred(FanOutGroupId),
}

#[async_trait]
pub trait ExecutionStrategy: Send + Sync {
    async fn execute(
        &self,
        key: &JobKey,
        plan: &FanOutPlan,
        registered: &RegisteredPlan,
        channel: &ProgressChannel,
    ) -> anyhow::Result<Gathered>;
}

#[derive(Debug)]
pub enum FanOutOutcome {
    Finished(Completion),
    Deferred(FanOutGroupId),
}

/// Result of applying the join policy to a complete set of results.
#[derive(Debug, PartialEq, Eq)]
pub enum JoinDecision {
    /// Every sub-task succeeded; artifacts in index order.
    Aggregate(Vec<String>),
    /// The job fails; `artifacts` must be discarded.
    Discard {
        failure: JobFailure,
        artifacts: Vec<String>,
    },
}

/// Apply the all-or-nothing policy.
///
/// Cancellation wins over everything else, then "nothing converted", then
/// the list of failed indices.
pub fn decide(mut results: Vec<SubTaskResult>) -> JoinDecision {
    results.sort_by_key(|r| r.index);

    let mut artifacts = Vec::with_capacity(results.len());
    let mut failed = Vec::new();
    let mut cancelled = false;
    for result in results {
        match result.outcome {
            SubTaskOutcome::Succeeded { artifact } => artifacts.push(artifact),
            SubTaskOutcome::Failed { .. } => failed.push(result.index),
            SubTaskOutcome::Cancelled => cancelled = true,
        }
    }

    let failure = if cancelled {
        JobFailure::Cancelled
    } else if artifacts.is_empty() {
        JobFailure::NothingConverted
    } else if !failed.is_empty() {
        JobFailure::PartialFanOutFailure { failed }
    } else {
        return JoinDecision::Aggregate(artifacts);
    };
    JoinDecision::Discard { failure, artifacts }
}

/// The join: decide, then aggregate or discard. Runs once per job instance.
///
/// An `interrupted` job never aggregates: sub-tasks that were already running
/// when shutdown arrived may have succeeded, but their artifacts are discarded
/// and the job ends cancelled.
pub async fn finalize(
    aggregator: &dyn Aggregator,
    key: &JobKey,
    context: &Value,
    results: Vec<SubTaskResult>,
    interrupted: bool,
) -> Completion {
    let total = results.len();
    let decision = match decide(results) {
        JoinDecision::Aggregate(artifacts) | JoinDecision::Discard { artifacts, .. }
            if interrupted =>
        {
            JoinDecision::Discard {
                failure: JobFailure::Cancelled,
                artifacts,
            }
        }
        decision => decision,
    };
    match decision {
        JoinDecision::Aggregate(artifacts) => {
            tracing::info!(
                subject_id = %key.subject_id,
                kind = %key.kind,
                artifacts = artifacts.len(),
                "All sub-tasks succeeded; aggregating"
            );
            let aggregated = AssertUnwindSafe(aggregator.aggregate(key, context, &artifacts))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(anyhow::anyhow!("aggregator panicked")));
            match aggregated {
                Ok(path) => Completion::success(path),
                Err(e) => {
                    tracing::error!(subject_id = %key.subject_id, error = %e, "Aggregation failed");
                    aggregator.discard(key, context, &artifacts).await;
                    Completion::failure(JobFailure::FinalizeFailed(format!("{e:#}")))
                }
            }
        }
        JoinDecision::Discard { failure, artifacts } => {
            tracing::warn!(
                subject_id = %key.subject_id,
                kind = %key.kind,
                total,
                discarded = artifacts.len(),
                reason = %failure,
                "Fan-out failed; discarding sub-task artifacts"
            );
            aggregator.discard(key, context, &artifacts).await;
            Completion::failure(failure)
        }
    }
}

/// Run a handler, turning a panic into a failed outcome.
pub(crate) async fn run_guarded(
    handler: &dyn SubTaskHandler,
    task: &SubTask,
    context: &Value,
    progress: &dyn ProgressReporter,
) -> SubTaskOutcome {
    match AssertUnwindSafe(handler.run(task, context, progress))
        .catch_unwind()
        .await
    {
        Ok(outcome) => outcome,
        Err(_) => {
            tracing::error!(index = task.index, "Sub-task panicked");
            SubTaskOutcome::Failed {
                reason: "sub-task panicked".into(),
            }
        }
    }
}

/// Scatter/gather front end shared by both execution strategies.
#[derive(Clone)]
pub struct FanOutJoinCoordinator {
    registry: Arc<FanOutRegistry>,
    strategy: Arc<dyn ExecutionStrategy>,
}

impl FanOutJoinCoordinator {
    pub fn new(registry: Arc<FanOutRegistry>, strategy: Arc<dyn ExecutionStrategy>) -> Self {
        Self { registry, strategy }
    }

    pub fn registry(&self) -> &Arc<FanOutRegistry> {
        &self.registry
    }

    pub async fn run(
        &self,
        key: &JobKey,
        plan: FanOutPlan,
        channel: &ProgressChannel,
    ) -> FanOutOutcome {
        let Some(registered) = self.registry.get(&plan.plan) else {
            tracing::error!(plan = %plan.plan, "Unknown fan-out plan");
            return FanOutOutcome::Finished(Completion::failure(
                JobFailure::ExternalOperationFailed(format!("unknown fan-out plan '{}'", plan.plan)),
            ));
        };
        if plan.inputs.is_empty() {
            return FanOutOutcome::Finished(Completion::failure(JobFailure::NothingConverted));
        }

        tracing::info!(
            subject_id = %key.subject_id,
            kind = %key.kind,
            plan = %plan.plan,
            sub_tasks = plan.inputs.len(),
            "Fanning out"
        );

        match self.strategy.execute(key, &plan, registered, channel).await {
            Ok(Gathered::Ready(results)) => FanOutOutcome::Finished(
                finalize(
                    registered.aggregator.as_ref(),
                    key,
                    &plan.context,
                    results,
                    channel.is_cancelled(),
                )
                .await,
            ),
            Ok(Gathered::Deferred(group_id)) => {
                tracing::info!(subject_id = %key.subject_id, %group_id, "Sub-tasks queued");
                FanOutOutcome::Deferred(group_id)
            }
            Err(e) => {
                tracing::error!(subject_id = %key.subject_id, error = %e, "Fan-out dispatch failed");
                FanOutOutcome::Finished(Completion::failure(JobFailure::ExternalOperationFailed(
                    format!("{e:#}"),
                )))
            }
        }
    }
}
