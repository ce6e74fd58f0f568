//! In-process execution: a bounded pool of tokio tasks.

use std::sync::Arc;

use async_trait::async_trait;
use bookforge_common::JobKey;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use super::{
    run_guarded, ExecutionStrategy, FanOutPlan, Gathered, RegisteredPlan, SubTask,
    SubTaskOutcome, SubTaskResult, FANOUT_PROGRESS_SHARE,
};
use crate::jobs::progress::{ProgressChannel, ProgressReporter};

/// Runs every sub-task in this process with at most `workers` at a time.
#[derive(Debug, Clone)]
pub struct LocalPool {
    workers: usize,
}

impl LocalPool {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }
}

/// Sub-task side of the channel: keep going until the group is stopped.
struct StopSignal(CancellationToken);

impl ProgressReporter for StopSignal {
    fn report(&self, _percent: f64) -> bool {
        !self.0.is_cancelled()
    }
}

#[async_trait]
impl ExecutionStrategy for LocalPool {
    async fn execute(
        &self,
        key: &JobKey,
        plan: &FanOutPlan,
        registered: &RegisteredPlan,
        channel: &ProgressChannel,
    ) -> anyhow::Result<Gathered> {
        let total = plan.inputs.len();
        let slots = Arc::new(Semaphore::new(self.workers));
        // Cancelled on shutdown, on a cancelled sub-task, or when the channel says stop.
        let stop = channel.shutdown_token().child_token();
        let context = Arc::new(plan.context.clone());
        let (tx, mut rx) = mpsc::unbounded_channel::<SubTaskResult>();

        for (index, payload) in plan.inputs.iter().cloned().enumerate() {
            let tx = tx.clone();
            let slots = slots.clone();
            let stop = stop.clone();
            let context = context.clone();
            let handler = registered.handler.clone();

            tokio::spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = stop.cancelled() => None,
                    permit = slots.acquire_owned() => permit.ok(),
                };

                let outcome = match permit {
                    None => SubTaskOutcome::Cancelled,
                    Some(_permit) => {
                        let task = SubTask { index, payload };
                        let reporter = StopSignal(stop.clone());
                        run_guarded(handler.as_ref(), &task, &context, &reporter).await
                    }
                };
                if outcome == SubTaskOutcome::Cancelled {
                    stop.cancel();
                }
                let _ = tx.send(SubTaskResult { index, outcome });
            });
        }
        drop(tx);

        let mut results: Vec<SubTaskResult> = Vec::with_capacity(total);
        while let Some(result) = rx.recv().await {
            tracing::debug!(
                subject_id = %key.subject_id,
                index = result.index,
                outcome = ?result.outcome,
                "Sub-task settled"
            );
            results.push(result);
            let percent = results.len() as f64 / total as f64 * FANOUT_PROGRESS_SHARE;
            if !channel.report(percent) {
                stop.cancel();
            }
        }

        // A sub-task task that died without sending still counts as settled.
        if results.len() < total {
            let mut seen = vec![false; total];
            for r in &results {
                seen[r.index] = true;
            }
            for (index, _) in seen.iter().enumerate().filter(|(_, s)| !**s) {
                tracing::error!(subject_id = %key.subject_id, index, "Sub-task never reported");
                results.push(SubTaskResult {
                    index,
                    outcome: SubTaskOutcome::Failed {
                        reason: "sub-task did not report a result".into(),
                    },
                });
            }
        }

        Ok(Gathered::Ready(results))
    }
}
