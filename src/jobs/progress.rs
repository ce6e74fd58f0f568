//! Progress reporting that doubles as the cancellation signal.

use bookforge_common::{JobKey, JobStatus};
use tokio_util::sync::CancellationToken;

use super::store::JobStore;

/// Receives a completion percentage and answers whether to keep going.
///
/// `false` means the caller must abort its external operation and return a
/// cancellation result.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, percent: f64) -> bool;
}

/// Progress channel bound to one job record.
#[derive(Clone)]
pub struct ProgressChannel {
    store: JobStore,
    key: JobKey,
    shutdown: CancellationToken,
}

impl ProgressChannel {
    pub fn new(store: JobStore, key: JobKey, shutdown: CancellationToken) -> Self {
        Self {
            store,
            key,
            shutdown,
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn key(&self) -> &JobKey {
        &self.key
    }

    pub fn is_cancelled(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }
}

impl ProgressReporter for ProgressChannel {
    fn report(&self, percent: f64) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        let percent = if percent.is_finite() {
            percent.clamp(0.0, 100.0)
        } else {
            0.0
        };
        if let Err(e) = self
            .store
            .update_progress(&self.key, percent, JobStatus::Converting)
        {
            tracing::warn!(
                subject_id = %self.key.subject_id,
                kind = %self.key.kind,
                error = %e,
                "Failed to record progress"
            );
        }
        true
    }
}
