//! Job failure reasons.
//!
//! These are the messages written to `error_message` when a job ends in
//! `Failed`. Each variant renders to a stable string so that callers polling
//! the status can tell a cancellation from a crash or a partial fan-out.

/// Why a job ended in the `Failed` state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobFailure {
    /// The external operation reported a failure; its message is kept verbatim.
    #[error("{0}")]
    ExternalOperationFailed(String),

    /// The process was shutting down while the job ran.
    #[error("Server interrupted")]
    Cancelled,

    /// At least one sub-task failed while others succeeded.
    #[error("Failed sub-tasks at indices {failed:?}")]
    PartialFanOutFailure {
        /// Failed sub-task indices, ascending.
        failed: Vec<usize>,
    },

    /// No sub-task produced an artifact.
    #[error("No sub-tasks were converted")]
    NothingConverted,

    /// The reaper found the record in flight with no live owner.
    #[error("Stale job recovered after restart")]
    StaleJobRecovered,

    /// Every sub-task succeeded but assembling the final artifact failed.
    #[error("Finalization failed: {0}")]
    FinalizeFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_failure_is_verbatim() {
        let f = JobFailure::ExternalOperationFailed("ffmpeg exited with status 1".into());
        assert_eq!(f.to_string(), "ffmpeg exited with status 1");
    }

    #[test]
    fn partial_failure_lists_indices() {
        let f = JobFailure::PartialFanOutFailure { failed: vec![2, 4] };
        assert_eq!(f.to_string(), "Failed sub-tasks at indices [2, 4]");
    }

    #[test]
    fn reasons_are_distinct() {
        let all = [
            JobFailure::Cancelled.to_string(),
            JobFailure::NothingConverted.to_string(),
            JobFailure::StaleJobRecovered.to_string(),
        ];
        assert_ne!(all[0], all[1]);
        assert_ne!(all[1], all[2]);
        assert_ne!(all[0], all[2]);
    }
}
