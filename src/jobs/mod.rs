//! The conversion job orchestration engine.
//!
//! - [`store`]: durable per-key job records with serialized writes.
//! - [`worker`]: bounded background execution with cooperative shutdown.
//! - [`progress`]: the progress callback that doubles as a cancellation signal.
//! - [`fanout`]: scatter/gather of sub-tasks, in-process or across workers.
//! - [`orchestrator`]: the façade callers use to start and observe jobs.

pub mod fanout;
pub mod orchestrator;
pub mod progress;
pub mod store;
pub mod worker;

pub use fanout::{
    Aggregator, FanOutJoinCoordinator, FanOutPlan, FanOutRegistry, SubTask, SubTaskHandler,
    SubTaskOutcome, SubTaskResult,
};
pub use orchestrator::{
    ActiveJobs, ConversionJob, ConversionOrchestrator, JobOutcome, RecoveryReport, StartOutcome,
    StatusReport,
};
pub use progress::{ProgressChannel, ProgressReporter};
pub use store::JobStore;
pub use worker::{ShutdownReport, WorkContext, WorkerManager};
