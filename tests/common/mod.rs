//! Shared test harness for integration tests.
//!
//! Provides [`TestHarness`], which wires a full engine (store, worker
//! manager, fan-out coordinator, orchestrator) over a file-backed SQLite
//! database in a temp dir, plus scripted job bodies and a file-based
//! fan-out plan whose artifacts can be inspected on disk.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bookforge::jobs::fanout::distributed::{worker_name, DistributedQueue, QueueWorker};
use bookforge::jobs::fanout::local::LocalPool;
use bookforge::jobs::fanout::ExecutionStrategy;
use bookforge::jobs::{
    Aggregator, ConversionJob, ConversionOrchestrator, FanOutJoinCoordinator, FanOutPlan,
    FanOutRegistry, JobOutcome, JobStore, ProgressChannel, ProgressReporter, StatusReport,
    SubTask, SubTaskHandler, SubTaskOutcome, WorkerManager,
};
use bookforge_common::{ConversionKind, JobKey, JobStatus};
use bookforge_db::pool::{init_pool, DbPool};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Name of the file-based fan-out plan.
pub const FILES_PLAN: &str = "test.files";

/// Test harness wrapping a fully-constructed engine backed by a temp-dir
/// database.
pub struct TestHarness {
    pub dir: TempDir,
    pub db: DbPool,
    pub store: JobStore,
    pub registry: Arc<FanOutRegistry>,
    pub archive: Arc<ConcatArchive>,
    pub orchestrator: ConversionOrchestrator,
}

impl TestHarness {
    /// Local fan-out with two sub-task workers.
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let db = init_pool(&dir.path().join("jobs.db")).expect("failed to open pool");
        Self::build(dir, db, |_| {
            Arc::new(LocalPool::new(2)) as Arc<dyn ExecutionStrategy>
        })
    }

    /// Fan-out dispatched to the queue; drive it with [`Self::spawn_queue_workers`].
    pub fn distributed() -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let db = init_pool(&dir.path().join("jobs.db")).expect("failed to open pool");
        Self::build(dir, db, |store| {
            Arc::new(DistributedQueue::new(store.clone())) as Arc<dyn ExecutionStrategy>
        })
    }

    /// A second engine over the same database, as a restarted process would see it.
    pub fn reopen(&self) -> ConversionOrchestrator {
        let store = JobStore::new(self.db.clone());
        let fanout = FanOutJoinCoordinator::new(self.registry.clone(), Arc::new(LocalPool::new(2)));
        ConversionOrchestrator::new(store, WorkerManager::new(4), fanout)
    }

    fn build(
        dir: TempDir,
        db: DbPool,
        strategy: impl FnOnce(&JobStore) -> Arc<dyn ExecutionStrategy>,
    ) -> Self {
        let store = JobStore::new(db.clone());
        let archive = Arc::new(ConcatArchive::default());
        let registry = Arc::new(FanOutRegistry::new().with_plan(
            FILES_PLAN,
            Arc::new(FileWriter),
            archive.clone(),
        ));
        let fanout = FanOutJoinCoordinator::new(registry.clone(), strategy(&store));
        let orchestrator = ConversionOrchestrator::new(store.clone(), WorkerManager::new(4), fanout);

        Self {
            dir,
            db,
            store,
            registry,
            archive,
            orchestrator,
        }
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.dir.path().join("scratch")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.dir.path().join("out")
    }

    /// A fan-out job over `payloads`; a payload of `"fail"` fails that sub-task.
    pub fn files_job(&self, payloads: &[&str]) -> Arc<dyn ConversionJob> {
        Arc::new(FilesJob {
            scratch: self.scratch_dir(),
            out: self.output_dir(),
            payloads: payloads.iter().map(|s| s.to_string()).collect(),
        })
    }

    /// Start `n` queue workers polling every 10ms until `shutdown` fires.
    pub fn spawn_queue_workers(&self, n: usize, shutdown: &CancellationToken) {
        for i in 0..n {
            let worker = QueueWorker::new(
                worker_name(i),
                self.store.clone(),
                self.registry.clone(),
                shutdown.clone(),
            )
            .with_poll_interval(Duration::from_millis(10));
            tokio::spawn(async move { worker.run().await });
        }
    }

    /// Poll until the record for `key` is terminal.
    pub async fn wait_terminal(&self, key: &JobKey) -> StatusReport {
        wait_for(&self.orchestrator, key, |s| s.is_terminal()).await
    }

    /// Poll until the record for `key` reaches `status`.
    pub async fn wait_status(&self, key: &JobKey, status: JobStatus) -> StatusReport {
        wait_for(&self.orchestrator, key, |s| s == status).await
    }

    /// Files left in the scratch dir.
    pub fn scratch_files(&self) -> Vec<PathBuf> {
        list_files(&self.scratch_dir())
    }
}

pub async fn wait_for(
    orchestrator: &ConversionOrchestrator,
    key: &JobKey,
    pred: impl Fn(JobStatus) -> bool,
) -> StatusReport {
    for _ in 0..500 {
        let status = orchestrator.get_status(key);
        if pred(status.record.status) {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting on {key}");
}

pub fn key(subject: &str, kind: ConversionKind) -> JobKey {
    JobKey::new(subject, kind)
}

fn list_files(dir: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
        Err(_) => Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Scripted job bodies
// ---------------------------------------------------------------------------

/// Reports each step in turn, then succeeds with `result`.
pub struct Scripted {
    pub steps: Vec<f64>,
    pub delay: Duration,
    pub result: Result<String, String>,
}

#[async_trait]
impl ConversionJob for Scripted {
    async fn run(&self, progress: &ProgressChannel) -> JobOutcome {
        for step in &self.steps {
            if !progress.report(*step) {
                return JobOutcome::Cancelled;
            }
            tokio::time::sleep(self.delay).await;
        }
        match &self.result {
            Ok(path) => JobOutcome::Converted(path.clone()),
            Err(reason) => JobOutcome::Failed(reason.clone()),
        }
    }
}

pub fn succeeds_with(path: &str) -> Arc<dyn ConversionJob> {
    Arc::new(Scripted {
        steps: vec![50.0],
        delay: Duration::from_millis(1),
        result: Ok(path.into()),
    })
}

/// Reports once, then waits for shutdown like an external process would
/// until its progress callback says stop.
pub struct UntilShutdown {
    pub percent: f64,
}

#[async_trait]
impl ConversionJob for UntilShutdown {
    async fn run(&self, progress: &ProgressChannel) -> JobOutcome {
        progress.report(self.percent);
        progress.shutdown_token().cancelled().await;
        if progress.report(self.percent) {
            JobOutcome::Converted("unreachable".into())
        } else {
            JobOutcome::Cancelled
        }
    }
}

/// Waits for `gate` before succeeding with `path`.
pub struct Gated {
    pub gate: Arc<Notify>,
    pub path: String,
}

#[async_trait]
impl ConversionJob for Gated {
    async fn run(&self, _progress: &ProgressChannel) -> JobOutcome {
        self.gate.notified().await;
        JobOutcome::Converted(self.path.clone())
    }
}

// ---------------------------------------------------------------------------
// File-based fan-out plan
// ---------------------------------------------------------------------------

struct FilesJob {
    scratch: PathBuf,
    out: PathBuf,
    payloads: Vec<String>,
}

#[async_trait]
impl ConversionJob for FilesJob {
    async fn run(&self, progress: &ProgressChannel) -> JobOutcome {
        if std::fs::create_dir_all(&self.scratch).is_err() {
            return JobOutcome::Failed("no scratch dir".into());
        }
        progress.report(0.0);
        JobOutcome::FanOut(FanOutPlan {
            plan: FILES_PLAN.into(),
            context: json!({ "scratch": self.scratch, "out": self.out }),
            inputs: self.payloads.iter().map(|p| json!(p)).collect(),
        })
    }
}

/// Writes `<scratch>/<index>.part` containing the payload.
pub struct FileWriter;

#[async_trait]
impl SubTaskHandler for FileWriter {
    async fn run(
        &self,
        task: &SubTask,
        context: &Value,
        progress: &dyn ProgressReporter,
    ) -> SubTaskOutcome {
        let payload = task.payload.as_str().unwrap_or_default();
        // Earlier indices finish last so completion order differs from index order.
        tokio::time::sleep(Duration::from_millis(5 * (10 - task.index as u64 % 10))).await;
        if !progress.report(100.0) {
            return SubTaskOutcome::Cancelled;
        }
        if payload == "fail" {
            return SubTaskOutcome::Failed {
                reason: "simulated failure".into(),
            };
        }
        let scratch = PathBuf::from(context["scratch"].as_str().unwrap_or_default());
        let path = scratch.join(format!("{}.part", task.index));
        match std::fs::write(&path, payload) {
            Ok(()) => SubTaskOutcome::Succeeded {
                artifact: path.display().to_string(),
            },
            Err(e) => SubTaskOutcome::Failed {
                reason: e.to_string(),
            },
        }
    }
}

/// Concatenates parts into `<out>/final.txt` and removes them.
#[derive(Default)]
pub struct ConcatArchive {
    pub aggregations: AtomicUsize,
    pub discards: AtomicUsize,
}

#[async_trait]
impl Aggregator for ConcatArchive {
    async fn aggregate(
        &self,
        _key: &JobKey,
        context: &Value,
        artifacts: &[String],
    ) -> anyhow::Result<String> {
        self.aggregations.fetch_add(1, Ordering::SeqCst);
        let out = PathBuf::from(context["out"].as_str().unwrap_or_default());
        std::fs::create_dir_all(&out)?;
        let mut body = String::new();
        for artifact in artifacts {
            body.push_str(&std::fs::read_to_string(artifact)?);
        }
        let dest = out.join("final.txt");
        std::fs::write(&dest, body)?;
        for artifact in artifacts {
            std::fs::remove_file(artifact)?;
        }
        Ok(dest.display().to_string())
    }

    async fn discard(&self, _key: &JobKey, _context: &Value, artifacts: &[String]) {
        self.discards.fetch_add(1, Ordering::SeqCst);
        for artifact in artifacts {
            let _ = std::fs::remove_file(artifact);
        }
    }
}
