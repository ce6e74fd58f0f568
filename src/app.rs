//! Composition root: builds one engine instance from configuration.

use std::path::Path;
use std::sync::Arc;

use bookforge_av::ToolRegistry;
use bookforge_common::config::{Config, QueueMode};
use bookforge_common::{ConversionKind, Error, JobKey, Result};
use bookforge_db::pool::{init_pool, DbPool};
use tokio_util::sync::CancellationToken;

use crate::conversion::{register_plans, ChapteredConversion, ConversionSettings, M4bConversion};
use crate::jobs::fanout::distributed::{worker_name, DistributedQueue, QueueWorker};
use crate::jobs::fanout::local::LocalPool;
use crate::jobs::fanout::ExecutionStrategy;
use crate::jobs::{
    ConversionJob, ConversionOrchestrator, FanOutJoinCoordinator, FanOutRegistry, JobStore,
    StartOutcome, WorkerManager,
};

/// Everything a process needs to run and observe conversions.
pub struct App {
    pub config: Config,
    pub store: JobStore,
    pub registry: Arc<FanOutRegistry>,
    pub settings: ConversionSettings,
    pub orchestrator: ConversionOrchestrator,
}

impl App {
    /// Open the configured database and discover tools.
    pub fn open(config: Config) -> Result<Self> {
        let pool = init_pool(&config.database.path)?;
        let tools = ToolRegistry::discover(&config.tools);
        Ok(Self::new(config, pool, tools))
    }

    pub fn new(config: Config, pool: DbPool, tools: ToolRegistry) -> Self {
        let store = JobStore::new(pool);
        let tools = Arc::new(tools);
        let settings = ConversionSettings::from_config(&config.conversion, tools.clone());
        let registry = Arc::new(register_plans(FanOutRegistry::new(), tools));

        let strategy: Arc<dyn ExecutionStrategy> = match config.queue.mode {
            QueueMode::Local => Arc::new(LocalPool::new(config.workers.effective_fanout_workers())),
            QueueMode::Distributed => Arc::new(DistributedQueue::new(store.clone())),
        };
        let fanout = FanOutJoinCoordinator::new(registry.clone(), strategy);
        let workers = WorkerManager::new(config.workers.max_concurrent_jobs);
        let orchestrator = ConversionOrchestrator::new(store.clone(), workers, fanout);

        tracing::debug!(
            queue_mode = ?config.queue.mode,
            max_concurrent_jobs = config.workers.max_concurrent_jobs,
            plans = ?registry.plan_names(),
            "Engine ready"
        );

        Self {
            config,
            store,
            registry,
            settings,
            orchestrator,
        }
    }

    /// Start converting `input`, keyed by its file name.
    pub fn start_conversion(
        &self,
        input: &Path,
        activation_bytes: &str,
        kind: ConversionKind,
    ) -> Result<(JobKey, StartOutcome)> {
        let key = Self::job_key(input, kind)?;
        let job: Arc<dyn ConversionJob> = match kind {
            ConversionKind::FullConvert => Arc::new(M4bConversion::new(
                self.settings.clone(),
                input,
                activation_bytes,
            )),
            ConversionKind::ChapteredConvert => Arc::new(ChapteredConversion::new(
                self.settings.clone(),
                input,
                activation_bytes,
            )),
        };
        let outcome = self.orchestrator.start_job(key.clone(), job)?;
        Ok((key, outcome))
    }

    pub fn job_key(input: &Path, kind: ConversionKind) -> Result<JobKey> {
        let subject = input
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| Error::Validation(format!("not a file: {}", input.display())))?;
        Ok(JobKey::new(subject, kind))
    }

    /// Queue consumers for this process, `queue.worker_concurrency` of them.
    pub fn queue_workers(&self, shutdown: &CancellationToken) -> Vec<QueueWorker> {
        (0..self.config.queue.worker_concurrency)
            .map(|i| {
                QueueWorker::new(
                    worker_name(i),
                    self.store.clone(),
                    self.registry.clone(),
                    shutdown.clone(),
                )
                .with_poll_interval(self.config.queue.poll_interval())
            })
            .collect()
    }
}
