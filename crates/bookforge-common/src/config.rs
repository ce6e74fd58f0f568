//! Application configuration types.
//!
//! The top-level [`Config`] struct is deserialized from JSON. Every section
//! defaults sensibly so a completely empty `{}` file is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::Error;

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub workers: WorkersConfig,
    pub retention: RetentionConfig,
    pub queue: QueueConfig,
    pub tools: ToolsConfig,
    pub conversion: ConversionConfig,
}

impl Config {
    /// Deserialize a `Config` from a JSON string.
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str)
            .map_err(|e| Error::Validation(format!("config parse error: {e}")))
    }

    /// Load configuration from a file path, falling back to defaults if the
    /// path is `None`, the file does not exist, or it fails to parse.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse config file {}: {e}", path.display());
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}; using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.workers.max_concurrent_jobs == 0 {
            warnings.push("workers.max_concurrent_jobs is 0; no job can ever run".into());
        }
        if self.workers.fanout_workers == Some(0) {
            warnings.push("workers.fanout_workers is 0; fan-out jobs will stall".into());
        }
        if self.retention.liveness_timeout_secs < 60 {
            warnings.push(format!(
                "retention.liveness_timeout_secs is {}; live jobs may be reaped",
                self.retention.liveness_timeout_secs
            ));
        }
        if self.queue.mode == QueueMode::Distributed && self.queue.worker_concurrency == 0 {
            warnings.push(
                "queue.mode is distributed but queue.worker_concurrency is 0".into(),
            );
        }
        if self.conversion.mp3_bitrate.trim().is_empty() {
            warnings.push("conversion.mp3_bitrate is empty".into());
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// Job-store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/bookforge.db"),
        }
    }
}

/// Worker pool sizing and shutdown behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub max_concurrent_jobs: usize,
    /// Parallel sub-tasks per fan-out job. `None` picks a host-derived default.
    pub fanout_workers: Option<usize>,
    pub shutdown_timeout_secs: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            fanout_workers: None,
            shutdown_timeout_secs: 5,
        }
    }
}

/// Upper bound on the default fan-out width.
pub const FANOUT_WORKER_CAP: usize = 4;

impl WorkersConfig {
    pub fn effective_fanout_workers(&self) -> usize {
        self.fanout_workers
            .unwrap_or_else(|| num_cpus::get().min(FANOUT_WORKER_CAP))
            .max(1)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Retention sweep and crash-recovery thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub max_age_days: u64,
    pub liveness_timeout_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age_days: 2,
            liveness_timeout_secs: 900,
        }
    }
}

impl RetentionConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_days * 24 * 60 * 60)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }
}

/// Where fan-out sub-tasks run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueMode {
    /// Bounded pool inside the process that started the job.
    #[default]
    Local,
    /// Tasks written to the shared database and picked up by `worker` processes.
    Distributed,
}

/// Distributed queue consumer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub mode: QueueMode,
    pub poll_interval_ms: u64,
    pub worker_concurrency: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            mode: QueueMode::Local,
            poll_interval_ms: 500,
            worker_concurrency: 2,
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Paths to external CLI tools.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ffmpeg_path: Option<PathBuf>,
    pub ffprobe_path: Option<PathBuf>,
}

/// Audiobook conversion defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionConfig {
    pub output_dir: PathBuf,
    /// Scratch space for per-chapter part files.
    pub work_dir: PathBuf,
    #[serde(default = "default_mp3_bitrate")]
    pub mp3_bitrate: String,
}

fn default_mp3_bitrate() -> String {
    "128k".into()
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./data/converted"),
            work_dir: PathBuf::from("./data/work"),
            mp3_bitrate: default_mp3_bitrate(),
        }
    }
}
