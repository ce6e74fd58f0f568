//! Chapter-per-file MP3 conversion, fanned out one sub-task per chapter.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bookforge_av::actions::chapter_file_name;
use bookforge_av::archive::write_zip;
use bookforge_av::probe::probe_audiobook;
use bookforge_av::{convert_chapter, extract_cover, ChapterJob, RunOutcome, ToolRegistry};
use bookforge_common::JobKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{stem, ConversionSettings};
use crate::jobs::{
    Aggregator, ConversionJob, FanOutPlan, FanOutRegistry, JobOutcome, ProgressChannel,
    ProgressReporter, SubTask, SubTaskHandler, SubTaskOutcome,
};

/// Plan name for chapter fan-outs.
pub const CHAPTER_PLAN: &str = "audiobook.chapters";

/// Shared by the chapter sub-tasks and the archiver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterContext {
    /// Per-run directory holding the chapter MP3s until they are zipped.
    pub scratch_dir: PathBuf,
    pub output_dir: PathBuf,
    pub archive_name: String,
    /// Cover art extracted once per book, embedded in every chapter file.
    #[serde(default)]
    pub cover: Option<PathBuf>,
}

pub struct ChapteredConversion {
    settings: ConversionSettings,
    input: PathBuf,
    activation_bytes: String,
}

impl ChapteredConversion {
    pub fn new(
        settings: ConversionSettings,
        input: impl Into<PathBuf>,
        activation_bytes: impl Into<String>,
    ) -> Self {
        Self {
            settings,
            input: input.into(),
            activation_bytes: activation_bytes.into(),
        }
    }

    async fn plan(&self, progress: &ProgressChannel) -> anyhow::Result<JobOutcome> {
        let stem = stem(&self.input)?;
        let info = probe_audiobook(
            &self.settings.tools,
            &self.input,
            Some(self.activation_bytes.as_str()),
        )
        .await?;
        if info.chapters.is_empty() {
            return Ok(JobOutcome::Failed("No chapters found in source file".into()));
        }
        if !progress.report(0.0) {
            return Ok(JobOutcome::Cancelled);
        }

        let scratch_dir = self
            .settings
            .work_dir
            .join(format!("{stem}_mp3_{}", uuid::Uuid::new_v4().simple()));
        std::fs::create_dir_all(&scratch_dir)?;
        let cover = self.cover(&scratch_dir).await;

        let total_chapters = info.chapters.len();
        let inputs = info
            .chapters
            .into_iter()
            .map(|chapter| {
                serde_json::to_value(ChapterJob {
                    input: self.input.clone(),
                    activation_bytes: self.activation_bytes.clone(),
                    chapter,
                    total_chapters,
                    tags: info.tags.clone(),
                    output_dir: scratch_dir.clone(),
                    bitrate: self.settings.mp3_bitrate.clone(),
                    cover: None,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let context = ChapterContext {
            scratch_dir,
            output_dir: self.settings.output_dir.clone(),
            archive_name: format!("{stem}_chapters.zip"),
            cover,
        };

        tracing::info!(
            input = %self.input.display(),
            chapters = total_chapters,
            scratch_dir = %context.scratch_dir.display(),
            cover = context.cover.is_some(),
            "Splitting into chapters"
        );

        Ok(JobOutcome::FanOut(FanOutPlan {
            plan: CHAPTER_PLAN.into(),
            context: serde_json::to_value(&context)?,
            inputs,
        }))
    }

    /// A book without usable art still converts, just without a cover.
    async fn cover(&self, scratch_dir: &Path) -> Option<PathBuf> {
        let dest = scratch_dir.join("cover.jpg");
        match extract_cover(&self.settings.tools, &self.input, &self.activation_bytes, &dest).await {
            Ok(()) => dest.is_file().then_some(dest),
            Err(e) => {
                tracing::warn!(input = %self.input.display(), error = %e, "No cover art extracted");
                let _ = std::fs::remove_file(&dest);
                None
            }
        }
    }
}

#[async_trait]
impl ConversionJob for ChapteredConversion {
    async fn run(&self, progress: &ProgressChannel) -> JobOutcome {
        match self.plan(progress).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(input = %self.input.display(), error = %e, "Chapter planning failed");
                JobOutcome::Failed(e.to_string())
            }
        }
    }
}

/// Converts one chapter into an MP3 in the scratch dir.
pub struct ChapterConverter {
    tools: Arc<ToolRegistry>,
}

impl ChapterConverter {
    pub fn new(tools: Arc<ToolRegistry>) -> Self {
        Self { tools }
    }
}

#[async_trait]
impl SubTaskHandler for ChapterConverter {
    async fn run(
        &self,
        task: &SubTask,
        context: &Value,
        progress: &dyn ProgressReporter,
    ) -> SubTaskOutcome {
        let mut job: ChapterJob = match serde_json::from_value(task.payload.clone()) {
            Ok(job) => job,
            Err(e) => {
                return SubTaskOutcome::Failed {
                    reason: format!("invalid chapter payload: {e}"),
                }
            }
        };
        if let Ok(ctx) = serde_json::from_value::<ChapterContext>(context.clone()) {
            job.cover = ctx.cover;
        }
        if !progress.report(0.0) {
            return SubTaskOutcome::Cancelled;
        }

        match convert_chapter(&self.tools, &job, |f| progress.report(f * 100.0)).await {
            Ok((RunOutcome::Completed, path)) => SubTaskOutcome::Succeeded {
                artifact: path.display().to_string(),
            },
            Ok((RunOutcome::Aborted, path)) => {
                let _ = std::fs::remove_file(path);
                SubTaskOutcome::Cancelled
            }
            Err(e) => {
                tracing::warn!(chapter = job.chapter.index, error = %e, "Chapter conversion failed");
                let _ = std::fs::remove_file(job.output_dir.join(chapter_file_name(&job.chapter)));
                SubTaskOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }
}

/// Zips chapter MP3s in index order and clears the scratch dir.
#[derive(Debug, Default)]
pub struct ChapterArchiver;

impl ChapterArchiver {
    fn clean_up(context: Option<&ChapterContext>, artifacts: &[String]) {
        for artifact in artifacts {
            if let Err(e) = std::fs::remove_file(artifact) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(artifact = %artifact, error = %e, "Failed to remove chapter file");
                }
            }
        }
        if let Some(ctx) = context {
            remove_dir_if_present(&ctx.scratch_dir);
        }
    }
}

fn remove_dir_if_present(dir: &Path) {
    if dir.exists() {
        if let Err(e) = std::fs::remove_dir_all(dir) {
            tracing::warn!(dir = %dir.display(), error = %e, "Failed to remove scratch dir");
        }
    }
}

#[async_trait]
impl Aggregator for ChapterArchiver {
    async fn aggregate(
        &self,
        key: &JobKey,
        context: &Value,
        artifacts: &[String],
    ) -> anyhow::Result<String> {
        let ctx: ChapterContext = serde_json::from_value(context.clone())?;
        std::fs::create_dir_all(&ctx.output_dir)?;
        let dest = ctx.output_dir.join(&ctx.archive_name);
        let files: Vec<PathBuf> = artifacts.iter().map(PathBuf::from).collect();

        let zip_dest = dest.clone();
        tokio::task::spawn_blocking(move || write_zip(&zip_dest, &files)).await??;

        tracing::info!(
            subject_id = %key.subject_id,
            archive = %dest.display(),
            chapters = artifacts.len(),
            "Chapter archive written"
        );
        Self::clean_up(Some(&ctx), artifacts);
        Ok(dest.display().to_string())
    }

    async fn discard(&self, _key: &JobKey, context: &Value, artifacts: &[String]) {
        let ctx = serde_json::from_value::<ChapterContext>(context.clone()).ok();
        Self::clean_up(ctx.as_ref(), artifacts);
    }
}

/// Register the chapter plan so local pools and queue workers can run it.
pub fn register_plans(registry: FanOutRegistry, tools: Arc<ToolRegistry>) -> FanOutRegistry {
    registry.with_plan(
        CHAPTER_PLAN,
        Arc::new(ChapterConverter::new(tools)),
        Arc::new(ChapterArchiver),
    )
}
