//! Whole-book M4B conversion.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bookforge_av::probe::probe_audiobook;
use bookforge_av::{convert_to_m4b, RunOutcome};

use super::{stem, ConversionSettings};
use crate::jobs::{ConversionJob, JobOutcome, ProgressChannel, ProgressReporter};

pub struct M4bConversion {
    settings: ConversionSettings,
    input: PathBuf,
    activation_bytes: String,
}

impl M4bConversion {
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

    pub fn output_path(&self) -> anyhow::Result<PathBuf> {
        Ok(self
            .settings
            .output_dir
            .join(format!("{}.m4b", stem(&self.input)?)))
    }

    async fn convert(&self, output: &Path, progress: &ProgressChannel) -> anyhow::Result<JobOutcome> {
        let tools = &self.settings.tools;
        std::fs::create_dir_all(&self.settings.output_dir)?;
        if output.exists() {
            tracing::debug!(output = %output.display(), "Removing previous output");
            std::fs::remove_file(output)?;
        }

        let info = probe_audiobook(tools, &self.input, Some(self.activation_bytes.as_str())).await?;
        if !progress.report(0.0) {
            return Ok(JobOutcome::Cancelled);
        }

        let outcome = convert_to_m4b(
            tools,
            &self.input,
            output,
            &self.activation_bytes,
            info.duration_secs,
            |fraction| progress.report(fraction * 100.0),
        )
        .await?;

        match outcome {
            RunOutcome::Completed => Ok(JobOutcome::Converted(output.display().to_string())),
            RunOutcome::Aborted => Ok(JobOutcome::Cancelled),
        }
    }
}

#[async_trait]
impl ConversionJob for M4bConversion {
    async fn run(&self, progress: &ProgressChannel) -> JobOutcome {
        let output = match self.output_path() {
            Ok(output) => output,
            Err(e) => return JobOutcome::Failed(e.to_string()),
        };

        let outcome = match self.convert(&output, progress).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(input = %self.input.display(), error = %e, "M4B conversion failed");
                JobOutcome::Failed(e.to_string())
            }
        };

        if !matches!(outcome, JobOutcome::Converted(_)) && output.exists() {
            let _ = std::fs::remove_file(&output);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversion::testing::{fake_tool, FFMPEG_OK, PROBE_NO_CHAPTERS};
    use crate::jobs::JobStore;
    use bookforge_av::ToolRegistry;
    use bookforge_common::{ConversionKind, JobKey, JobStatus};
    use bookforge_db::pool::init_memory_pool;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn setup(dir: &std::path::Path, ffmpeg: &str) -> (M4bConversion, ProgressChannel, CancellationToken) {
        let tools = ToolRegistry::with_paths([
            ("ffprobe", fake_tool(dir, "ffprobe", PROBE_NO_CHAPTERS)),
            ("ffmpeg", fake_tool(dir, "ffmpeg", ffmpeg)),
        ]);
        let settings = ConversionSettings {
            tools: Arc::new(tools),
            output_dir: dir.join("out"),
            work_dir: dir.join("work"),
            mp3_bitrate: "64k".into(),
        };
        let job = M4bConversion::new(settings, dir.join("book.aax"), "deadbeef");

        let store = JobStore::new(init_memory_pool().unwrap());
        let key = JobKey::new("book.aax", ConversionKind::FullConvert);
        store.upsert_starting(&key).unwrap();
        let token = CancellationToken::new();
        (job, ProgressChannel::new(store, key, token.clone()), token)
    }

    #[tokio::test]
    async fn converts_into_output_dir_and_reports_progress() {
        let dir = tempfile::tempdir().unwrap();
        let (job, channel, _token) = setup(dir.path(), FFMPEG_OK);

        let outcome = job.run(&channel).await;
        let expected = dir.path().join("out").join("book.m4b");
        assert_matches::assert_matches!(outcome, JobOutcome::Converted(ref p) if p == &expected.display().to_string());
        assert!(expected.exists());

        let rec = channel.store().get(channel.key()).unwrap();
        assert_eq!(rec.status, JobStatus::Converting);
        assert_eq!(rec.progress, 100.0);
    }

    #[tokio::test]
    async fn tool_failure_is_reported_and_output_removed() {
        let dir = tempfile::tempdir().unwrap();
        let (job, channel, _token) = setup(
            dir.path(),
            "for last; do :; done\necho partial > \"$last\"\necho 'Invalid data found' >&2\nexit 1",
        );

        let outcome = job.run(&channel).await;
        assert_matches::assert_matches!(outcome, JobOutcome::Failed(ref msg) if msg.contains("Invalid data found"));
        assert!(!dir.path().join("out").join("book.m4b").exists());
    }

    #[tokio::test]
    async fn shutdown_cancels_before_ffmpeg_starts() {
        let dir = tempfile::tempdir().unwrap();
        let (job, channel, token) = setup(dir.path(), FFMPEG_OK);
        token.cancel();

        assert_matches::assert_matches!(job.run(&channel).await, JobOutcome::Cancelled);
        assert!(!dir.path().join("out").join("book.m4b").exists());
    }
}
