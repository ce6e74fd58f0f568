//! Decrypt an AAX container into a single M4B without re-encoding.

use std::path::Path;
use std::time::Duration;

use bookforge_common::Result;

use crate::command::{RunOutcome, ToolCommand};
use crate::progress::FfmpegProgress;
use crate::tools::ToolRegistry;

/// Whole books can take a while even as a stream copy.
const M4B_TIMEOUT: Duration = Duration::from_secs(6 * 3600);

/// Decrypt `input` into `output` with a stream copy.
///
/// `on_progress` receives the completion fraction (0.0..=1.0) after each
/// ffmpeg progress block; returning `false` kills ffmpeg and the function
/// returns [`RunOutcome::Aborted`]. An aborted run may leave a partial
/// `output` behind for the caller to remove.
pub async fn convert_to_m4b(
    tools: &ToolRegistry,
    input: &Path,
    output: &Path,
    activation_bytes: &str,
    duration_secs: Option<f64>,
    mut on_progress: impl FnMut(f64) -> bool,
) -> Result<RunOutcome> {
    let ffmpeg = tools.require("ffmpeg")?;

    tracing::info!(input = %input.display(), output = %output.display(), "M4B decrypt");

    let mut cmd = ToolCommand::new(ffmpeg.to_path_buf());
    cmd.timeout(M4B_TIMEOUT);
    cmd.args(["-y", "-nostats", "-progress", "pipe:1"]);
    cmd.args(["-activation_bytes", activation_bytes]);
    cmd.args(["-i"]);
    cmd.arg(input.to_string_lossy().as_ref());
    cmd.args(["-map", "0:a", "-map_metadata", "0", "-map_chapters", "0"]);
    cmd.args(["-c", "copy", "-f", "mp4"]);
    cmd.arg(output.to_string_lossy().as_ref());

    let mut progress = FfmpegProgress::new(duration_secs);
    cmd.execute_streaming(|line| match progress.feed(line) {
        Some(fraction) => on_progress(fraction),
        None => true,
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn requires_ffmpeg() {
        let err = convert_to_m4b(
            &ToolRegistry::default(),
            Path::new("/in.aax"),
            Path::new("/out.m4b"),
            "deadbeef",
            None,
            |_| true,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("ffmpeg not found"));
    }

    #[tokio::test]
    async fn progress_and_abort_flow_through() {
        // A stand-in "ffmpeg" that prints two progress blocks.
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("ffmpeg");
        std::fs::write(
            &fake,
            "#!/bin/sh\nprintf 'out_time_us=5000000\\nprogress=continue\\n'\nprintf 'out_time_us=9000000\\nprogress=continue\\n'\nsleep 30\n",
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let tools = ToolRegistry::with_paths([("ffmpeg", PathBuf::from(&fake))]);

        let mut seen = Vec::new();
        let outcome = convert_to_m4b(
            &tools,
            Path::new("/in.aax"),
            &dir.path().join("out.m4b"),
            "deadbeef",
            Some(10.0),
            |f| {
                seen.push(f);
                seen.len() < 2
            },
        )
        .await;

        if let Ok(outcome) = outcome {
            assert_eq!(outcome, RunOutcome::Aborted);
            assert_eq!(seen, vec![0.5, 0.9]);
        }
    }
}
