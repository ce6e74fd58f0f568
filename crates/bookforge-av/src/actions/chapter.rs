//! Export one chapter of an AAX container as a tagged MP3.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bookforge_common::Result;
use serde::{Deserialize, Serialize};

use crate::command::{RunOutcome, ToolCommand};
use crate::probe::Chapter;
use crate::progress::FfmpegProgress;
use crate::tools::ToolRegistry;

const CHAPTER_TIMEOUT: Duration = Duration::from_secs(2 * 3600);

/// Everything needed to convert one chapter, independent of other chapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterJob {
    pub input: PathBuf,
    pub activation_bytes: String,
    pub chapter: Chapter,
    pub total_chapters: usize,
    /// Container tags copied onto every chapter file.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub output_dir: PathBuf,
    pub bitrate: String,
    /// Still image embedded as the front cover of the chapter file.
    #[serde(default)]
    pub cover: Option<PathBuf>,
}

/// `NNN_<title>.mp3` with path-hostile characters replaced.
///
/// The zero-padded prefix keeps directory listings in chapter order.
pub fn chapter_file_name(chapter: &Chapter) -> String {
    let title: String = chapter
        .title
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    format!("{:03}_{}.mp3", chapter.index + 1, title.trim())
}

/// Convert `job.chapter` into an MP3 inside `job.output_dir`.
///
/// Returns the outcome and the path the MP3 was written to. Progress and
/// abort work as in [`crate::convert_to_m4b`].
pub async fn convert_chapter(
    tools: &ToolRegistry,
    job: &ChapterJob,
    mut on_progress: impl FnMut(f64) -> bool,
) -> Result<(RunOutcome, PathBuf)> {
    let ffmpeg = tools.require("ffmpeg")?;
    let output = job.output_dir.join(chapter_file_name(&job.chapter));
    let chapter = &job.chapter;

    tracing::debug!(
        chapter = chapter.index,
        title = %chapter.title,
        output = %output.display(),
        "Chapter export"
    );

    let mut cmd = ToolCommand::new(ffmpeg.to_path_buf());
    cmd.timeout(CHAPTER_TIMEOUT);
    cmd.args(ffmpeg_args(job, &output));

    let mut progress = FfmpegProgress::new(Some(chapter.duration_secs()));
    let outcome = cmd
        .execute_streaming(|line| match progress.feed(line) {
            Some(fraction) => on_progress(fraction),
            None => true,
        })
        .await?;

    Ok((outcome, output))
}

fn ffmpeg_args(job: &ChapterJob, output: &Path) -> Vec<String> {
    let chapter = &job.chapter;
    let mut args: Vec<String> = ["-y", "-nostats", "-progress", "pipe:1"]
        .map(String::from)
        .into();
    args.extend(["-activation_bytes".into(), job.activation_bytes.clone()]);
    args.extend(["-ss".into(), format!("{:.6}", chapter.start_secs)]);
    args.extend(["-t".into(), format!("{:.6}", chapter.duration_secs())]);
    args.extend(["-i".into(), path_arg(&job.input)]);

    // Only the audio of the container; the cover comes from its own input.
    args.extend(["-map".into(), "0:a".into()]);
    if let Some(cover) = &job.cover {
        args.extend(["-i".into(), path_arg(cover)]);
        args.extend(
            [
                "-map", "1:v", "-c:v", "copy", "-disposition:v", "attached_pic",
                "-id3v2_version", "3", "-metadata:s:v", "title=Album cover",
                "-metadata:s:v", "comment=Cover (front)",
            ]
            .map(String::from),
        );
    }
    args.extend(["-map_chapters", "-1", "-c:a", "libmp3lame"].map(String::from));
    args.extend(["-b:a".into(), job.bitrate.clone()]);
    for (key, value) in tag_args(job) {
        args.extend(["-metadata".to_string(), format!("{key}={value}")]);
    }
    args.push(path_arg(output));
    args
}

fn path_arg(p: &Path) -> String {
    p.to_string_lossy().to_string()
}

fn tag_args(job: &ChapterJob) -> Vec<(String, String)> {
    let mut tags = Vec::new();
    for key in ["artist", "album_artist", "genre", "date", "copyright"] {
        if let Some(v) = job.tags.get(key) {
            tags.push((key.to_string(), v.clone()));
        }
    }
    let album = job
        .tags
        .get("album")
        .or_else(|| job.tags.get("title"))
        .cloned();
    if let Some(album) = album {
        tags.push(("album".into(), album));
    }
    tags.push(("title".into(), job.chapter.title.clone()));
    tags.push((
        "track".into(),
        format!("{}/{}", job.chapter.index + 1, job.total_chapters),
    ));
    tags
}
