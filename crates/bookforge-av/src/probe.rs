//! ffprobe-based audiobook inspection.
//!
//! Shells out to `ffprobe -print_format json -show_format -show_chapters`
//! and maps the JSON into [`AudiobookInfo`].

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use bookforge_common::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::command::ToolCommand;
use crate::tools::ToolRegistry;

const PROBE_TIMEOUT: Duration = Duration::from_secs(120);

/// One chapter marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub index: usize,
    pub title: String,
    pub start_secs: f64,
    pub end_secs: f64,
}

impl Chapter {
    pub fn duration_secs(&self) -> f64 {
        (self.end_secs - self.start_secs).max(0.0)
    }
}

/// What the conversion actions need to know about a source file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AudiobookInfo {
    pub duration_secs: Option<f64>,
    pub chapters: Vec<Chapter>,
    /// Container tags (title, artist, album, ...), keys lower-cased.
    pub tags: BTreeMap<String, String>,
}

/// Probe `input`, decrypting with `activation_bytes` when given.
pub async fn probe_audiobook(
    tools: &ToolRegistry,
    input: &Path,
    activation_bytes: Option<&str>,
) -> Result<AudiobookInfo> {
    let ffprobe = tools.require("ffprobe")?;

    let mut cmd = ToolCommand::new(ffprobe.to_path_buf());
    cmd.timeout(PROBE_TIMEOUT);
    cmd.args(["-v", "quiet"]);
    if let Some(bytes) = activation_bytes {
        cmd.args(["-activation_bytes", bytes]);
    }
    cmd.args(["-i"]);
    cmd.arg(input.to_string_lossy().as_ref());
    cmd.args(["-print_format", "json", "-show_format", "-show_chapters"]);

    let output = cmd.execute().await?;
    parse_probe_json(&output.stdout)
}

// ---------------------------------------------------------------------------
// ffprobe JSON
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ProbeJson {
    #[serde(default)]
    format: Option<FormatJson>,
    #[serde(default)]
    chapters: Vec<ChapterJson>,
}

#[derive(Deserialize)]
struct FormatJson {
    duration: Option<String>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct ChapterJson {
    start_time: Option<String>,
    end_time: Option<String>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
}

/// Parse ffprobe's JSON output.
pub fn parse_probe_json(json: &str) -> Result<AudiobookInfo> {
    let probe: ProbeJson = serde_json::from_str(json)
        .map_err(|e| Error::tool("ffprobe", format!("unparseable output: {e}")))?;

    let (duration_secs, tags) = match probe.format {
        Some(f) => (
            f.duration.as_deref().and_then(|d| d.parse::<f64>().ok()),
            f.tags
                .into_iter()
                .map(|(k, v)| (k.to_lowercase(), v))
                .collect(),
        ),
        None => (None, BTreeMap::new()),
    };

    let chapters = probe
        .chapters
        .into_iter()
        .enumerate()
        .filter_map(|(index, c)| {
            let start_secs = c.start_time.as_deref()?.parse::<f64>().ok()?;
            let end_secs = c.end_time.as_deref()?.parse::<f64>().ok()?;
            let title = c
                .tags
                .get("title")
                .cloned()
                .unwrap_or_else(|| format!("Chapter {}", index + 1));
            Some(Chapter {
                index,
                title,
                start_secs,
                end_secs,
            })
        })
        .collect();

    Ok(AudiobookInfo {
        duration_secs,
        chapters,
        tags,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "chapters": [
            {"id": 0, "start_time": "0.000000", "end_time": "610.500000", "tags": {"title": "Opening Credits"}},
            {"id": 1, "start_time": "610.500000", "end_time": "1800.000000", "tags": {}}
        ],
        "format": {
            "duration": "1800.000000",
            "tags": {"Title": "The Book", "artist": "Some Author"}
        }
    }"#;

    #[test]
    fn parses_chapters_duration_and_tags() {
        let info = parse_probe_json(SAMPLE).unwrap();
        assert_eq!(info.duration_secs, Some(1800.0));
        assert_eq!(info.chapters.len(), 2);
        assert_eq!(info.chapters[0].title, "Opening Credits");
        assert_eq!(info.chapters[1].title, "Chapter 2");
        assert_eq!(info.chapters[1].index, 1);
        assert!((info.chapters[0].duration_secs() - 610.5).abs() < 1e-9);
        assert_eq!(info.tags.get("title").map(String::as_str), Some("The Book"));
    }

    #[test]
    fn empty_output_has_no_chapters() {
        let info = parse_probe_json("{}").unwrap();
        assert!(info.chapters.is_empty());
        assert_eq!(info.duration_secs, None);
    }

    #[test]
    fn garbage_is_tool_error() {
        let err = parse_probe_json("Invalid data found").unwrap_err();
        assert!(matches!(err, Error::Tool { .. }));
    }

    #[tokio::test]
    async fn probe_requires_ffprobe() {
        let err = probe_audiobook(&ToolRegistry::default(), Path::new("/x.aax"), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ffprobe"));
    }
}
