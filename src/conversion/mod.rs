//! Audiobook conversion job bodies.
//!
//! These plug the `bookforge-av` actions into the job engine:
//!
//! - [`M4bConversion`]: whole-book decrypt into a single M4B.
//! - [`ChapteredConversion`]: one MP3 per chapter, fanned out under the
//!   [`CHAPTER_PLAN`] plan and bundled into a zip by [`ChapterArchiver`].

mod chapters;
mod m4b;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bookforge_av::ToolRegistry;
use bookforge_common::config::ConversionConfig;

pub use chapters::{
    register_plans, ChapterArchiver, ChapterContext, ChapterConverter, ChapteredConversion,
    CHAPTER_PLAN,
};
pub use m4b::M4bConversion;

/// Shared settings for every conversion job body.
#[derive(Clone)]
pub struct ConversionSettings {
    pub tools: Arc<ToolRegistry>,
    pub output_dir: PathBuf,
    pub work_dir: PathBuf,
    pub mp3_bitrate: String,
}

impl ConversionSettings {
    pub fn from_config(config: &ConversionConfig, tools: Arc<ToolRegistry>) -> Self {
        Self {
            tools,
            output_dir: config.output_dir.clone(),
            work_dir: config.work_dir.clone(),
            mp3_bitrate: config.mp3_bitrate.clone(),
        }
    }
}

/// File stem of `input`, used to name outputs.
fn stem(input: &Path) -> anyhow::Result<String> {
    input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow::anyhow!("input has no file name: {}", input.display()))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::path::{Path, PathBuf};

    /// Write an executable shell script standing in for an external tool.
    pub fn fake_tool(dir: &Path, name: &str, script: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    pub const PROBE_WITH_CHAPTERS: &str = r#"cat <<'JSON'
{"format":{"duration":"30.0","tags":{"title":"The Book","artist":"Some Author"}},
 "chapters":[
  {"start_time":"0.0","end_time":"10.0","tags":{"title":"Opening"}},
  {"start_time":"10.0","end_time":"20.0","tags":{"title":"Middle"}},
  {"start_time":"20.0","end_time":"30.0","tags":{"title":"End"}}
 ]}
JSON"#;

    pub const PROBE_NO_CHAPTERS: &str = r#"echo '{"format":{"duration":"30.0"},"chapters":[]}'"#;

    /// Prints one progress block and writes the last argument as the output file.
    pub const FFMPEG_OK: &str = r#"for last; do :; done
printf 'out_time_us=5000000\nprogress=continue\nprogress=end\n'
echo data > "$last""#;
}
