//! External tool detection.
//!
//! The [`ToolRegistry`] discovers and caches the locations of ffmpeg and
//! ffprobe and provides lookup methods for the rest of the crate.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use bookforge_common::config::ToolsConfig;
use bookforge_common::{Error, Result};
use serde::Serialize;

/// Known tool names that the registry manages.
const KNOWN_TOOLS: &[&str] = &["ffmpeg", "ffprobe"];

/// Availability information for a tool, returned by [`ToolRegistry::check_all`].
#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub available: bool,
    /// First line of `-version` output, if available.
    pub version: Option<String>,
    pub path: Option<PathBuf>,
}

/// Registry holding discovered tool paths.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, PathBuf>,
}

impl ToolRegistry {
    /// Discover tools from config overrides or `PATH`.
    ///
    /// A configured path is used when it exists; otherwise [`which::which`]
    /// searches `PATH`. Tools that are not found are omitted.
    pub fn discover(config: &ToolsConfig) -> Self {
        let mut tools = HashMap::new();

        for &name in KNOWN_TOOLS {
            let custom = match name {
                "ffmpeg" => config.ffmpeg_path.as_deref(),
                "ffprobe" => config.ffprobe_path.as_deref(),
                _ => None,
            };

            let resolved = match custom {
                Some(p) if p.exists() => Some(p.to_path_buf()),
                Some(p) => {
                    tracing::warn!(tool = name, path = %p.display(), "Configured tool path missing; searching PATH");
                    which::which(name).ok()
                }
                None => which::which(name).ok(),
            };

            if let Some(path) = resolved {
                tracing::debug!(tool = name, path = %path.display(), "Discovered tool");
                tools.insert(name.to_string(), path);
            }
        }

        Self { tools }
    }

    /// Build a registry from explicit paths.
    pub fn with_paths(paths: impl IntoIterator<Item = (&'static str, PathBuf)>) -> Self {
        Self {
            tools: paths
                .into_iter()
                .map(|(name, path)| (name.to_string(), path))
                .collect(),
        }
    }

    /// Path of the named tool, or [`Error::Tool`] if it was not discovered.
    pub fn require(&self, name: &str) -> Result<&Path> {
        self.tools.get(name).map(PathBuf::as_path).ok_or_else(|| {
            Error::tool(name, format!("{name} not found; is it installed and in PATH?"))
        })
    }

    /// Check all known tools and return availability information.
    pub fn check_all(&self) -> Vec<ToolInfo> {
        KNOWN_TOOLS
            .iter()
            .map(|&name| match self.tools.get(name) {
                Some(path) => ToolInfo {
                    name: name.to_string(),
                    available: true,
                    version: detect_version(path),
                    path: Some(path.clone()),
                },
                None => ToolInfo {
                    name: name.to_string(),
                    available: false,
                    version: None,
                    path: None,
                },
            })
            .collect()
    }
}

/// Run `<tool> -version` and return the first line of stdout.
fn detect_version(path: &Path) -> Option<String> {
    let output = std::process::Command::new(path)
        .arg("-version")
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .map(|s| s.to_string())
}
