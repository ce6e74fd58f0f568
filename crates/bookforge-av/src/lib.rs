//! # bookforge-av
//!
//! External tool plumbing for audiobook conversion.
//!
//! This crate provides:
//!
//! - **Tool discovery** ([`ToolRegistry`]) -- find and cache paths to ffmpeg
//!   and ffprobe.
//! - **Command execution** ([`ToolCommand`]) -- async builder with timeout
//!   support, plus a line-streaming mode whose callback can abort the process.
//! - **Progress parsing** ([`FfmpegProgress`]) -- turn `-progress` key/value
//!   blocks into completion fractions.
//! - **Probing** ([`probe::probe_audiobook`]) -- duration, chapters and tags.
//! - **Actions** ([`actions`]) -- whole-book M4B decrypt and per-chapter MP3.
//! - **Archiving** ([`archive::write_zip`]) -- bundle chapter files.

pub mod actions;
pub mod archive;
pub mod command;
pub mod probe;
pub mod progress;
pub mod tools;

// ---- Re-exports for convenience ----

pub use actions::{convert_chapter, convert_to_m4b, extract_cover, ChapterJob};
pub use command::{RunOutcome, ToolCommand, ToolOutput};
pub use probe::{AudiobookInfo, Chapter};
pub use progress::FfmpegProgress;
pub use tools::{ToolInfo, ToolRegistry};
