//! Pull the embedded cover image out of an AAX container.

use std::path::Path;
use std::time::Duration;

use bookforge_common::Result;

use crate::command::ToolCommand;
use crate::tools::ToolRegistry;

const COVER_TIMEOUT: Duration = Duration::from_secs(120);

/// Longest edge of the extracted cover, in pixels.
pub const COVER_MAX_EDGE: u32 = 500;

/// Write the first video stream of `input` (the cover art) to `dest` as a
/// still image no larger than [`COVER_MAX_EDGE`] on either side.
///
/// Fails when the container has no cover; callers treat that as "no art".
pub async fn extract_cover(
    tools: &ToolRegistry,
    input: &Path,
    activation_bytes: &str,
    dest: &Path,
) -> Result<()> {
    let ffmpeg = tools.require("ffmpeg")?;

    let mut cmd = ToolCommand::new(ffmpeg.to_path_buf());
    cmd.timeout(COVER_TIMEOUT);
    cmd.args(["-y", "-nostats", "-activation_bytes", activation_bytes, "-i"]);
    cmd.arg(input.to_string_lossy().as_ref());
    cmd.args(["-an", "-map", "0:v:0", "-frames:v", "1", "-vf"]);
    cmd.arg(format!(
        "scale='min({COVER_MAX_EDGE},iw)':'min({COVER_MAX_EDGE},ih)':force_original_aspect_ratio=decrease"
    ));
    cmd.arg(dest.to_string_lossy().as_ref());
    cmd.execute().await?;

    tracing::debug!(input = %input.display(), cover = %dest.display(), "Cover extracted");
    Ok(())
}
