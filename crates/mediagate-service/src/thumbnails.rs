//! Thumbnail derivation.
//!
//! A thumbnail is a single still frame extracted from an already cached
//! video file. Extraction shells out to ffmpeg with its own timeout; the
//! resulting image goes through the thumbnail cache store under the same
//! single-flight and atomic-promotion discipline as full videos, so two
//! concurrent requests extract at most once and nobody observes a partial
//! image.

use std::path::Path;

use crate::config::ThumbnailConfig;
use crate::error::GatewayError;

/// Extracts one still frame from `video` into `destination`.
///
/// Any failure (spawn error, timeout, non-zero exit, empty output) is
/// reported as [`GatewayError::ThumbnailFailed`] and leaves no usable
/// destination file behind; the cache store discards the temp file.
pub(crate) async fn extract_frame(
    config: &ThumbnailConfig,
    video: &Path,
    destination: &Path,
) -> Result<(), GatewayError> {
    let offset = format!(
        "{}.{:03}",
        config.frame_offset.as_secs(),
        config.frame_offset.subsec_millis()
    );

    let mut command = tokio::process::Command::new(&config.ffmpeg_path);
    command
        .arg("-y")
        .arg("-loglevel")
        .arg("error")
        .arg("-ss")
        .arg(&offset)
        .arg("-i")
        .arg(video)
        .arg("-frames:v")
        .arg("1")
        .arg("-q:v")
        .arg("2")
        .arg("-f")
        .arg("image2")
        .arg(destination)
        .kill_on_drop(true);

    let output = tokio::time::timeout(config.extraction_timeout, command.output())
        .await
        .map_err(|_| {
            GatewayError::ThumbnailFailed(format!(
                "extraction timed out after {:?}",
                config.extraction_timeout
            ))
        })?
        .map_err(|e| {
            GatewayError::ThumbnailFailed(format!(
                "failed to run {}: {e}",
                config.ffmpeg_path.display()
            ))
        })?;

    if !output.status.success() {
        return Err(GatewayError::ThumbnailFailed(stderr_tail(&output.stderr)));
    }

    // ffmpeg can exit zero without writing a frame, e.g. for a truncated
    // input shorter than the requested offset.
    let size = tokio::fs::metadata(destination)
        .await
        .map(|meta| meta.len())
        .unwrap_or(0);
    if size == 0 {
        return Err(GatewayError::ThumbnailFailed("no frame produced".into()));
    }

    tracing::debug!(video = %video.display(), size, "extracted thumbnail frame");
    Ok(())
}

/// The last few hundred characters of the extractor's stderr, which is
/// where ffmpeg puts the actually useful message.
fn stderr_tail(stderr: &[u8]) -> String {
    const MAX_LEN: usize = 300;

    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.is_empty() {
        return "frame extraction failed".into();
    }

    let start = text.len().saturating_sub(MAX_LEN);
    let start = text
        .char_indices()
        .map(|(i, _)| i)
        .find(|&i| i >= start)
        .unwrap_or(0);
    text[start..].to_string()
}
