use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::Config;
use crate::error::GatewayError;
use crate::types::{RemoteFileMeta, ServerId};

use super::executor::CommandExecutor;
use super::paths::{shell_quote, validate_remote_path};
use super::classify_remote_failure;

/// Enumerates and probes video files on remote servers.
///
/// Listing output is parsed leniently: lines that do not look like regular
/// files are skipped, never fatal.
pub struct RemoteLister {
    config: Arc<Config>,
    executor: Arc<CommandExecutor>,
}

impl RemoteLister {
    pub fn new(config: Arc<Config>, executor: Arc<CommandExecutor>) -> Self {
        RemoteLister { config, executor }
    }

    /// Enumerates the video files in a remote directory.
    pub async fn list(
        &self,
        server: ServerId,
        directory: &str,
    ) -> Result<Vec<RemoteFileMeta>, GatewayError> {
        let directory = validate_remote_path(directory)?;
        let command = format!("ls -lA --time-style=+%s -- {}", shell_quote(directory));
        let output = self.executor.run(server, &command).await?;
        if !output.success() {
            return Err(classify_remote_failure(&output));
        }

        let mut files = Vec::new();
        for line in output.stdout.lines() {
            let Some(meta) = parse_listing_line(line) else {
                continue;
            };
            if matches!(&meta.extension, Some(ext) if self.config.is_video_extension(ext)) {
                files.push(meta);
            }
        }

        tracing::debug!(%server, directory, count = files.len(), "listed remote videos");
        Ok(files)
    }

    /// Probes a single remote file.
    pub async fn stat(
        &self,
        server: ServerId,
        path: &str,
    ) -> Result<RemoteFileMeta, GatewayError> {
        let path = validate_remote_path(path)?;
        let command = format!("stat -c '%s %Y' -- {}", shell_quote(path));
        let output = self.executor.run(server, &command).await?;
        if !output.success() {
            return Err(classify_remote_failure(&output));
        }

        let name = path.rsplit('/').next().unwrap_or(path).to_string();
        let (size, modified) = parse_stat_output(&output.stdout).ok_or_else(|| {
            GatewayError::Internal(format!(
                "unparsable stat output: {:?}",
                output.stdout.trim()
            ))
        })?;

        Ok(RemoteFileMeta {
            extension: RemoteFileMeta::extension_of(&name),
            name,
            size,
            modified,
        })
    }
}

/// Parses one line of `ls -lA --time-style=+%s` output.
///
/// Returns `None` for the `total` line, directories, symlinks and anything
/// else that does not match the expected shape.
fn parse_listing_line(line: &str) -> Option<RemoteFileMeta> {
    let mut rest = line;

    let mode = split_field(&mut rest)?;
    // Regular files only.
    if !mode.starts_with('-') {
        return None;
    }
    let _links = split_field(&mut rest)?;
    let _owner = split_field(&mut rest)?;
    let _group = split_field(&mut rest)?;
    let size: u64 = split_field(&mut rest)?.parse().ok()?;
    let epoch: u64 = split_field(&mut rest)?.parse().ok()?;

    // Whatever remains is the file name, spaces included.
    let name = rest.strip_prefix(' ').unwrap_or(rest.trim_start());
    if name.is_empty() {
        return None;
    }

    Some(RemoteFileMeta {
        name: name.to_string(),
        size,
        modified: UNIX_EPOCH + Duration::from_secs(epoch),
        extension: RemoteFileMeta::extension_of(name),
    })
}

fn split_field<'a>(rest: &mut &'a str) -> Option<&'a str> {
    let trimmed = rest.trim_start();
    let end = trimmed
        .find(char::is_whitespace)
        .unwrap_or(trimmed.len());
    let (field, remainder) = trimmed.split_at(end);
    *rest = remainder;
    if field.is_empty() {
        None
    } else {
        Some(field)
    }
}

fn parse_stat_output(stdout: &str) -> Option<(u64, SystemTime)> {
    let mut fields = stdout.split_whitespace();
    let size: u64 = fields.next()?.parse().ok()?;
    let epoch: u64 = fields.next()?.parse().ok()?;
    Some((size, UNIX_EPOCH + Duration::from_secs(epoch)))
}
