//! Remote command execution.
//!
//! Remote servers are reachable only through a command channel: a transport
//! that executes a single shell-style command against a named server and
//! returns output and exit status. Everything the gateway knows about a
//! remote file system it learns through this channel, and every byte it
//! caches arrives through it.
//!
//! The [`CommandChannel`] trait is that capability; [`SshChannel`] is the
//! production implementation. [`CommandExecutor`] layers the execution
//! policy on top: per-server session pools, per-command timeouts, and
//! bounded retries for transient connection failures. Commands with remote
//! side effects are never retried.
//!
//! Caller-supplied paths are validated and quoted in [`paths`] before they
//! may appear in a command line. This is a hard contract: an unvalidated
//! path is a command injection.

use std::sync::Arc;

use futures::FutureExt;

use crate::caching::{CacheKey, CacheOutcome, CacheStore};
use crate::error::GatewayError;
use crate::types::ServerId;

mod executor;
mod lister;
mod paths;

pub use executor::{CommandChannel, CommandExecutor, CommandOutput, SshChannel};
pub use lister::RemoteLister;
pub use paths::{shell_quote, validate_remote_path, validate_segment};

/// Interprets a failed remote command.
///
/// The remote shell reports problems through exit codes and stderr text;
/// this maps the well-known patterns onto the gateway's error taxonomy.
pub(crate) fn classify_remote_failure(output: &CommandOutput) -> GatewayError {
    let detail = if output.stderr.trim().is_empty() {
        output.stdout.trim()
    } else {
        output.stderr.trim()
    };

    if detail.contains("No such file or directory") {
        return GatewayError::RemoteNotFound;
    }
    if detail.contains("Permission denied") || detail.contains("Operation not permitted") {
        return GatewayError::PermissionDenied(detail.to_string());
    }
    GatewayError::Internal(format!(
        "remote command failed with exit code {}: {detail}",
        output.exit_code
    ))
}

/// Materializes a remote video in the local cache.
///
/// The transfer streams the file over the command channel into the cache
/// store's temp file; the store handles single-flight deduplication and
/// atomic promotion.
pub(crate) async fn materialize_video(
    executor: Arc<CommandExecutor>,
    videos: Arc<CacheStore>,
    server: ServerId,
    remote_path: &str,
) -> Result<CacheOutcome, GatewayError> {
    let path = validate_remote_path(remote_path)?.to_string();
    let key = CacheKey::for_video(server, &path);

    videos
        .get_or_fetch(&key, move |destination| {
            async move {
                let command = format!("cat -- {}", shell_quote(&path));
                let output = executor.fetch_to_file(server, &command, &destination).await?;
                if !output.success() {
                    return Err(classify_remote_failure(&output));
                }
                Ok(())
            }
            .boxed()
        })
        .await
}
