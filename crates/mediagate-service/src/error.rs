use std::time::Duration;

use thiserror::Error;

/// An error produced while resolving, fetching, caching or serving a remote
/// video.
///
/// The enum is `Clone` because a single failed fetch is shared with every
/// caller waiting on the same cache key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// The remote command channel could not be established or broke down.
    #[error("connection failed: {0}")]
    Connection(String),
    /// A remote command did not complete within the configured bound.
    #[error("remote command timed out after {0:?}")]
    CommandTimeout(Duration),
    /// The remote file or directory does not exist.
    #[error("not found on remote server")]
    RemoteNotFound,
    /// The remote side rejected the operation.
    ///
    /// The attached string contains the remote error output.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// A caller-supplied remote path failed validation and was never sent
    /// to the remote side.
    #[error("invalid remote path: {0}")]
    InvalidPath(String),
    /// Extracting a still frame from the cached video failed.
    ///
    /// The attached string contains the tail of the extractor's stderr.
    #[error("thumbnail extraction failed: {0}")]
    ThumbnailFailed(String),
    /// A stream source other than a locally cached file was requested.
    #[error("unsupported stream type: {0}")]
    UnsupportedStreamType(String),
    /// An unexpected error inside the gateway itself.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Whether a retry of the same command could plausibly succeed.
    ///
    /// Only broken connections qualify; structural errors like
    /// [`RemoteNotFound`](Self::RemoteNotFound) are stable and timeouts
    /// already consumed their full per-command budget.
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Connection(_))
    }

    #[track_caller]
    pub(crate) fn internal<E: std::error::Error + 'static>(err: E) -> Self {
        let dynerr: &dyn std::error::Error = &err;
        tracing::error!(error = dynerr);
        GatewayError::Internal(err.to_string())
    }
}

impl From<std::io::Error> for GatewayError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::internal(err)
    }
}

impl From<russh::Error> for GatewayError {
    fn from(err: russh::Error) -> Self {
        GatewayError::Connection(err.to_string())
    }
}
