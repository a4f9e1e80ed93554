//! The gateway facade.
//!
//! [`MediaGateway`] turns "a path on some remote server" into bytes served
//! from a bounded local cache: it resolves availability through the remote
//! lister, materializes files through the cache stores (at most one
//! concurrent fetch per key), prepares full and partial responses, derives
//! thumbnails, and keeps the cache consistent across deletes and renames.
//!
//! The gateway performs no tenant authorization and no id decoding; the
//! embedding layer is expected to have resolved both before calling in.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use futures::FutureExt;
use serde::Serialize;

use crate::caching::{CacheKey, CacheStats, Caches};
use crate::config::Config;
use crate::error::GatewayError;
use crate::remote::{
    classify_remote_failure, materialize_video, shell_quote, validate_remote_path,
    validate_segment, CommandChannel, CommandExecutor, RemoteLister, SshChannel,
};
use crate::streaming::{self, PreparedResponse, ServeOptions};
use crate::thumbnails;
use crate::types::{RemoteFileMeta, ServerId};

/// Client-side cache lifetime attached to served video bytes.
const VIDEO_MAX_AGE: Duration = Duration::from_secs(3600);
/// Client-side cache lifetime attached to served thumbnails.
const THUMBNAIL_MAX_AGE: Duration = Duration::from_secs(86400);

/// One entry of a remote listing.
#[derive(Debug, Clone, Serialize)]
pub struct VideoListing {
    pub name: String,
    pub size: u64,
    pub modified: SystemTime,
    pub extension: Option<String>,
    /// The full remote path, ready for id encoding by the caller.
    pub remote_path: String,
}

/// The result of an availability probe.
#[derive(Debug, Clone, Serialize)]
pub struct Availability {
    pub available: bool,
    pub reason: Option<String>,
}

/// Where the bytes of a video stream come from.
///
/// Remote bytes are never proxied directly, so the only implemented source
/// is a locally cached file. The enum is closed: a new source kind is a
/// deliberate API change, not a stringly-typed branch, and callers receive
/// [`GatewayError::UnsupportedStreamType`] for anything they cannot serve.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum StreamSource {
    /// A fully cached local file.
    Local { local_path: PathBuf },
}

impl StreamSource {
    /// The local file backing this stream.
    pub fn local_path(&self) -> &Path {
        match self {
            StreamSource::Local { local_path } => local_path,
        }
    }
}

/// A playable video, materialized locally.
#[derive(Debug, Clone)]
pub struct VideoStream {
    pub source: StreamSource,
    /// Whether the file was already cached when the request arrived.
    pub cached: bool,
}

/// The outcome of a rename.
#[derive(Debug, Clone, Serialize)]
pub struct RenamedVideo {
    pub old_name: String,
    pub new_name: String,
    pub new_path: String,
}

/// Aggregate statistics over both cache namespaces.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayCacheStatus {
    pub videos: CacheStats,
    pub thumbnails: CacheStats,
}

/// The result of a full cache clear.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ClearOutcome {
    pub removed_files: u64,
}

/// The remote media cache and streaming gateway.
///
/// One instance is constructed by the process entry point and owns the
/// cache stores, the command executor with its per-server session pools,
/// and the remote lister. It is cheap to clone.
#[derive(Clone)]
pub struct MediaGateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    config: Arc<Config>,
    executor: Arc<CommandExecutor>,
    lister: RemoteLister,
    caches: Caches,
}

impl MediaGateway {
    /// Creates a gateway talking SSH to the configured servers.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let channel = Arc::new(SshChannel::new(Arc::clone(&config)));
        Self::build(config, channel)
    }

    /// Creates a gateway on top of an arbitrary command channel.
    pub fn with_channel(config: Config, channel: Arc<dyn CommandChannel>) -> anyhow::Result<Self> {
        Self::build(Arc::new(config), channel)
    }

    fn build(config: Arc<Config>, channel: Arc<dyn CommandChannel>) -> anyhow::Result<Self> {
        let caches = Caches::from_config(&config).context("failed to create cache directories")?;
        caches
            .clear_tmp(&config)
            .context("failed to clear cache temp directory")?;

        let executor = Arc::new(CommandExecutor::new(channel, &config));
        let lister = RemoteLister::new(Arc::clone(&config), Arc::clone(&executor));

        Ok(MediaGateway {
            inner: Arc::new(GatewayInner {
                config,
                executor,
                lister,
                caches,
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Enumerates an owner's videos, optionally inside a sub folder of
    /// their media directory.
    pub async fn list_videos(
        &self,
        server: ServerId,
        owner: &str,
        folder: Option<&str>,
    ) -> Result<Vec<VideoListing>, GatewayError> {
        validate_segment(owner)?;

        let mut directory = format!(
            "{}/{owner}",
            self.inner.config.media_root.trim_end_matches('/')
        );
        if let Some(folder) = folder {
            for segment in folder.split('/').filter(|s| !s.is_empty()) {
                validate_segment(segment)?;
                directory.push('/');
                directory.push_str(segment);
            }
        }

        let entries = self.inner.lister.list(server, &directory).await?;
        Ok(entries
            .into_iter()
            .map(|meta| {
                let remote_path = format!("{directory}/{}", meta.name);
                VideoListing {
                    name: meta.name,
                    size: meta.size,
                    modified: meta.modified,
                    extension: meta.extension,
                    remote_path,
                }
            })
            .collect())
    }

    /// Reports whether a remote video currently exists.
    pub async fn check_availability(
        &self,
        server: ServerId,
        remote_path: &str,
    ) -> Result<Availability, GatewayError> {
        match self.inner.lister.stat(server, remote_path).await {
            Ok(_) => Ok(Availability {
                available: true,
                reason: None,
            }),
            Err(GatewayError::RemoteNotFound) => Ok(Availability {
                available: false,
                reason: Some("file not found on remote server".into()),
            }),
            Err(GatewayError::PermissionDenied(detail)) => Ok(Availability {
                available: false,
                reason: Some(detail),
            }),
            Err(err) => Err(err),
        }
    }

    /// Fetches metadata for one remote video.
    pub async fn video_info(
        &self,
        server: ServerId,
        remote_path: &str,
    ) -> Result<RemoteFileMeta, GatewayError> {
        self.inner.lister.stat(server, remote_path).await
    }

    /// Materializes a remote video locally, fetching it at most once per
    /// key no matter how many clients are asking.
    pub async fn fetch_video(
        &self,
        server: ServerId,
        remote_path: &str,
    ) -> Result<VideoStream, GatewayError> {
        let outcome = materialize_video(
            Arc::clone(&self.inner.executor),
            Arc::clone(&self.inner.caches.videos),
            server,
            remote_path,
        )
        .await?;

        tracing::info!(
            %server,
            cached = outcome.hit,
            size = outcome.file.size,
            "serving video"
        );

        Ok(VideoStream {
            source: StreamSource::Local {
                local_path: outcome.file.path,
            },
            cached: outcome.hit,
        })
    }

    /// Fetches a video and prepares a full or byte-range response for it.
    pub async fn serve_video(
        &self,
        server: ServerId,
        remote_path: &str,
        range_header: Option<&str>,
    ) -> Result<PreparedResponse, GatewayError> {
        let stream = self.fetch_video(server, remote_path).await?;
        streaming::prepare_response(
            stream.source.local_path(),
            ServeOptions {
                display_name: basename(remote_path),
                range_header,
                max_age: VIDEO_MAX_AGE,
            },
        )
        .await
    }

    /// Returns the thumbnail image for a video, extracting it at most
    /// once. A ready thumbnail is served without touching the video cache
    /// or the remote server.
    pub async fn thumbnail(
        &self,
        server: ServerId,
        remote_path: &str,
    ) -> Result<PathBuf, GatewayError> {
        let path = validate_remote_path(remote_path)?.to_string();
        let key =
            CacheKey::for_thumbnail(server, &path, self.inner.config.thumbnails.frame_offset);

        let executor = Arc::clone(&self.inner.executor);
        let videos = Arc::clone(&self.inner.caches.videos);
        let thumb_config = self.inner.config.thumbnails.clone();

        let outcome = self
            .inner
            .caches
            .thumbnails
            .get_or_fetch(&key, move |destination| {
                async move {
                    // The full video has to be locally available first.
                    let video = materialize_video(executor, videos, server, &path).await?;
                    thumbnails::extract_frame(&thumb_config, &video.file.path, &destination)
                        .await
                }
                .boxed()
            })
            .await?;

        Ok(outcome.file.path)
    }

    /// Fetches or generates a thumbnail and prepares a response for it.
    pub async fn serve_thumbnail(
        &self,
        server: ServerId,
        remote_path: &str,
    ) -> Result<PreparedResponse, GatewayError> {
        let thumbnail = self.thumbnail(server, remote_path).await?;
        let name = basename(remote_path);
        let display_name = match name.rsplit_once('.') {
            Some((stem, _)) => format!("{stem}.jpg"),
            None => format!("{name}.jpg"),
        };

        streaming::prepare_response(
            &thumbnail,
            ServeOptions {
                display_name: &display_name,
                range_header: None,
                max_age: THUMBNAIL_MAX_AGE,
            },
        )
        .await
    }

    /// Deletes a remote video.
    ///
    /// The cache entries for the key are removed before the deletion is
    /// reported successful. The remote command is never retried; a retry
    /// after partial success could remove a file the caller just
    /// re-created.
    pub async fn delete_video(
        &self,
        server: ServerId,
        remote_path: &str,
    ) -> Result<(), GatewayError> {
        let path = validate_remote_path(remote_path)?;
        let command = format!("rm -- {}", shell_quote(path));
        let output = self.inner.executor.run_destructive(server, &command).await?;
        if !output.success() {
            return Err(classify_remote_failure(&output));
        }

        self.invalidate(server, path);
        tracing::info!(%server, path, "deleted remote video");
        Ok(())
    }

    /// Renames a remote video in place, keeping its extension.
    ///
    /// The cache entry under the old path is invalidated; the new path is
    /// not pre-populated.
    pub async fn rename_video(
        &self,
        server: ServerId,
        remote_path: &str,
        new_name: &str,
    ) -> Result<RenamedVideo, GatewayError> {
        let path = validate_remote_path(remote_path)?;
        let new_name = new_name.trim();
        validate_segment(new_name)?;

        let (parent, old_name) = path
            .rsplit_once('/')
            .ok_or_else(|| GatewayError::InvalidPath(format!("not a file path: {path:?}")))?;
        let new_file_name = match old_name.rsplit_once('.') {
            Some((_, extension)) => format!("{new_name}.{extension}"),
            None => new_name.to_string(),
        };
        let new_path = format!("{parent}/{new_file_name}");

        let command = format!("mv -- {} {}", shell_quote(path), shell_quote(&new_path));
        let output = self.inner.executor.run_destructive(server, &command).await?;
        if !output.success() {
            return Err(classify_remote_failure(&output));
        }

        self.invalidate(server, path);
        tracing::info!(%server, from = path, to = %new_path, "renamed remote video");

        Ok(RenamedVideo {
            old_name: old_name.to_string(),
            new_name: new_file_name,
            new_path,
        })
    }

    /// Aggregate statistics over both cache namespaces.
    pub fn cache_status(&self) -> GatewayCacheStatus {
        GatewayCacheStatus {
            videos: self.inner.caches.videos.status(),
            thumbnails: self.inner.caches.thumbnails.status(),
        }
    }

    /// Clears both cache namespaces, reporting the number of files
    /// removed.
    pub fn clear_cache(&self) -> Result<ClearOutcome, GatewayError> {
        let removed_files = self.inner.caches.clear()?;
        Ok(ClearOutcome { removed_files })
    }

    fn invalidate(&self, server: ServerId, path: &str) {
        self.inner
            .caches
            .videos
            .invalidate(&CacheKey::for_video(server, path));
        self.inner.caches.thumbnails.invalidate(&CacheKey::for_thumbnail(
            server,
            path,
            self.inner.config.thumbnails.frame_offset,
        ));
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
