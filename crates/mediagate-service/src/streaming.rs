//! Serving cached files with HTTP byte-range semantics.
//!
//! This prepares everything a response needs (status, headers, a lazy byte
//! source) without being tied to a particular HTTP framework; the embedding
//! router copies the fields into its own response type.

use std::io;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use crate::error::GatewayError;

/// An inclusive byte range within a file of known size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered; inclusive bounds, so never zero.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Parses a `Range` header against a file of `size` bytes.
///
/// Supported forms are `bytes=start-end` and `bytes=start-`; `end` is
/// clamped to the last byte when it exceeds the file. Anything else,
/// including a start at or beyond the end of the file, returns `None` and
/// the caller falls back to a full response rather than failing.
pub fn parse_range(header: &str, size: u64) -> Option<ByteRange> {
    if size == 0 {
        return None;
    }

    let value = header.strip_prefix("bytes=")?;
    let (start, end) = value.split_once('-')?;

    let start: u64 = start.trim().parse().ok()?;
    let end = match end.trim() {
        "" => size - 1,
        end => end.parse::<u64>().ok()?.min(size - 1),
    };

    if start >= size || start > end {
        return None;
    }
    Some(ByteRange { start, end })
}

/// Guesses a content type from a file name.
pub fn content_type_for(name: &str) -> &'static str {
    let extension = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "mpg" | "mpeg" => "video/mpeg",
        "wmv" => "video/x-ms-wmv",
        "flv" => "video/x-flv",
        "ts" => "video/mp2t",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        _ => "application/octet-stream",
    }
}

/// How a cached file should be served.
#[derive(Debug, Clone)]
pub struct ServeOptions<'a> {
    /// File name used for `Content-Disposition` and content-type guessing.
    pub display_name: &'a str,
    /// The raw `Range` header, if the request carried one.
    pub range_header: Option<&'a str>,
    /// Client-side cache lifetime.
    pub max_age: Duration,
}

/// Response headers, ready to be copied into an HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHeaders {
    pub content_type: &'static str,
    pub content_length: u64,
    pub content_range: Option<String>,
    pub accept_ranges: &'static str,
    pub cache_control: String,
    pub content_disposition: String,
}

/// A prepared response: status, headers and a lazy byte source.
#[derive(Debug)]
pub struct PreparedResponse {
    /// 200 for full responses, 206 for ranges.
    pub status: u16,
    pub headers: ResponseHeaders,
    pub body: ByteSource,
}

/// Prepares a full or partial response for a local file.
pub async fn prepare_response(
    local_path: &Path,
    options: ServeOptions<'_>,
) -> Result<PreparedResponse, GatewayError> {
    let size = tokio::fs::metadata(local_path).await?.len();
    let range = options
        .range_header
        .and_then(|header| parse_range(header, size));

    let (status, content_range, body) = match range {
        Some(range) => {
            let body = ByteSource::open(local_path, range.start, range.len()).await?;
            let content_range = format!("bytes {}-{}/{size}", range.start, range.end);
            (206, Some(content_range), body)
        }
        None => (200, None, ByteSource::open(local_path, 0, size).await?),
    };

    Ok(PreparedResponse {
        status,
        headers: ResponseHeaders {
            content_type: content_type_for(options.display_name),
            content_length: body.len(),
            content_range,
            accept_ranges: "bytes",
            cache_control: format!("public, max-age={}", options.max_age.as_secs()),
            content_disposition: format!(
                "inline; filename=\"{}\"",
                options.display_name.replace('"', "")
            ),
        },
        body,
    })
}

/// A lazy, bounded byte stream over an open file.
///
/// The file descriptor is held by the stream and released when the stream
/// is dropped, whether it ran to completion or the client went away
/// mid-response.
#[derive(Debug)]
pub struct ByteSource {
    stream: ReaderStream<tokio::io::Take<tokio::fs::File>>,
    len: u64,
}

impl ByteSource {
    async fn open(path: &Path, start: u64, len: u64) -> io::Result<Self> {
        let mut file = tokio::fs::File::open(path).await?;
        if start > 0 {
            file.seek(io::SeekFrom::Start(start)).await?;
        }
        Ok(ByteSource {
            stream: ReaderStream::new(file.take(len)),
            len,
        })
    }

    /// The number of bytes this source yields in total.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Drains the source into memory. Intended for thumbnails and tests;
    /// video bodies should be forwarded chunk by chunk instead.
    pub async fn collect(mut self) -> io::Result<Vec<u8>> {
        use futures::StreamExt;

        let mut out = Vec::with_capacity(self.len.min(1 << 20) as usize);
        while let Some(chunk) = self.stream.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }
}

impl Stream for ByteSource {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().stream).poll_next(cx)
    }
}
