use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use mediagate_service::error::GatewayError;
use mediagate_service::types::ServerId;
use mediagate_service::MediaGateway;

use crate::utils::{sample_listing, test_config, Response, ScriptedChannel};

const SERVER: ServerId = ServerId(1);

fn gateway_with(channel: &Arc<ScriptedChannel>, dir: &TempDir) -> MediaGateway {
    MediaGateway::with_channel(test_config(dir), channel.clone()).unwrap()
}

fn pattern_bytes(len: usize) -> Vec<u8> {
    (0..len as u32).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn test_list_videos() {
    let channel = Arc::new(ScriptedChannel::new());
    channel.on("ls -lA", Response::ok(sample_listing()));
    let dir = TempDir::new().unwrap();
    let gateway = gateway_with(&channel, &dir);

    let videos = gateway.list_videos(SERVER, "alice", None).await.unwrap();

    // Only recognized video files survive; noise lines are skipped.
    assert_eq!(videos.len(), 2);
    assert_eq!(videos[0].name, "intro.mp4");
    assert_eq!(videos[0].size, 104857600);
    assert_eq!(videos[0].extension.as_deref(), Some("mp4"));
    assert_eq!(videos[0].remote_path, "/home/alice/intro.mp4");
    assert_eq!(videos[1].name, "season 01 episode 02.mkv");

    // The listed directory is quoted on the command line.
    assert!(channel.commands()[0].contains("'/home/alice'"));
}

#[tokio::test]
async fn test_list_videos_in_folder() {
    let channel = Arc::new(ScriptedChannel::new());
    channel.on("ls -lA", Response::ok(sample_listing()));
    let dir = TempDir::new().unwrap();
    let gateway = gateway_with(&channel, &dir);

    let videos = gateway
        .list_videos(SERVER, "alice", Some("shows/season 01"))
        .await
        .unwrap();
    assert_eq!(
        videos[0].remote_path,
        "/home/alice/shows/season 01/intro.mp4"
    );
}

#[tokio::test]
async fn test_list_videos_rejects_traversal() {
    let channel = Arc::new(ScriptedChannel::new());
    let dir = TempDir::new().unwrap();
    let gateway = gateway_with(&channel, &dir);

    for owner in ["..", "a/b", ""] {
        let err = gateway.list_videos(SERVER, owner, None).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidPath(_)), "{owner:?}");
    }
    let err = gateway
        .list_videos(SERVER, "alice", Some("../bob"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::InvalidPath(_)));

    // Nothing ever reached the channel.
    assert_eq!(channel.attempts(), 0);
}

#[tokio::test]
async fn test_availability() {
    let channel = Arc::new(ScriptedChannel::new());
    channel.on(
        "stat -c",
        Response::fail(
            1,
            "stat: cannot statx '/home/alice/clip.mp4': No such file or directory",
        ),
    );
    let dir = TempDir::new().unwrap();
    let gateway = gateway_with(&channel, &dir);

    let availability = gateway
        .check_availability(SERVER, "/home/alice/clip.mp4")
        .await
        .unwrap();
    assert!(!availability.available);
    assert!(availability.reason.is_some());

    // Newer rules win: the file appears.
    channel.on("stat -c", Response::ok("1048576 1722700000\n"));
    let availability = gateway
        .check_availability(SERVER, "/home/alice/clip.mp4")
        .await
        .unwrap();
    assert!(availability.available);

    let info = gateway
        .video_info(SERVER, "/home/alice/clip.mp4")
        .await
        .unwrap();
    assert_eq!(info.name, "clip.mp4");
    assert_eq!(info.size, 1048576);
}

#[tokio::test]
async fn test_fetch_video_single_flight() {
    let channel = Arc::new(ScriptedChannel::new());
    channel.on_with_delay(
        "cat --",
        Duration::from_millis(100),
        Response::Bytes(pattern_bytes(1000)),
    );
    let dir = TempDir::new().unwrap();
    let gateway = gateway_with(&channel, &dir);
    let path = "/home/alice/clip.mp4";

    let (a, b) = futures::future::join(
        gateway.fetch_video(SERVER, path),
        gateway.fetch_video(SERVER, path),
    )
    .await;
    let (a, b) = (a.unwrap(), b.unwrap());

    // Exactly one transfer happened, both callers share it.
    assert_eq!(channel.stream_calls(), 1);
    assert_eq!(a.source.local_path(), b.source.local_path());
    assert!(!a.cached);
    assert!(!b.cached);

    // The third request is a cache hit.
    let c = gateway.fetch_video(SERVER, path).await.unwrap();
    assert!(c.cached);
    assert_eq!(channel.stream_calls(), 1);
    assert_eq!(
        std::fs::read(c.source.local_path()).unwrap(),
        pattern_bytes(1000)
    );
}

#[tokio::test]
async fn test_fetch_video_not_found() {
    let channel = Arc::new(ScriptedChannel::new());
    channel.on(
        "cat --",
        Response::fail(1, "cat: '/home/alice/gone.mp4': No such file or directory"),
    );
    let dir = TempDir::new().unwrap();
    let gateway = gateway_with(&channel, &dir);

    let err = gateway
        .fetch_video(SERVER, "/home/alice/gone.mp4")
        .await
        .unwrap_err();
    assert_eq!(err, GatewayError::RemoteNotFound);

    // Failures leave no cache entry behind.
    assert_eq!(gateway.cache_status().videos.entry_count, 0);
}

#[tokio::test]
async fn test_serve_video_ranges() {
    let channel = Arc::new(ScriptedChannel::new());
    channel.on("cat --", Response::Bytes(pattern_bytes(1000)));
    let dir = TempDir::new().unwrap();
    let gateway = gateway_with(&channel, &dir);
    let path = "/home/alice/clip.mp4";

    let response = gateway
        .serve_video(SERVER, path, Some("bytes=100-199"))
        .await
        .unwrap();
    assert_eq!(response.status, 206);
    assert_eq!(response.headers.content_length, 100);
    assert_eq!(
        response.headers.content_range.as_deref(),
        Some("bytes 100-199/1000")
    );
    assert_eq!(response.headers.content_type, "video/mp4");
    assert_eq!(
        response.headers.content_disposition,
        "inline; filename=\"clip.mp4\""
    );
    assert_eq!(
        response.body.collect().await.unwrap(),
        pattern_bytes(1000)[100..200].to_vec()
    );

    let response = gateway
        .serve_video(SERVER, path, Some("bytes=abc"))
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.headers.content_length, 1000);
    assert_eq!(response.body.collect().await.unwrap().len(), 1000);

    // Both responses came from the one cached transfer.
    assert_eq!(channel.stream_calls(), 1);
}

#[tokio::test]
async fn test_hostile_path_is_quoted() {
    let channel = Arc::new(ScriptedChannel::new());
    channel.on("cat --", Response::Bytes(vec![1, 2, 3]));
    let dir = TempDir::new().unwrap();
    let gateway = gateway_with(&channel, &dir);

    gateway
        .fetch_video(SERVER, "/home/alice/it's; rm -rf.mp4")
        .await
        .unwrap();

    let command = channel.commands().pop().unwrap();
    assert_eq!(command, r#"cat -- '/home/alice/it'\''s; rm -rf.mp4'"#);
}

#[tokio::test]
async fn test_delete_invalidates_cache() {
    let channel = Arc::new(ScriptedChannel::new());
    channel.on("cat --", Response::Bytes(vec![0u8; 64]));
    channel.on("rm --", Response::ok(""));
    let dir = TempDir::new().unwrap();
    let gateway = gateway_with(&channel, &dir);
    let path = "/home/alice/clip.mp4";

    gateway.fetch_video(SERVER, path).await.unwrap();
    assert_eq!(gateway.cache_status().videos.entry_count, 1);

    gateway.delete_video(SERVER, path).await.unwrap();
    assert!(channel
        .commands()
        .iter()
        .any(|c| c == "rm -- '/home/alice/clip.mp4'"));
    assert_eq!(gateway.cache_status().videos.entry_count, 0);

    // The remote file is gone now.
    channel.on(
        "stat -c",
        Response::fail(1, "stat: cannot statx: No such file or directory"),
    );
    let availability = gateway.check_availability(SERVER, path).await.unwrap();
    assert!(!availability.available);

    // A re-upload under the same path fetches fresh bytes.
    gateway.fetch_video(SERVER, path).await.unwrap();
    assert_eq!(channel.stream_calls(), 2);
}

#[tokio::test]
async fn test_failed_delete_keeps_cache_entry() {
    let channel = Arc::new(ScriptedChannel::new());
    channel.on("cat --", Response::Bytes(vec![0u8; 64]));
    channel.on("rm --", Response::fail(1, "rm: cannot remove: Permission denied"));
    let dir = TempDir::new().unwrap();
    let gateway = gateway_with(&channel, &dir);
    let path = "/home/alice/clip.mp4";

    gateway.fetch_video(SERVER, path).await.unwrap();
    let err = gateway.delete_video(SERVER, path).await.unwrap_err();
    assert!(matches!(err, GatewayError::PermissionDenied(_)));
    assert_eq!(gateway.cache_status().videos.entry_count, 1);
}

#[tokio::test]
async fn test_rename_video() {
    let channel = Arc::new(ScriptedChannel::new());
    channel.on("cat --", Response::Bytes(vec![0u8; 64]));
    channel.on("mv --", Response::ok(""));
    let dir = TempDir::new().unwrap();
    let gateway = gateway_with(&channel, &dir);
    let path = "/home/alice/old name.mp4";

    gateway.fetch_video(SERVER, path).await.unwrap();

    let renamed = gateway
        .rename_video(SERVER, path, " new name ")
        .await
        .unwrap();
    assert_eq!(renamed.old_name, "old name.mp4");
    assert_eq!(renamed.new_name, "new name.mp4");
    assert_eq!(renamed.new_path, "/home/alice/new name.mp4");
    assert!(channel
        .commands()
        .iter()
        .any(|c| c == "mv -- '/home/alice/old name.mp4' '/home/alice/new name.mp4'"));

    // The old key is gone; the new key is not pre-populated.
    assert_eq!(gateway.cache_status().videos.entry_count, 0);

    let err = gateway
        .rename_video(SERVER, "/home/alice/x.mp4", "a/b")
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::InvalidPath(_)));
}

#[cfg(unix)]
mod thumbnails {
    use super::*;

    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    /// Writes a fake frame extractor that records each run and writes a
    /// fixed payload to its last argument, like ffmpeg writes the output
    /// image.
    fn fake_ffmpeg(dir: &TempDir) -> (PathBuf, PathBuf) {
        let counter = dir.path().join("extractions");
        let script = dir.path().join("ffmpeg");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\necho run >> {}\nfor last; do :; done\nprintf 'JPEGDATA' > \"$last\"\n",
                counter.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        (script, counter)
    }

    fn extraction_count(counter: &PathBuf) -> usize {
        std::fs::read_to_string(counter)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_thumbnail_generated_once() {
        let channel = Arc::new(ScriptedChannel::new());
        channel.on("cat --", Response::Bytes(vec![0u8; 256]));
        let dir = TempDir::new().unwrap();
        let (script, counter) = fake_ffmpeg(&dir);

        let mut config = test_config(&dir);
        config.thumbnails.ffmpeg_path = script;
        let gateway = MediaGateway::with_channel(config, channel.clone()).unwrap();
        let path = "/home/alice/clip.mp4";

        let first = gateway.thumbnail(SERVER, path).await.unwrap();
        let second = gateway.thumbnail(SERVER, path).await.unwrap();

        // The second call returns the identical cached image.
        assert_eq!(first, second);
        assert_eq!(extraction_count(&counter), 1);
        assert_eq!(channel.stream_calls(), 1);
        assert_eq!(std::fs::read(&first).unwrap(), b"JPEGDATA");

        let response = gateway.serve_thumbnail(SERVER, path).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.headers.content_type, "image/jpeg");
        assert_eq!(response.headers.cache_control, "public, max-age=86400");
        assert_eq!(response.body.collect().await.unwrap(), b"JPEGDATA");
    }

    #[tokio::test]
    async fn test_thumbnail_failure_leaves_no_entry() {
        let channel = Arc::new(ScriptedChannel::new());
        channel.on("cat --", Response::Bytes(vec![0u8; 256]));
        let dir = TempDir::new().unwrap();

        let mut config = test_config(&dir);
        config.thumbnails.ffmpeg_path = PathBuf::from("/bin/false");
        let gateway = MediaGateway::with_channel(config, channel.clone()).unwrap();

        let err = gateway
            .thumbnail(SERVER, "/home/alice/clip.mp4")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ThumbnailFailed(_)));
        assert_eq!(gateway.cache_status().thumbnails.entry_count, 0);
    }
}

#[tokio::test]
async fn test_clear_cache_reports_removed_files() {
    let channel = Arc::new(ScriptedChannel::new());
    channel.on("cat --", Response::Bytes(vec![0u8; 128]));
    let dir = TempDir::new().unwrap();
    let gateway = gateway_with(&channel, &dir);

    gateway
        .fetch_video(SERVER, "/home/alice/a.mp4")
        .await
        .unwrap();
    gateway
        .fetch_video(SERVER, "/home/alice/b.mp4")
        .await
        .unwrap();

    let outcome = gateway.clear_cache().unwrap();
    assert_eq!(outcome.removed_files, 2);

    let status = gateway.cache_status();
    assert_eq!(status.videos.entry_count, 0);
    assert_eq!(status.videos.total_bytes, 0);
    assert_eq!(status.thumbnails.entry_count, 0);

    // Cleared keys fetch fresh again.
    gateway
        .fetch_video(SERVER, "/home/alice/a.mp4")
        .await
        .unwrap();
    assert_eq!(channel.stream_calls(), 3);
}
