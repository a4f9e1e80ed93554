use std::sync::Arc;
use std::time::{Duration, Instant};

use mediagate_service::config::Config;
use mediagate_service::error::GatewayError;
use mediagate_service::remote::CommandExecutor;
use mediagate_service::types::ServerId;

use crate::utils::{Response, ScriptedChannel};

const SERVER: ServerId = ServerId(1);

fn executor_with(channel: &Arc<ScriptedChannel>, config: &Config) -> CommandExecutor {
    CommandExecutor::new(channel.clone(), config)
}

#[tokio::test]
async fn test_retries_transient_connection_failures() {
    let channel = Arc::new(ScriptedChannel::new());
    channel.on("echo", Response::ok("hello\n"));
    channel.fail_connections(2);

    let executor = executor_with(&channel, &Config::default());
    let output = executor.run(SERVER, "echo hello").await.unwrap();

    assert_eq!(output.stdout, "hello\n");
    assert_eq!(channel.attempts(), 3);
}

#[tokio::test]
async fn test_gives_up_after_bounded_retries() {
    let channel = Arc::new(ScriptedChannel::new());
    channel.on("echo", Response::ok("hello\n"));
    channel.fail_connections(100);

    let executor = executor_with(&channel, &Config::default());
    let err = executor.run(SERVER, "echo hello").await.unwrap_err();

    assert!(matches!(err, GatewayError::Connection(_)));
    assert_eq!(channel.attempts(), 3);
}

#[tokio::test]
async fn test_destructive_commands_are_never_retried() {
    let channel = Arc::new(ScriptedChannel::new());
    channel.on("rm", Response::ok(""));
    channel.fail_connections(1);

    let executor = executor_with(&channel, &Config::default());
    let err = executor
        .run_destructive(SERVER, "rm -- '/srv/a.mp4'")
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::Connection(_)));
    assert_eq!(channel.attempts(), 1);
}

#[tokio::test]
async fn test_structural_errors_surface_immediately() {
    let channel = Arc::new(ScriptedChannel::new());
    channel.on(
        "ls",
        Response::Error(GatewayError::PermissionDenied("denied".into())),
    );

    let executor = executor_with(&channel, &Config::default());
    let err = executor.run(SERVER, "ls -lA -- '/root'").await.unwrap_err();

    assert_eq!(err, GatewayError::PermissionDenied("denied".into()));
    assert_eq!(channel.attempts(), 1);
}

#[tokio::test]
async fn test_non_zero_exit_is_not_a_channel_error() {
    let channel = Arc::new(ScriptedChannel::new());
    channel.on("stat", Response::fail(1, "No such file or directory"));

    let executor = executor_with(&channel, &Config::default());
    let output = executor.run(SERVER, "stat -c '%s %Y' -- '/x'").await.unwrap();

    assert_eq!(output.exit_code, 1);
    assert_eq!(channel.attempts(), 1);
}

#[tokio::test]
async fn test_command_timeout() {
    let channel = Arc::new(ScriptedChannel::new());
    channel.on_with_delay("echo", Duration::from_millis(500), Response::ok("late\n"));

    let config = Config {
        command_timeout: Duration::from_millis(50),
        ..Config::default()
    };
    let executor = executor_with(&channel, &config);
    let err = executor.run(SERVER, "echo hello").await.unwrap_err();

    assert_eq!(err, GatewayError::CommandTimeout(Duration::from_millis(50)));
    // Timeouts already consumed their budget, no retry.
    assert_eq!(channel.attempts(), 1);
}

#[tokio::test]
async fn test_session_pool_queues_excess_commands() {
    let channel = Arc::new(ScriptedChannel::new());
    channel.on_with_delay("echo", Duration::from_millis(100), Response::ok("ok\n"));

    let config = Config {
        max_sessions_per_server: 1,
        ..Config::default()
    };
    let executor = Arc::new(executor_with(&channel, &config));

    let started = Instant::now();
    let (a, b) = futures::future::join(
        executor.run(SERVER, "echo one"),
        executor.run(SERVER, "echo two"),
    )
    .await;

    a.unwrap();
    b.unwrap();
    // With a pool of one, the second command queued behind the first.
    assert!(started.elapsed() >= Duration::from_millis(180));
}
