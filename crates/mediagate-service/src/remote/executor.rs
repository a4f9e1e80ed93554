use std::collections::HashMap;
use std::net::ToSocketAddrs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use russh::ChannelMsg;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;

use crate::config::{Config, ServerAuth, ServerEntry};
use crate::error::GatewayError;
use crate::types::ServerId;

/// The captured result of one remote command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Captured stdout, lossily decoded. Empty for streamed commands.
    pub stdout: String,
    /// Captured stderr, lossily decoded.
    pub stderr: String,
    /// The command's exit code. Non-zero exits are not errors at this
    /// layer; callers interpret their domain meaning.
    pub exit_code: u32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// The raw remote command channel: runs a single shell-style command
/// against a logical server and returns its output.
///
/// This is the one external capability the gateway consumes. The
/// production implementation is [`SshChannel`]; tests substitute scripted
/// channels.
#[async_trait]
pub trait CommandChannel: Send + Sync + 'static {
    /// Runs `command` and captures stdout and stderr.
    async fn run(&self, server: ServerId, command: &str)
        -> Result<CommandOutput, GatewayError>;

    /// Runs `command`, streaming its stdout into the file at `destination`.
    ///
    /// The file is created, or truncated if it exists. In case of any
    /// error its contents are considered garbage.
    async fn stream_to_file(
        &self,
        server: ServerId,
        command: &str,
        destination: &Path,
    ) -> Result<CommandOutput, GatewayError>;
}

enum Sink<'a> {
    Buffer(&'a mut Vec<u8>),
    File(&'a mut tokio::fs::File),
}

impl Sink<'_> {
    async fn write(&mut self, data: &[u8]) -> Result<(), GatewayError> {
        match self {
            Sink::Buffer(buf) => {
                buf.extend_from_slice(data);
                Ok(())
            }
            Sink::File(file) => Ok(file.write_all(data).await?),
        }
    }
}

/// Client handler for russh callbacks.
///
/// Host keys are accepted as-is: the servers the gateway talks to are
/// resolved from its own configuration, not user input.
struct ClientHandler;

impl client::Handler for ClientHandler {
    type Error = GatewayError;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        tracing::debug!("accepting remote host key");
        Ok(true)
    }
}

/// The SSH-backed [`CommandChannel`].
///
/// Keeps one authenticated session per server and opens a fresh exec
/// channel per command; a dead session is dropped and re-established on the
/// next use.
pub struct SshChannel {
    config: Arc<Config>,
    sessions: tokio::sync::Mutex<HashMap<ServerId, client::Handle<ClientHandler>>>,
}

impl SshChannel {
    pub fn new(config: Arc<Config>) -> Self {
        SshChannel {
            config,
            sessions: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    async fn connect(
        &self,
        server: ServerId,
        entry: &ServerEntry,
    ) -> Result<client::Handle<ClientHandler>, GatewayError> {
        let addr = entry.address();
        tracing::debug!(%server, %addr, "connecting");

        let socket_addr = addr
            .to_socket_addrs()
            .map_err(|e| GatewayError::Connection(format!("failed to resolve {addr}: {e}")))?
            .next()
            .ok_or_else(|| GatewayError::Connection(format!("no address found for {addr}")))?;

        let ssh_config = client::Config {
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };

        let mut handle = tokio::time::timeout(
            self.config.connect_timeout,
            client::connect(Arc::new(ssh_config), socket_addr, ClientHandler),
        )
        .await
        .map_err(|_| GatewayError::Connection(format!("connecting to {addr} timed out")))??;

        let authenticated = match &entry.auth {
            ServerAuth::Password { password } => handle
                .authenticate_password(&entry.username, password)
                .await
                .map_err(|e| GatewayError::Connection(e.to_string()))?,
            ServerAuth::Key {
                key_path,
                passphrase,
            } => {
                let key = russh::keys::load_secret_key(key_path, passphrase.as_deref())
                    .map_err(|e| GatewayError::Connection(format!("failed to load key: {e}")))?;
                let key = PrivateKeyWithHashAlg::new(Arc::new(key), None);
                handle
                    .authenticate_publickey(&entry.username, key)
                    .await
                    .map_err(|e| GatewayError::Connection(e.to_string()))?
            }
        };

        if !authenticated.success() {
            return Err(GatewayError::PermissionDenied(format!(
                "authentication rejected by {addr}"
            )));
        }

        tracing::debug!(%server, %addr, "authenticated");
        Ok(handle)
    }

    /// Opens an exec channel on the cached session, reconnecting once if
    /// the session has died since its last use.
    async fn open_channel(
        &self,
        server: ServerId,
    ) -> Result<russh::Channel<client::Msg>, GatewayError> {
        let entry = self.config.server(server)?.clone();
        let mut sessions = self.sessions.lock().await;

        if let Some(handle) = sessions.get_mut(&server) {
            match handle.channel_open_session().await {
                Ok(channel) => return Ok(channel),
                Err(err) => {
                    tracing::debug!(%server, error = %err, "cached session is dead, reconnecting");
                    sessions.remove(&server);
                }
            }
        }

        let handle = self.connect(server, &entry).await?;
        let channel = handle.channel_open_session().await?;
        sessions.insert(server, handle);
        Ok(channel)
    }

    async fn run_command(
        &self,
        server: ServerId,
        command: &str,
        sink: &mut Sink<'_>,
    ) -> Result<(String, u32), GatewayError> {
        let mut channel = self.open_channel(server).await?;
        channel.exec(true, command).await?;

        let mut stderr = Vec::new();
        let mut exit_code = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => sink.write(&data).await?,
                ChannelMsg::ExtendedData { data, ext } if ext == 1 => {
                    stderr.extend_from_slice(&data);
                }
                ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
                _ => {}
            }
        }

        let exit_code = exit_code.ok_or_else(|| {
            GatewayError::Connection("channel closed without exit status".into())
        })?;
        Ok((String::from_utf8_lossy(&stderr).into_owned(), exit_code))
    }
}

#[async_trait]
impl CommandChannel for SshChannel {
    async fn run(
        &self,
        server: ServerId,
        command: &str,
    ) -> Result<CommandOutput, GatewayError> {
        let mut stdout = Vec::new();
        let (stderr, exit_code) = self
            .run_command(server, command, &mut Sink::Buffer(&mut stdout))
            .await?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr,
            exit_code,
        })
    }

    async fn stream_to_file(
        &self,
        server: ServerId,
        command: &str,
        destination: &Path,
    ) -> Result<CommandOutput, GatewayError> {
        let mut file = tokio::fs::File::create(destination).await?;
        let (stderr, exit_code) = self
            .run_command(server, command, &mut Sink::File(&mut file))
            .await?;
        file.flush().await?;
        Ok(CommandOutput {
            stdout: String::new(),
            stderr,
            exit_code,
        })
    }
}

/// Maximum attempts for commands without side effects.
const MAX_ATTEMPTS: usize = 3;
/// Delay between attempts.
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Wraps a [`CommandChannel`] with the execution policy of the gateway:
/// bounded per-server parallelism, per-command timeouts, and bounded
/// retries for transient connection failures.
pub struct CommandExecutor {
    channel: Arc<dyn CommandChannel>,
    command_timeout: Duration,
    fetch_timeout: Duration,
    max_sessions_per_server: usize,
    limits: Mutex<HashMap<ServerId, Arc<Semaphore>>>,
}

impl std::fmt::Debug for CommandExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandExecutor")
            .field("command_timeout", &self.command_timeout)
            .field("fetch_timeout", &self.fetch_timeout)
            .field("max_sessions_per_server", &self.max_sessions_per_server)
            .finish()
    }
}

impl CommandExecutor {
    pub fn new(channel: Arc<dyn CommandChannel>, config: &Config) -> Self {
        CommandExecutor {
            channel,
            command_timeout: config.command_timeout,
            fetch_timeout: config.fetch_timeout,
            max_sessions_per_server: config.max_sessions_per_server.max(1),
            limits: Mutex::new(HashMap::new()),
        }
    }

    /// Runs an idempotent command. Transient connection failures are
    /// retried up to a small fixed bound with backoff.
    pub async fn run(
        &self,
        server: ServerId,
        command: &str,
    ) -> Result<CommandOutput, GatewayError> {
        let _permit = self.acquire(server).await?;
        retry(|| self.run_once(server, command, self.command_timeout)).await
    }

    /// Runs a command with remote side effects (move, delete).
    ///
    /// Never retried: a retry after partial success could duplicate or
    /// corrupt remote state.
    pub async fn run_destructive(
        &self,
        server: ServerId,
        command: &str,
    ) -> Result<CommandOutput, GatewayError> {
        let _permit = self.acquire(server).await?;
        self.run_once(server, command, self.command_timeout).await
    }

    /// Streams a command's stdout into `destination`, for full file
    /// transfers. Side-effect free, so transient failures are retried; the
    /// destination is truncated on each attempt.
    pub async fn fetch_to_file(
        &self,
        server: ServerId,
        command: &str,
        destination: &Path,
    ) -> Result<CommandOutput, GatewayError> {
        let _permit = self.acquire(server).await?;
        retry(|| async {
            let result = tokio::time::timeout(
                self.fetch_timeout,
                self.channel.stream_to_file(server, command, destination),
            )
            .await;
            match result {
                Ok(output) => output,
                Err(_elapsed) => Err(GatewayError::CommandTimeout(self.fetch_timeout)),
            }
        })
        .await
    }

    async fn run_once(
        &self,
        server: ServerId,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, GatewayError> {
        let result = tokio::time::timeout(timeout, self.channel.run(server, command)).await;
        match result {
            Ok(output) => output,
            Err(_elapsed) => Err(GatewayError::CommandTimeout(timeout)),
        }
    }

    /// Takes a slot in the per-server session pool; callers beyond the
    /// bound queue here rather than fail.
    async fn acquire(
        &self,
        server: ServerId,
    ) -> Result<tokio::sync::OwnedSemaphorePermit, GatewayError> {
        let semaphore = {
            let mut limits = self.limits.lock().unwrap();
            limits
                .entry(server)
                .or_insert_with(|| Arc::new(Semaphore::new(self.max_sessions_per_server)))
                .clone()
        };
        semaphore
            .acquire_owned()
            .await
            .map_err(|_| GatewayError::Internal("session pool closed".into()))
    }
}

/// Try to run a command up to [`MAX_ATTEMPTS`] times with short delays,
/// retrying only failures a fresh connection could fix.
async fn retry<G, F, T>(task_gen: G) -> Result<T, GatewayError>
where
    G: Fn() -> F,
    F: std::future::Future<Output = Result<T, GatewayError>>,
{
    let mut tries = 0;
    loop {
        tries += 1;
        let result = task_gen().await;

        let should_retry = matches!(&result, Err(err) if err.is_transient());
        if !should_retry || tries >= MAX_ATTEMPTS {
            break result;
        }

        tokio::time::sleep(RETRY_BACKOFF).await;
    }
}
