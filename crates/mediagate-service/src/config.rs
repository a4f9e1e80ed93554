use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{de, Deserialize, Deserializer};
use tracing::level_filters::LevelFilter;

use crate::types::ServerId;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for the gateway.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// How to authenticate against a remote server.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerAuth {
    /// Plain password authentication.
    Password { password: String },
    /// Private-key authentication with an optional passphrase.
    Key {
        key_path: PathBuf,
        #[serde(default)]
        passphrase: Option<String>,
    },
}

/// Connection parameters for one logical remote server.
#[derive(Clone, Debug, Deserialize)]
pub struct ServerEntry {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub auth: ServerAuth,
}

fn default_ssh_port() -> u16 {
    22
}

impl ServerEntry {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Size budget for one on-disk cache namespace.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheQuota {
    /// Maximum total bytes of ready entries. Exceeding entries are evicted
    /// in least-recently-used order after every insert.
    pub quota_bytes: u64,
}

const MEG: u64 = 1024 * 1024;

impl Default for CacheQuota {
    fn default() -> Self {
        Self {
            quota_bytes: 10 * 1024 * MEG,
        }
    }
}

/// Per-namespace cache quotas.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfigs {
    /// Budget for fully fetched video files.
    pub videos: CacheQuota,
    /// Budget for derived thumbnail images.
    pub thumbnails: CacheQuota,
}

impl Default for CacheConfigs {
    fn default() -> Self {
        Self {
            videos: CacheQuota::default(),
            thumbnails: CacheQuota {
                quota_bytes: 256 * MEG,
            },
        }
    }
}

/// Thumbnail extraction settings.
#[derive(Debug, Clone, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct ThumbnailConfig {
    /// Executable used for frame extraction.
    pub ffmpeg_path: PathBuf,
    /// Position of the extracted frame inside the video.
    #[serde(with = "humantime_serde")]
    pub frame_offset: Duration,
    /// Upper bound for one extraction run.
    #[serde(with = "humantime_serde")]
    pub extraction_timeout: Duration,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            frame_offset: Duration::from_secs(1),
            extraction_timeout: Duration::from_secs(20),
        }
    }
}

/// Gateway configuration, read from a YAML file.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the cache namespaces. Created if missing.
    pub cache_dir: PathBuf,

    /// Remote root directory under which each owner's media directory
    /// lives.
    pub media_root: String,

    /// Connection parameters per logical server id.
    pub servers: BTreeMap<ServerId, ServerEntry>,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Per-namespace cache size budgets.
    pub caches: CacheConfigs,

    /// Thumbnail extraction settings.
    pub thumbnails: ThumbnailConfig,

    /// File extensions recognized as video files in remote listings.
    pub video_extensions: Vec<String>,

    /// The timeout for establishing an SSH connection.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// The timeout for a single short remote command (listing, stat,
    /// move, delete).
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,

    /// The timeout for a full file transfer.
    ///
    /// This is the upper limit for fetching one video from a remote
    /// server, regardless of how many retries are involved.
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,

    /// Maximum number of concurrently executing commands per server.
    /// Requests beyond this bound queue rather than fail.
    pub max_sessions_per_server: usize,
}

fn default_video_extensions() -> Vec<String> {
    ["mp4", "mkv", "avi", "mov", "webm", "m4v", "mpg", "mpeg", "wmv", "flv", "ts"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: PathBuf::from("cache"),
            media_root: "/home".into(),
            servers: BTreeMap::new(),
            logging: Logging::default(),
            caches: CacheConfigs::default(),
            thumbnails: ThumbnailConfig::default(),
            video_extensions: default_video_extensions(),
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(30),
            // A 4MB/s link moves a bit over 1GB within this bound.
            fetch_timeout: Duration::from_secs(300),
            max_sessions_per_server: 4,
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }

    /// Returns a cache sub-directory joined onto the configured base.
    pub fn cache_dir<P: AsRef<Path>>(&self, dir: P) -> PathBuf {
        self.cache_dir.join(dir)
    }

    /// Resolves a server id to its connection parameters.
    pub fn server(&self, id: ServerId) -> Result<&ServerEntry, crate::error::GatewayError> {
        self.servers.get(&id).ok_or_else(|| {
            crate::error::GatewayError::Connection(format!("no configuration for {id}"))
        })
    }

    /// Whether the given extension is treated as a video file.
    pub fn is_video_extension(&self, ext: &str) -> bool {
        self.video_extensions.iter().any(|e| e.eq_ignore_ascii_case(ext))
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl<'de> de::Visitor<'de> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
