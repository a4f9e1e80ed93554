use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Identifies a logical remote server.
///
/// The id resolves to connection parameters through the `servers` table in
/// the [`Config`](crate::config::Config); the mapping of users to servers is
/// owned by the caller.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ServerId(pub u32);

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server-{}", self.0)
    }
}

/// Metadata for one remote video file, as parsed from a directory listing
/// or a `stat` probe. Transient, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteFileMeta {
    /// Base file name, without directory components.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// Remote modification time.
    pub modified: SystemTime,
    /// Lower-cased file extension, if any.
    pub extension: Option<String>,
}

impl RemoteFileMeta {
    pub fn extension_of(name: &str) -> Option<String> {
        let (stem, ext) = name.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() {
            return None;
        }
        Some(ext.to_ascii_lowercase())
    }
}
