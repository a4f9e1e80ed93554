//! Remote media cache and streaming gateway.
//!
//! mediagate serves video files that physically live on remote machines
//! reachable only through a remote-command channel. It enumerates remote
//! directories, fetches files into a bounded local cache with at most one
//! concurrent fetch per file, serves cached bytes with correct byte-range
//! semantics, and derives thumbnail images, all while never exposing a
//! partially written file.
//!
//! The [`MediaGateway`] facade ties the pieces together; the modules
//! underneath map onto the gateway's components:
//!
//! - [`remote`]: the command channel, its execution policy, and listing.
//! - [`caching`]: the single-flight, quota-bounded cache stores.
//! - [`streaming`]: full and partial responses over cached files.
//! - [`thumbnails`]: still-frame extraction.

pub mod caching;
pub mod config;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod remote;
pub mod streaming;
pub mod thumbnails;
pub mod types;

pub use crate::error::GatewayError;
pub use crate::gateway::MediaGateway;
pub use crate::types::ServerId;
