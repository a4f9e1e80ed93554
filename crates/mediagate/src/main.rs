//! mediagate.
//!
//! mediagate is the remote media cache and streaming gateway: it
//! materializes video files living on remote servers into a bounded local
//! cache and serves them with byte-range support. The gateway itself is a
//! library ([`mediagate_service`]); this binary is the operational entry
//! point for inspecting and maintaining a gateway's cache.

mod cli;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            mediagate_service::logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
