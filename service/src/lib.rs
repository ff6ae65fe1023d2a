//! `tapedeckd`: observer channel for the tapedeck engine.
//!
//! A per-user daemon that owns the [`tapedeck_core::Orchestrator`] and
//! exposes it over a Unix domain socket at `$XDG_RUNTIME_DIR/tapedeck.sock`,
//! speaking newline-delimited JSON-RPC-lite. Clients that call
//! `events.subscribe` receive every `ProgressEvent` as an `event`
//! notification on the same connection; after a reconnect they rebuild
//! their view from `capture.status` and `queue.status`.

pub mod ipc;
pub mod protocol;
pub mod state;

/// Protocol version for the tapedeck IPC.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Default socket filename.
pub const SOCKET_FILENAME: &str = "tapedeck.sock";

/// Get the default socket path using XDG_RUNTIME_DIR.
///
/// Falls back to `/tmp/tapedeck-<username>.sock` if XDG_RUNTIME_DIR is not set.
pub fn default_socket_path() -> std::path::PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        std::path::PathBuf::from(runtime_dir).join(SOCKET_FILENAME)
    } else {
        let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
        std::path::PathBuf::from(format!("/tmp/tapedeck-{user}.sock"))
    }
}
