//! `instrux-service`: tool-call surface for the instruction catalog.
//!
//! Per-user service that owns one [`instrux_catalog::CatalogStore`] and
//! answers newline-delimited JSON-RPC-lite requests on a Unix domain socket
//! at `$XDG_RUNTIME_DIR/instrux.sock`.

pub mod dispatch;
pub mod ipc;
pub mod protocol;

/// Protocol version for the service IPC.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Default socket filename.
pub const SOCKET_FILENAME: &str = "instrux.sock";

/// Get the default socket path using XDG_RUNTIME_DIR.
///
/// Falls back to `/tmp/instrux-<username>.sock` if XDG_RUNTIME_DIR is not set.
pub fn default_socket_path() -> std::path::PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        std::path::PathBuf::from(runtime_dir).join(SOCKET_FILENAME)
    } else {
        let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
        std::path::PathBuf::from(format!("/tmp/instrux-{user}.sock"))
    }
}
