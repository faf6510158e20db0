//! Error taxonomy for the sync layer.
//!
//! Every failure ends up in a subject's `last_error` slot and, if the caller
//! registered one, the `on_error` callback. Nothing here is meant to unwind
//! past a component boundary: the service degrades (stops live updates)
//! instead of failing the host.

/// Sync layer errors
#[derive(Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Channel failure (connect refused, socket reset, abnormal close).
    /// Triggers the reconnection policy.
    Transport(String),
    /// Frame could not be decoded. Frame dropped, channel stays open.
    Protocol(String),
    /// `error`-typed frame sent by the server. Non-fatal.
    Server(String),
    /// Reconnect attempts used up. Channel stays closed until an explicit retry.
    ReconnectExhausted { attempts: u32 },
    /// Layer cannot be placed on the map (degenerate or missing bounds).
    Render { layer_id: String, reason: String },
    /// Resync or raster fetch over HTTP failed.
    Http(String),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::Transport(msg) => write!(f, "Connection error: {}", msg),
            SyncError::Protocol(msg) => write!(f, "Malformed frame: {}", msg),
            SyncError::Server(msg) => write!(f, "Server error: {}", msg),
            SyncError::ReconnectExhausted { attempts } => write!(
                f,
                "Connection lost after {} reconnect attempts, retry manually",
                attempts
            ),
            SyncError::Render { layer_id, reason } => {
                write!(f, "Layer {} not renderable: {}", layer_id, reason)
            }
            SyncError::Http(msg) => write!(f, "HTTP error: {}", msg),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        SyncError::Http(e.to_string())
    }
}
