//! Client error types.

use thiserror::Error;

/// Errors surfaced by the sync client.
///
/// Transport errors feed the reconnect state machine rather than the
/// caller; queue errors are logged at the sync boundary and never block
/// the optimistic in-memory path.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The WebSocket transport failed.
    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    /// The server did not acknowledge the connection in time.
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(std::time::Duration),

    /// The durable queue failed.
    #[error("queue error: {0}")]
    Queue(#[from] slate_core::CoreError),

    /// The session's driver task is gone.
    #[error("session is closed")]
    SessionClosed,
}

/// Convenience alias for client results.
pub type ClientResult<T> = Result<T, ClientError>;
