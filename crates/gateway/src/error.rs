use std::time::Duration;

use castle_protocol::ErrorShape;

/// Failures surfaced by the gateway client.
///
/// Connection-level failures never escape from the socket loop directly;
/// callers only see them through a rejected request or a state change.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("not connected to gateway")]
    NotConnected,

    #[error("request {method} timed out after {after:?}")]
    Timeout { method: String, after: Duration },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("gateway error {0}")]
    Server(ErrorShape),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("no gateway credential configured")]
    NoCredential,

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl GatewayError {
    /// Whether retrying the same call later can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NotConnected
            | Self::Timeout { .. }
            | Self::ConnectionClosed
            | Self::Transport(_) => true,
            Self::Server(shape) => shape.retryable.unwrap_or(true),
            Self::NoCredential | Self::Protocol(_) => false,
        }
    }
}

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;
