//! Error types for claw-chat-gateway.

use thiserror::Error;

/// Errors that can occur in gateway operations.
///
/// Cloneable so a single failure can be delivered to every pending
/// `connect()` caller and to the event channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// Transport failed (dial refused, TLS failure, abrupt close, write error).
    #[error("gateway transport error: {0}")]
    Transport(String),

    /// A frame could not be encoded or decoded.
    #[error("gateway codec error: {0}")]
    Codec(String),

    /// The server sent something that violates the handshake.
    #[error("gateway protocol error: {0}")]
    Protocol(String),

    /// The reconnect policy ran out of attempts.
    #[error("reconnect attempts exhausted after {attempts} attempts")]
    ReconnectExhausted {
        /// Number of attempts made before giving up.
        attempts: u32,
    },

    /// No Ready dispatch arrived in time.
    #[error("timed out after {0}ms waiting for the gateway to become ready")]
    ConnectTimeout(u64),

    /// The connection was closed by the caller.
    #[error("gateway connection closed by client")]
    Disconnected,

    /// The gateway is disabled in configuration.
    #[error("gateway is disabled in configuration")]
    Disabled,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<crate::protocol::CodecError> for GatewayError {
    fn from(err: crate::protocol::CodecError) -> Self {
        Self::Codec(err.to_string())
    }
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            GatewayError::ReconnectExhausted { attempts: 5 }.to_string(),
            "reconnect attempts exhausted after 5 attempts"
        );
        assert_eq!(
            GatewayError::ConnectTimeout(3000).to_string(),
            "timed out after 3000ms waiting for the gateway to become ready"
        );
        assert_eq!(
            GatewayError::Transport("connection refused".into()).to_string(),
            "gateway transport error: connection refused"
        );
    }

    #[test]
    fn test_codec_error_conversion() {
        let err: GatewayError = crate::protocol::CodecError::NotAnObject.into();
        assert!(matches!(err, GatewayError::Codec(_)));
    }
}
