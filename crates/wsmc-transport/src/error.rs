//! Transport-level errors

use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocketError(#[from] tungstenite::Error),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Failed to bind to {address}:{port}: {reason}")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),
}

impl TunnelError {
    /// True for errors that only mean the peer went away
    pub fn is_disconnect(&self) -> bool {
        match self {
            TunnelError::ConnectionClosed => true,
            TunnelError::IoError(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            TunnelError::WebSocketError(e) => matches!(
                e,
                tungstenite::Error::ConnectionClosed
                    | tungstenite::Error::AlreadyClosed
                    | tungstenite::Error::Protocol(
                        tungstenite::error::ProtocolError::ResetWithoutClosingHandshake
                    )
            ),
            _ => false,
        }
    }
}

/// Result type for transport operations
pub type TunnelResult<T> = Result<T, TunnelError>;
