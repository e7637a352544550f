use thiserror::Error;
use wsmc_transport::TunnelError;

use crate::handshake::HandshakeError;
use crate::pipeline::PipelineError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Connection to {address} failed: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection to {0} timed out")]
    ConnectTimeout(String),

    #[error("TLS handshake failed: {0}")]
    TlsError(String),

    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Transport error: {0}")]
    Transport(#[from] TunnelError),

    #[error("Vanilla TCP connection has been disabled")]
    LegacyDisabled,

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
