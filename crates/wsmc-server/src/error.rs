use thiserror::Error;
use wsmc_transport::TunnelError;

use crate::sni::SniRouterError;
use crate::upgrade::UpgradeError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    TransportError(#[from] TunnelError),

    #[error("Upgrade failed: {0}")]
    UpgradeError(#[from] UpgradeError),

    #[error("Certificate error: {0}")]
    CertificateError(#[from] SniRouterError),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("Vanilla TCP connection has been disabled")]
    LegacyDisabled,

    #[error("Connection closed before protocol detection")]
    ClosedDuringSniff,

    #[error("Backend {address} unreachable: {reason}")]
    BackendUnavailable { address: String, reason: String },

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Failed to bind to {address}:{port}: {reason}")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

impl ServerError {
    pub(crate) fn bind(addr: std::net::SocketAddr, e: std::io::Error) -> Self {
        ServerError::BindError {
            address: addr.ip().to_string(),
            port: addr.port(),
            reason: e.to_string(),
        }
    }
}
