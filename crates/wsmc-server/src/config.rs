//! Server configuration

use std::net::SocketAddr;
use std::path::PathBuf;
use wsmc_transport::TunnelConfig;

use crate::error::ServerError;

/// Default port of the secure (TLS) listener
pub const DEFAULT_SECURE_PORT: u16 = 443;

/// Default directory scanned for certificate pairs
pub const DEFAULT_CERT_DIR: &str = "config/wsmc";

/// TLS listener with SNI-selected certificates
#[derive(Debug, Clone)]
pub struct SecureListenerConfig {
    pub bind_addr: SocketAddr,
    pub cert_dir: PathBuf,
}

impl Default for SecureListenerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_SECURE_PORT)),
            cert_dir: PathBuf::from(DEFAULT_CERT_DIR),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Primary listener, shared by legacy and WebSocket clients
    pub bind_addr: SocketAddr,

    /// Game server the primary stream is relayed to
    pub backend_addr: String,

    /// Exact request target accepted for upgrades; `None` accepts any
    pub endpoint: Option<String>,

    /// Honor multiplexing requests from clients
    pub multiplexing: bool,

    /// Refuse connections that are not HTTP
    pub disable_legacy: bool,

    pub tunnel: TunnelConfig,

    pub secure: Option<SecureListenerConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], wsmc_proto::LEGACY_DEFAULT_PORT)),
            backend_addr: "127.0.0.1:25566".to_string(),
            endpoint: None,
            multiplexing: true,
            disable_legacy: false,
            tunnel: TunnelConfig::default(),
            secure: None,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr, backend_addr: impl Into<String>) -> Self {
        Self {
            bind_addr,
            backend_addr: backend_addr.into(),
            ..Default::default()
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_multiplexing(mut self, enabled: bool) -> Self {
        self.multiplexing = enabled;
        self
    }

    pub fn with_disable_legacy(mut self, disabled: bool) -> Self {
        self.disable_legacy = disabled;
        self
    }

    pub fn with_tunnel_config(mut self, tunnel: TunnelConfig) -> Self {
        self.tunnel = tunnel;
        self
    }

    pub fn with_secure_listener(mut self, secure: SecureListenerConfig) -> Self {
        self.secure = Some(secure);
        self
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        if let Some(endpoint) = &self.endpoint {
            if !endpoint.starts_with('/') {
                return Err(ServerError::ConfigurationError(format!(
                    "Endpoint must start with '/': {}",
                    endpoint
                )));
            }
        }
        if self.backend_addr.trim().is_empty() {
            return Err(ServerError::ConfigurationError(
                "Backend address is required".to_string(),
            ));
        }
        self.tunnel.validate()?;
        Ok(())
    }
}
