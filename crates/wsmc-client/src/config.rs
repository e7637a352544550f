//! Client configuration

use rustls::pki_types::CertificateDer;
use std::time::Duration;
use wsmc_transport::TunnelConfig;

use crate::error::ClientError;
use crate::pipeline::DEFAULT_CONFLICTING_STAGE;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub tunnel: TunnelConfig,

    /// Accept any server certificate (development and SNI-fronted setups)
    pub insecure_skip_verify: bool,

    /// Trust anchors for `wss`; empty means the webpki roots
    pub root_certs: Vec<CertificateDer<'static>>,

    pub connect_timeout: Duration,

    pub handshake_timeout: Duration,

    /// Host stages appended after the tunnel stage
    pub host_stages: Vec<String>,

    /// Host stages removed once the tunnel is established
    pub conflicting_stages: Vec<String>,

    /// Put HTTP stages removed by foreign code back before the upgrade.
    /// When off, such a pipeline fails the connection.
    pub repair_pipeline: bool,

    /// Refuse addresses that carry no tunnel information
    pub disable_legacy: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            tunnel: TunnelConfig::default(),
            insecure_skip_verify: false,
            root_certs: Vec::new(),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            host_stages: Vec::new(),
            conflicting_stages: vec![DEFAULT_CONFLICTING_STAGE.to_string()],
            repair_pipeline: true,
            disable_legacy: false,
        }
    }
}

impl ClientConfig {
    pub fn with_tunnel_config(mut self, tunnel: TunnelConfig) -> Self {
        self.tunnel = tunnel;
        self
    }

    pub fn with_insecure_skip_verify(mut self, insecure: bool) -> Self {
        self.insecure_skip_verify = insecure;
        self
    }

    pub fn with_root_certs(mut self, certs: Vec<CertificateDer<'static>>) -> Self {
        self.root_certs = certs;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_host_stages(mut self, stages: Vec<String>) -> Self {
        self.host_stages = stages;
        self
    }

    pub fn with_conflicting_stages(mut self, stages: Vec<String>) -> Self {
        self.conflicting_stages = stages;
        self
    }

    pub fn with_repair_pipeline(mut self, repair: bool) -> Self {
        self.repair_pipeline = repair;
        self
    }

    pub fn with_disable_legacy(mut self, disabled: bool) -> Self {
        self.disable_legacy = disabled;
        self
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.connect_timeout.is_zero() || self.handshake_timeout.is_zero() {
            return Err(ClientError::ConfigurationError(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        self.tunnel.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert!(!config.insecure_skip_verify);
        assert!(config.repair_pipeline);
        assert_eq!(config.conflicting_stages, vec!["splitter".to_string()]);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let config = ClientConfig::default().with_connect_timeout(Duration::ZERO);
        assert!(matches!(
            config.validate(),
            Err(ClientError::ConfigurationError(_))
        ));
    }
}
