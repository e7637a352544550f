//! Tunnel transport configuration

use std::time::Duration;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use wsmc_proto::DEFAULT_MAX_FRAME_PAYLOAD;

use crate::error::{TunnelError, TunnelResult};

/// Settings shared by both ends of a tunnel
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Largest accepted frame/message payload, enforced by the decoder.
    /// With multiplexing on, the one-byte stream tag counts against it.
    pub max_frame_payload_length: usize,

    /// Interval between client keepalive pings
    pub keepalive_interval: Duration,

    /// Hex-dump every payload at trace level
    pub dump_bytes: bool,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            max_frame_payload_length: DEFAULT_MAX_FRAME_PAYLOAD,
            keepalive_interval: Duration::from_secs(10),
            dump_bytes: false,
        }
    }
}

impl TunnelConfig {
    /// Set the maximum WebSocket frame payload length.
    ///
    /// The limit covers the whole frame payload: when multiplexing is
    /// negotiated, a tagged frame carries at most `length - 1` bytes of
    /// stream data.
    pub fn with_max_frame_payload_length(mut self, length: usize) -> Self {
        self.max_frame_payload_length = length;
        self
    }

    /// Set custom keep-alive interval
    pub fn with_keepalive(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn with_dump_bytes(mut self, enabled: bool) -> Self {
        self.dump_bytes = enabled;
        self
    }

    pub fn validate(&self) -> TunnelResult<()> {
        if self.max_frame_payload_length == 0 {
            return Err(TunnelError::ConfigurationError(
                "max_frame_payload_length must be greater than zero".to_string(),
            ));
        }
        if self.keepalive_interval.is_zero() {
            return Err(TunnelError::ConfigurationError(
                "keepalive_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Decoder limits for tungstenite. The tag byte counts against the limit.
    pub fn websocket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_frame_size = Some(self.max_frame_payload_length);
        config.max_message_size = Some(self.max_frame_payload_length);
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = TunnelConfig::default();
        assert_eq!(config.max_frame_payload_length, 2 * 1024 * 1024);
        assert_eq!(config.keepalive_interval, Duration::from_secs(10));
        assert!(!config.dump_bytes);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_config_validation() {
        let config = TunnelConfig::default().with_max_frame_payload_length(0);
        assert!(config.validate().is_err());

        let config = TunnelConfig::default().with_keepalive(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_websocket_limits() {
        let ws = TunnelConfig::default()
            .with_max_frame_payload_length(4096)
            .websocket_config();
        assert_eq!(ws.max_frame_size, Some(4096));
        assert_eq!(ws.max_message_size, Some(4096));
    }
}
