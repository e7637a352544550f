//! YAML configuration file for the `wsmc` binary
//!
//! Every key mirrors a command-line flag. Values given on the command line
//! (or through their environment variables) win over the file, and the file
//! wins over the built-in defaults.
//!
//! ```yaml
//! log_level: debug
//! worker_threads: 4
//! tunnel:
//!   max_frame_payload_length: 2097152
//!   dump_bytes: false
//! server:
//!   bind: 0.0.0.0:25565
//!   backend: 127.0.0.1:25566
//!   endpoint: /mc
//!   secure:
//!     bind: 0.0.0.0:443
//!     cert_dir: config/wsmc
//! client:
//!   listen: 127.0.0.1:25565
//!   insecure_skip_verify: false
//!   conflicting_stages: [splitter]
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use wsmc_client::ClientConfig;
use wsmc_server::{SecureListenerConfig, ServerConfig};
use wsmc_transport::TunnelConfig;

/// Address the `connect` command listens on for game clients
pub const DEFAULT_LOCAL_LISTEN: &str = "127.0.0.1:25565";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub log_level: Option<String>,
    pub worker_threads: Option<usize>,
    pub tunnel: TunnelSection,
    pub server: ServerSection,
    pub client: ClientSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TunnelSection {
    pub max_frame_payload_length: Option<usize>,
    pub keepalive_interval_secs: Option<u64>,
    pub dump_bytes: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    pub bind: Option<SocketAddr>,
    pub backend: Option<String>,
    pub endpoint: Option<String>,
    pub disable_legacy: Option<bool>,
    pub multiplexing: Option<bool>,
    pub secure: Option<SecureSection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecureSection {
    pub bind: Option<SocketAddr>,
    pub cert_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientSection {
    pub listen: Option<SocketAddr>,
    pub insecure_skip_verify: Option<bool>,
    pub disable_legacy: Option<bool>,
    pub connect_timeout_secs: Option<u64>,
    pub handshake_timeout_secs: Option<u64>,
    pub host_stages: Option<Vec<String>>,
    pub conflicting_stages: Option<Vec<String>>,
    pub status_file: Option<PathBuf>,
}

/// Transport flags shared by `serve` and `connect`
#[derive(Debug, Clone, Default)]
pub struct TunnelOverrides {
    pub max_frame_payload_length: Option<usize>,
    pub dump_bytes: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ServeOverrides {
    pub bind: Option<SocketAddr>,
    pub backend: Option<String>,
    pub endpoint: Option<String>,
    pub disable_legacy: bool,
    pub no_multiplexing: bool,
    pub secure_bind: Option<SocketAddr>,
    pub cert_dir: Option<PathBuf>,
    pub tunnel: TunnelOverrides,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectOverrides {
    pub listen: Option<SocketAddr>,
    pub insecure: bool,
    pub disable_legacy: bool,
    pub status_file: Option<PathBuf>,
    pub tunnel: TunnelOverrides,
}

/// Everything the `connect` command needs
#[derive(Debug, Clone)]
pub struct ConnectSettings {
    pub listen: SocketAddr,
    pub client: ClientConfig,
    pub status_file: Option<PathBuf>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: FileConfig =
            serde_yaml::from_str(content).context("Failed to parse YAML config")?;
        if config.worker_threads == Some(0) {
            anyhow::bail!("worker_threads must be greater than zero");
        }
        Ok(config)
    }

    fn tunnel_config(&self, overrides: &TunnelOverrides) -> TunnelConfig {
        let mut tunnel = TunnelConfig::default();
        if let Some(length) = overrides
            .max_frame_payload_length
            .or(self.tunnel.max_frame_payload_length)
        {
            tunnel = tunnel.with_max_frame_payload_length(length);
        }
        if let Some(secs) = self.tunnel.keepalive_interval_secs {
            tunnel = tunnel.with_keepalive(Duration::from_secs(secs));
        }
        tunnel.with_dump_bytes(overrides.dump_bytes || self.tunnel.dump_bytes.unwrap_or(false))
    }

    pub fn server_config(&self, overrides: &ServeOverrides) -> Result<ServerConfig> {
        let section = &self.server;
        let defaults = ServerConfig::default();

        let mut config = ServerConfig::new(
            overrides.bind.or(section.bind).unwrap_or(defaults.bind_addr),
            overrides
                .backend
                .clone()
                .or_else(|| section.backend.clone())
                .unwrap_or(defaults.backend_addr),
        )
        .with_tunnel_config(self.tunnel_config(&overrides.tunnel))
        .with_disable_legacy(overrides.disable_legacy || section.disable_legacy.unwrap_or(false))
        .with_multiplexing(!overrides.no_multiplexing && section.multiplexing.unwrap_or(true));

        if let Some(endpoint) = overrides.endpoint.clone().or_else(|| section.endpoint.clone()) {
            config = config.with_endpoint(endpoint);
        }

        let file_secure = section.secure.clone().unwrap_or_default();
        let secure_bind = overrides.secure_bind.or(file_secure.bind);
        let cert_dir = overrides.cert_dir.clone().or(file_secure.cert_dir);
        if section.secure.is_some() || secure_bind.is_some() || cert_dir.is_some() {
            let defaults = SecureListenerConfig::default();
            config = config.with_secure_listener(SecureListenerConfig {
                bind_addr: secure_bind.unwrap_or(defaults.bind_addr),
                cert_dir: cert_dir.unwrap_or(defaults.cert_dir),
            });
        }

        config.validate().context("Invalid server configuration")?;
        Ok(config)
    }

    pub fn connect_settings(&self, overrides: &ConnectOverrides) -> Result<ConnectSettings> {
        let section = &self.client;

        let listen = match overrides.listen.or(section.listen) {
            Some(addr) => addr,
            None => DEFAULT_LOCAL_LISTEN
                .parse()
                .context("Invalid default listen address")?,
        };

        let mut client = ClientConfig::default()
            .with_tunnel_config(self.tunnel_config(&overrides.tunnel))
            .with_insecure_skip_verify(
                overrides.insecure || section.insecure_skip_verify.unwrap_or(false),
            )
            .with_disable_legacy(overrides.disable_legacy || section.disable_legacy.unwrap_or(false));
        if let Some(secs) = section.connect_timeout_secs {
            client = client.with_connect_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = section.handshake_timeout_secs {
            client = client.with_handshake_timeout(Duration::from_secs(secs));
        }
        if let Some(stages) = section.host_stages.clone() {
            client = client.with_host_stages(stages);
        }
        if let Some(stages) = section.conflicting_stages.clone() {
            client = client.with_conflicting_stages(stages);
        }
        client.validate().context("Invalid client configuration")?;

        Ok(ConnectSettings {
            listen,
            client,
            status_file: overrides
                .status_file
                .clone()
                .or_else(|| section.status_file.clone()),
        })
    }
}
