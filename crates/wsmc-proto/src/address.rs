//! Connection-string model for tunnelled connections
//!
//! A connection string has the form
//! `(ws|wss)://[userinfo@]host[:port][/targetOverride]`. The userinfo and the
//! first path segment carry routing hints:
//!
//! - `wss`: userinfo is `sni[:hostHeader]`, either part may be empty
//! - `ws`: a non-blank userinfo overrides the HTTP `Host` header
//! - `/targetOverride` is `host[:port]`; it replaces the `Host` header and,
//!   unless it is an IP literal or an SNI was given explicitly, the SNI name
//!
//! Anything that is not a well-formed `ws`/`wss` string parses to `None`,
//! meaning "plain connection, no tunnel information".

use serde::Serialize;
use std::fmt;
use std::net::{IpAddr, Ipv6Addr};
use tracing::debug;

use crate::LEGACY_DEFAULT_PORT;

/// Tunnel URI scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Ws,
    Wss,
}

impl Scheme {
    /// Parse a scheme name, ignoring ASCII case
    pub fn parse(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("ws") {
            Some(Self::Ws)
        } else if value.eq_ignore_ascii_case("wss") {
            Some(Self::Wss)
        } else {
            None
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Self::Ws => 80,
            Self::Wss => 443,
        }
    }

    pub fn is_secure(self) -> bool {
        matches!(self, Self::Wss)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ws => "ws",
            Self::Wss => "wss",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized target of the upgrade request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TargetUri {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub query: Option<String>,
}

impl TargetUri {
    /// Request target used on the upgrade request line (`path[?query]`)
    pub fn request_target(&self) -> String {
        let path = if self.path.is_empty() { "/" } else { &self.path };
        match &self.query {
            Some(query) => format!("{}?{}", path, query),
            None => path.to_string(),
        }
    }
}

impl fmt::Display for TargetUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}:{}{}",
            self.scheme,
            bracket_if_ipv6(&self.host),
            self.port,
            self.request_target()
        )
    }
}

/// Parsed, immutable tunnel target plus its routing hints
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionDescriptor {
    host: String,
    port: u16,
    target_uri: TargetUri,
    sni_name: Option<String>,
    http_host_header: String,
}

impl ConnectionDescriptor {
    /// Parse a connection string. Never fails loudly: `None` means the string
    /// carries no WebSocket information and should be treated as plain.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        let (scheme, rest) = input.split_once("://")?;
        let scheme = Scheme::parse(scheme)?;

        let rest = rest.split_once('#').map_or(rest, |(before, _)| before);
        let (rest, query) = match rest.split_once('?') {
            Some((before, query)) => (before, Some(query.to_string())),
            None => (rest, None),
        };
        let (authority, path) = match rest.find('/') {
            Some(index) => rest.split_at(index),
            None => (rest, ""),
        };
        let (userinfo, host_port) = match authority.rfind('@') {
            Some(index) => (Some(&authority[..index]), &authority[index + 1..]),
            None => (None, authority),
        };

        let (host, port) = split_authority(host_port)?;
        if !is_valid_host(&host) {
            debug!("Rejecting connection string with invalid host: {}", host);
            return None;
        }
        let port = port.unwrap_or_else(|| scheme.default_port());

        let mut sni = (!is_ip_literal(&host)).then(|| host.clone());
        let mut header_host = host.clone();
        let mut explicit_sni = false;

        if let Some(userinfo) = userinfo {
            let parts: Vec<&str> = userinfo.split(':').collect();
            let first = parts[0];
            match scheme {
                Scheme::Wss => {
                    if !first.is_empty() {
                        sni = Some(first.to_string());
                        explicit_sni = true;
                    }
                    let user_header = parts.get(1).copied().unwrap_or(first);
                    if !user_header.is_empty() {
                        header_host = user_header.to_string();
                    }
                }
                Scheme::Ws => {
                    if !first.trim().is_empty() {
                        header_host = first.to_string();
                    }
                }
            }
        }

        let http_host_header = match parse_target_override(path) {
            Some((override_host, override_port)) => {
                if !explicit_sni && !is_ip_literal(&override_host) {
                    sni = Some(override_host.clone());
                }
                render_host_header(&override_host, override_port.unwrap_or(port), scheme)
            }
            None => render_host_header(&header_host, port, scheme),
        };

        let target_uri = TargetUri {
            scheme,
            host: host.clone(),
            port,
            path: if path.is_empty() {
                "/".to_string()
            } else {
                path.to_string()
            },
            query,
        };

        Some(Self {
            host,
            port,
            target_uri,
            sni_name: if scheme.is_secure() { sni } else { None },
            http_host_header,
        })
    }

    /// Host that is dialled (as typed, without IPv6 brackets)
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn scheme(&self) -> Scheme {
        self.target_uri.scheme
    }

    pub fn target_uri(&self) -> &TargetUri {
        &self.target_uri
    }

    /// SNI name for `wss` connections, if any
    pub fn sni_name(&self) -> Option<&str> {
        self.sni_name.as_deref()
    }

    /// Value sent in the HTTP `Host` header of the upgrade request
    pub fn http_host_header(&self) -> &str {
        &self.http_host_header
    }

    /// `host:port` suitable for a socket connect
    pub fn dial_address(&self) -> String {
        format!("{}:{}", bracket_if_ipv6(&self.host), self.port)
    }

    /// Name presented during the TLS handshake: the SNI name, falling back to
    /// the host portion of the `Host` header.
    pub fn tls_server_name(&self) -> String {
        if let Some(sni) = self.sni_name.as_deref().filter(|s| !s.trim().is_empty()) {
            return sni.to_string();
        }
        split_authority(&self.http_host_header)
            .map(|(host, _)| host)
            .unwrap_or_else(|| self.http_host_header.clone())
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.target_uri)?;
        writeln!(f, "TLS SNI: {}", self.sni_name.as_deref().unwrap_or("none"))?;
        write!(f, "HTTP Hostname: {}", self.http_host_header)
    }
}

/// A dialable server address, optionally augmented with tunnel information.
///
/// Two addresses are equal only if host, port and the tunnel descriptor (or
/// its absence) all match, so a plain address never equals a tunnelled one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddress {
    host: String,
    port: u16,
    descriptor: Option<ConnectionDescriptor>,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            descriptor: None,
        }
    }

    /// Parse a tunnel connection string, or a plain `host[:port]`
    pub fn parse(input: &str) -> Option<Self> {
        if let Some(descriptor) = ConnectionDescriptor::parse(input) {
            return Some(Self {
                host: descriptor.host.clone(),
                port: descriptor.port,
                descriptor: Some(descriptor),
            });
        }

        let (host, port) = split_authority(input.trim())?;
        if !is_valid_host(&host) {
            return None;
        }
        Some(Self::new(host, port.unwrap_or(LEGACY_DEFAULT_PORT)))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn descriptor(&self) -> Option<&ConnectionDescriptor> {
        self.descriptor.as_ref()
    }

    /// True when the address carries no tunnel information
    pub fn is_vanilla(&self) -> bool {
        self.descriptor.is_none()
    }

    pub fn dial_address(&self) -> String {
        format!("{}:{}", bracket_if_ipv6(&self.host), self.port)
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.descriptor {
            Some(descriptor) => write!(f, "{}", descriptor),
            None => f.write_str(&self.dial_address()),
        }
    }
}

/// Split `host[:port]` / `[v6][:port]`.
///
/// A non-numeric port makes the whole authority invalid; a numeric port that
/// does not fit in 0..=65535 is reported as absent so the caller falls back to
/// the scheme default.
fn split_authority(value: &str) -> Option<(String, Option<u16>)> {
    let (host, port) = if let Some(rest) = value.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        host.parse::<Ipv6Addr>().ok()?;
        if !after.is_empty() && !after.starts_with(':') {
            return None;
        }
        (host, after.strip_prefix(':'))
    } else {
        match value.split_once(':') {
            Some((host, port)) => {
                if port.contains(':') {
                    return None;
                }
                (host, Some(port))
            }
            None => (value, None),
        }
    };

    let port = match port {
        None | Some("") => None,
        Some(port) => {
            if !port.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            port.parse::<u32>()
                .ok()
                .and_then(|p| u16::try_from(p).ok())
        }
    };

    Some((host.to_string(), port))
}

fn is_ip_literal(host: &str) -> bool {
    host.parse::<IpAddr>().is_ok()
}

/// IP literals pass as-is; DNS names must survive IDNA to-ASCII conversion.
fn is_valid_host(host: &str) -> bool {
    if host.is_empty() {
        return false;
    }
    if is_ip_literal(host) {
        return true;
    }
    url::Host::parse(host).is_ok()
}

fn parse_target_override(path: &str) -> Option<(String, Option<u16>)> {
    let target = path.strip_prefix('/')?;
    let target = target.split('/').next().unwrap_or_default();
    if target.trim().is_empty() {
        return None;
    }

    if let Some(rest) = target.strip_prefix('[') {
        if let Some((host, after)) = rest.split_once(']') {
            let port = after.strip_prefix(':').and_then(|p| p.parse::<u16>().ok());
            return Some((host.to_string(), port));
        }
    }

    if let Some((host, port)) = target.rsplit_once(':') {
        if !host.is_empty() {
            if let Ok(port) = port.parse::<u16>() {
                return Some((host.to_string(), Some(port)));
            }
        }
    }

    Some((target.to_string(), None))
}

fn bracket_if_ipv6(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') && !host.ends_with(']') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

fn render_host_header(host: &str, port: u16, scheme: Scheme) -> String {
    let base = bracket_if_ipv6(host);
    if port == scheme.default_port() {
        base
    } else {
        format!("{}:{}", base, port)
    }
}
