//! Server side of the HTTP upgrade
//!
//! Reads one HTTP/1.1 request head. A WebSocket upgrade on the configured
//! endpoint is answered with `101 Switching Protocols`; any other request gets
//! the fixed fallback page and the connection is closed.

use bytes::{Bytes, BytesMut};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::{Role, WebSocketConfig};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use wsmc_proto::{FALLBACK_BODY, MULTIPLEX_VERSION, VERSION_HEADER, WEBSOCKET_VERSION};
use wsmc_transport::TunnelConfig;

use crate::config::ServerConfig;

/// Largest request head accepted before giving up
pub const MAX_REQUEST_HEAD: usize = 16 * 1024;
const MAX_HEADERS: usize = 64;

#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Connection closed before a complete request")]
    ClosedBeforeRequest,

    #[error("Request head exceeds {0} bytes")]
    RequestTooLarge(usize),

    #[error("Malformed HTTP request: {0}")]
    Malformed(String),

    #[error("Missing Host header on WebSocket upgrade")]
    MissingHost,

    #[error("Unsupported WebSocket version: {0:?}")]
    UnsupportedVersion(String),

    #[error("Missing Sec-WebSocket-Key header")]
    MissingKey,
}

/// The request that triggered an upgrade, as seen by the server
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    pub method: String,
    /// Request target exactly as sent (path and query)
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub remote_addr: Option<SocketAddr>,
}

impl UpgradeRequest {
    fn from_parsed(request: &httparse::Request<'_, '_>, remote_addr: Option<SocketAddr>) -> Self {
        let headers = request
            .headers
            .iter()
            .map(|h| {
                (
                    h.name.to_string(),
                    String::from_utf8_lossy(h.value).trim().to_string(),
                )
            })
            .collect();

        Self {
            method: request.method.unwrap_or_default().to_string(),
            target: request.path.unwrap_or_default().to_string(),
            headers,
            remote_addr,
        }
    }

    /// First header named `name`, compared case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn host(&self) -> Option<&str> {
        self.header("Host").filter(|h| !h.is_empty())
    }

    pub fn path(&self) -> &str {
        self.target
            .split_once('?')
            .map_or(self.target.as_str(), |(path, _)| path)
    }

    pub fn forwarded_for(&self) -> Option<&str> {
        self.header("X-Forwarded-For")
    }

    pub fn country(&self) -> Option<&str> {
        self.header("CF-IPCountry")
    }

    /// Client asked for stream tagging
    pub fn requests_multiplexing(&self) -> bool {
        self.header(VERSION_HEADER) == Some(MULTIPLEX_VERSION)
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        let connection_upgrade = self.header("Connection").is_some_and(|value| {
            value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        });
        let upgrade_websocket = self
            .header("Upgrade")
            .is_some_and(|value| value.eq_ignore_ascii_case("websocket"));

        self.method.eq_ignore_ascii_case("GET") && connection_upgrade && upgrade_websocket
    }
}

pub enum UpgradeOutcome<S> {
    /// 101 sent; the stream now speaks WebSocket
    Upgraded {
        ws: WebSocketStream<S>,
        multiplexing: bool,
        request: UpgradeRequest,
    },
    /// Fallback page sent and the connection shut down
    Fallback { request: UpgradeRequest },
}

impl<S> fmt::Debug for UpgradeOutcome<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpgradeOutcome::Upgraded {
                multiplexing,
                request,
                ..
            } => f
                .debug_struct("Upgraded")
                .field("multiplexing", multiplexing)
                .field("request", request)
                .finish_non_exhaustive(),
            UpgradeOutcome::Fallback { request } => f
                .debug_struct("Fallback")
                .field("request", request)
                .finish(),
        }
    }
}

/// Called with every accepted upgrade request before the 101 is sent
pub type HandshakeObserver = Arc<dyn Fn(&UpgradeRequest) + Send + Sync>;

#[derive(Clone)]
pub struct UpgradeNegotiator {
    endpoint: Option<String>,
    multiplexing: bool,
    websocket_config: WebSocketConfig,
    observer: Option<HandshakeObserver>,
}

impl fmt::Debug for UpgradeNegotiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpgradeNegotiator")
            .field("endpoint", &self.endpoint)
            .field("multiplexing", &self.multiplexing)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl UpgradeNegotiator {
    pub fn new(endpoint: Option<String>, multiplexing: bool, tunnel: &TunnelConfig) -> Self {
        Self {
            endpoint,
            multiplexing,
            websocket_config: tunnel.websocket_config(),
            observer: None,
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.endpoint.clone(), config.multiplexing, &config.tunnel)
    }

    pub fn with_observer(mut self, observer: HandshakeObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    fn is_endpoint(&self, target: &str) -> bool {
        match &self.endpoint {
            // case-sensitive on purpose
            Some(endpoint) => endpoint == target,
            None => true,
        }
    }

    /// Serve one HTTP request on `io`.
    ///
    /// Protocol violations close the connection and are returned as errors;
    /// where HTTP defines a response (426, 400) it is written first.
    pub async fn negotiate<S>(
        &self,
        conn_id: &str,
        mut io: S,
        remote_addr: Option<SocketAddr>,
    ) -> Result<UpgradeOutcome<S>, UpgradeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (request, leftover) = read_request_head(&mut io, remote_addr).await?;
        debug!(
            "[{}] HTTP request: {} {}",
            conn_id, request.method, request.target
        );

        if !(request.is_websocket_upgrade() && self.is_endpoint(&request.target)) {
            debug!(
                "[{}] Not a tunnel upgrade, serving default response for {}",
                conn_id, request.target
            );
            respond_and_close(&mut io, &fallback_response()).await?;
            return Ok(UpgradeOutcome::Fallback { request });
        }

        let Some(host) = request.host() else {
            warn!("[{}] Missing Host header on WebSocket upgrade, closing", conn_id);
            return Err(UpgradeError::MissingHost);
        };
        let url = format!("ws://{}{}", host, request.target);

        let version = request.header("Sec-WebSocket-Version").unwrap_or_default();
        if version != WEBSOCKET_VERSION {
            warn!("[{}] Unsupported WebSocket version {:?}", conn_id, version);
            let version = version.to_string();
            respond_and_close(&mut io, UPGRADE_REQUIRED_RESPONSE).await?;
            return Err(UpgradeError::UnsupportedVersion(version));
        }

        let Some(key) = request
            .header("Sec-WebSocket-Key")
            .filter(|k| !k.is_empty())
        else {
            warn!("[{}] Missing Sec-WebSocket-Key, rejecting {}", conn_id, url);
            respond_and_close(&mut io, BAD_REQUEST_RESPONSE).await?;
            return Err(UpgradeError::MissingKey);
        };
        let accept = derive_accept_key(key.as_bytes());

        if let Some(observer) = &self.observer {
            observer(&request);
        }
        log_handshake(conn_id, &request);

        let multiplexing = self.multiplexing && request.requests_multiplexing();
        if multiplexing {
            info!("[{}] Enabling multiplexing for {}", conn_id, url);
        }

        io.write_all(switching_protocols_response(&accept, multiplexing).as_bytes())
            .await?;
        io.flush().await?;

        let ws = WebSocketStream::from_partially_read(
            io,
            leftover.to_vec(),
            Role::Server,
            Some(self.websocket_config),
        )
        .await;
        info!("[{}] WebSocket handshake complete: {}", conn_id, url);

        Ok(UpgradeOutcome::Upgraded {
            ws,
            multiplexing,
            request,
        })
    }
}

/// Read one request head; bytes past the head are returned untouched.
async fn read_request_head<S>(
    io: &mut S,
    remote_addr: Option<SocketAddr>,
) -> Result<(UpgradeRequest, Bytes), UpgradeError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);

    loop {
        if !buf.is_empty() {
            let parsed = {
                let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
                let mut request = httparse::Request::new(&mut headers);
                match request.parse(&buf) {
                    Ok(httparse::Status::Complete(len)) => {
                        Some((UpgradeRequest::from_parsed(&request, remote_addr), len))
                    }
                    Ok(httparse::Status::Partial) => None,
                    Err(e) => return Err(UpgradeError::Malformed(e.to_string())),
                }
            };

            if let Some((request, len)) = parsed {
                let leftover = buf.split_off(len).freeze();
                return Ok((request, leftover));
            }
        }

        if buf.len() >= MAX_REQUEST_HEAD {
            return Err(UpgradeError::RequestTooLarge(MAX_REQUEST_HEAD));
        }

        let n = io.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(UpgradeError::ClosedBeforeRequest);
        }
    }
}

async fn respond_and_close<S>(io: &mut S, response: &str) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    io.write_all(response.as_bytes()).await?;
    io.flush().await?;
    if let Err(e) = io.shutdown().await {
        debug!("Shutdown after response failed: {}", e);
    }
    Ok(())
}

fn log_handshake(conn_id: &str, request: &UpgradeRequest) {
    let remote = request
        .remote_addr
        .map(|a| a.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    info!(
        "[{}] WSMC handshake from {}, host={}{}{}",
        conn_id,
        remote,
        request.host().unwrap_or_default(),
        request
            .forwarded_for()
            .map(|v| format!(", X-Forwarded-For={}", v))
            .unwrap_or_default(),
        request
            .country()
            .map(|v| format!(", CF-IPCountry={}", v))
            .unwrap_or_default(),
    );
}

const UPGRADE_REQUIRED_RESPONSE: &str = "HTTP/1.1 426 Upgrade Required\r\n\
     Sec-WebSocket-Version: 13\r\n\
     Content-Length: 0\r\n\
     Connection: close\r\n\r\n";

const BAD_REQUEST_RESPONSE: &str = "HTTP/1.1 400 Bad Request\r\n\
     Content-Length: 0\r\n\
     Connection: close\r\n\r\n";

fn fallback_response() -> String {
    format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/plain; charset=UTF-8\r\n\
         Content-Length: {}\r\n\
         Connection: keep-alive\r\n\r\n{}",
        FALLBACK_BODY.len(),
        FALLBACK_BODY
    )
}

fn switching_protocols_response(accept: &str, multiplexing: bool) -> String {
    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n",
        accept
    );
    if multiplexing {
        response.push_str(&format!("{}: {}\r\n", VERSION_HEADER, MULTIPLEX_VERSION));
    }
    response.push_str("\r\n");
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::duplex;

    const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    fn upgrade_request(extra: &str) -> String {
        format!(
            "GET /mc HTTP/1.1\r\n\
             Host: play.example.com\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {}\r\n\
             Sec-WebSocket-Version: 13\r\n\
             {}\r\n",
            KEY, extra
        )
    }

    fn negotiator() -> UpgradeNegotiator {
        UpgradeNegotiator::new(None, true, &TunnelConfig::default())
    }

    async fn exchange(
        negotiator: &UpgradeNegotiator,
        request: &str,
    ) -> (
        Result<UpgradeOutcome<tokio::io::DuplexStream>, UpgradeError>,
        String,
    ) {
        let (mut client, server) = duplex(16 * 1024);
        client.write_all(request.as_bytes()).await.unwrap();

        let outcome = negotiator.negotiate("ws-test", server, None).await;
        let mut response = vec![0u8; 4096];
        let n = client.read(&mut response).await.unwrap_or(0);
        (outcome, String::from_utf8_lossy(&response[..n]).into_owned())
    }

    #[test]
    fn test_upgrade_detection() {
        let request = UpgradeRequest {
            method: "GET".to_string(),
            target: "/".to_string(),
            headers: vec![
                ("connection".to_string(), "keep-alive, Upgrade".to_string()),
                ("UPGRADE".to_string(), "WebSocket".to_string()),
            ],
            remote_addr: None,
        };
        assert!(request.is_websocket_upgrade());

        let plain = UpgradeRequest {
            headers: vec![("Connection".to_string(), "keep-alive".to_string())],
            ..request
        };
        assert!(!plain.is_websocket_upgrade());
    }

    #[tokio::test]
    async fn test_upgrade_with_multiplexing() {
        let (outcome, response) =
            exchange(&negotiator(), &upgrade_request("X-WSMC-Version: 2\r\n")).await;

        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(response.contains("X-WSMC-Version: 2\r\n"));
        match outcome.unwrap() {
            UpgradeOutcome::Upgraded {
                multiplexing,
                request,
                ..
            } => {
                assert!(multiplexing);
                assert_eq!(request.host(), Some("play.example.com"));
                assert_eq!(request.path(), "/mc");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_upgrade_without_version_header() {
        let (outcome, response) = exchange(&negotiator(), &upgrade_request("")).await;
        assert!(response.starts_with("HTTP/1.1 101"));
        assert!(!response.contains("X-WSMC-Version"));
        assert!(matches!(
            outcome.unwrap(),
            UpgradeOutcome::Upgraded {
                multiplexing: false,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_multiplexing_can_be_refused() {
        let negotiator = UpgradeNegotiator::new(None, false, &TunnelConfig::default());
        let (outcome, response) =
            exchange(&negotiator, &upgrade_request("X-WSMC-Version: 2\r\n")).await;
        assert!(!response.contains("X-WSMC-Version"));
        assert!(matches!(
            outcome.unwrap(),
            UpgradeOutcome::Upgraded {
                multiplexing: false,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_plain_get_gets_fallback_page() {
        let (outcome, response) = exchange(
            &negotiator(),
            "GET /favicon.ico HTTP/1.1\r\nHost: play.example.com\r\n\r\n",
        )
        .await;

        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Content-Type: text/plain; charset=UTF-8\r\n"));
        assert!(response.contains("Content-Length: 21\r\n"));
        assert!(response.contains("Connection: keep-alive\r\n"));
        assert!(response.ends_with("\r\n\r\nHTTP default response"));
        assert!(matches!(outcome.unwrap(), UpgradeOutcome::Fallback { .. }));
    }

    #[tokio::test]
    async fn test_endpoint_filter_is_case_sensitive() {
        let negotiator =
            UpgradeNegotiator::new(Some("/MC".to_string()), true, &TunnelConfig::default());
        let (outcome, response) = exchange(&negotiator, &upgrade_request("")).await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(matches!(outcome.unwrap(), UpgradeOutcome::Fallback { .. }));

        let negotiator =
            UpgradeNegotiator::new(Some("/mc".to_string()), true, &TunnelConfig::default());
        let (outcome, _) = exchange(&negotiator, &upgrade_request("")).await;
        assert!(matches!(outcome.unwrap(), UpgradeOutcome::Upgraded { .. }));
    }

    #[tokio::test]
    async fn test_missing_host_closes_without_response() {
        let request = format!(
            "GET / HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
             Sec-WebSocket-Key: {}\r\nSec-WebSocket-Version: 13\r\n\r\n",
            KEY
        );
        let (outcome, response) = exchange(&negotiator(), &request).await;
        assert!(response.is_empty());
        assert!(matches!(outcome.unwrap_err(), UpgradeError::MissingHost));
    }

    #[tokio::test]
    async fn test_unsupported_version_gets_426() {
        let request = upgrade_request("").replace("Sec-WebSocket-Version: 13", "Sec-WebSocket-Version: 8");
        let (outcome, response) = exchange(&negotiator(), &request).await;
        assert!(response.starts_with("HTTP/1.1 426 Upgrade Required\r\n"));
        assert!(response.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(matches!(
            outcome.unwrap_err(),
            UpgradeError::UnsupportedVersion(v) if v == "8"
        ));
    }

    #[tokio::test]
    async fn test_missing_key_gets_400() {
        let request = upgrade_request("").replace(&format!("Sec-WebSocket-Key: {}\r\n", KEY), "");
        let (outcome, response) = exchange(&negotiator(), &request).await;
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(matches!(outcome.unwrap_err(), UpgradeError::MissingKey));
    }

    #[tokio::test]
    async fn test_observer_sees_forwarding_headers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let negotiator = negotiator().with_observer(Arc::new(move |request: &UpgradeRequest| {
            sink.lock().unwrap().push((
                request.forwarded_for().map(str::to_string),
                request.country().map(str::to_string),
            ));
        }));

        let (outcome, _) = exchange(
            &negotiator,
            &upgrade_request("X-Forwarded-For: 198.51.100.9\r\nCF-IPCountry: NZ\r\n"),
        )
        .await;
        assert!(outcome.is_ok());
        assert_eq!(
            seen.lock().unwrap()[0],
            (Some("198.51.100.9".to_string()), Some("NZ".to_string()))
        );
    }

    #[tokio::test]
    async fn test_request_split_across_reads() {
        let (mut client, server) = duplex(16 * 1024);
        let request = upgrade_request("");
        let (first, second) = request.split_at(10);
        let first = first.to_string();
        let second = second.to_string();

        let writer = tokio::spawn(async move {
            client.write_all(first.as_bytes()).await.unwrap();
            tokio::task::yield_now().await;
            client.write_all(second.as_bytes()).await.unwrap();
            client
        });

        let outcome = negotiator().negotiate("ws-test", server, None).await.unwrap();
        assert!(matches!(outcome, UpgradeOutcome::Upgraded { .. }));
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_closed_before_request() {
        let (client, server) = duplex(1024);
        drop(client);
        let err = negotiator().negotiate("ws-test", server, None).await.unwrap_err();
        assert!(matches!(err, UpgradeError::ClosedBeforeRequest));
    }
}
