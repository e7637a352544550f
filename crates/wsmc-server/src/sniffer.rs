//! Ingress protocol detection
//!
//! The first bytes of every accepted connection decide its fate: a
//! case-insensitive `GET` means an HTTP request (a WebSocket upgrade or the
//! fallback page), anything else is the raw game protocol. Sniffed bytes are
//! never consumed; they are replayed to whichever handler takes over.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};
use wsmc_transport::PrefixedStream;

use crate::error::ServerError;

/// Bytes needed before a connection can be classified
pub const SNIFF_LEN: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    Http,
    Legacy,
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Classification::Http => f.write_str("http"),
            Classification::Legacy => f.write_str("legacy"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SnifferState {
    Sniffing,
    Classified(Classification),
}

/// Buffers the start of a connection until it can be classified
#[derive(Debug)]
pub struct HandshakeSniffer {
    buffered: BytesMut,
    state: SnifferState,
}

impl Default for HandshakeSniffer {
    fn default() -> Self {
        Self::new()
    }
}

impl HandshakeSniffer {
    pub fn new() -> Self {
        Self {
            buffered: BytesMut::with_capacity(512),
            state: SnifferState::Sniffing,
        }
    }

    /// Append inbound bytes. Returns the classification once enough bytes
    /// arrived; later calls keep returning it and keep buffering.
    pub fn feed(&mut self, data: &[u8]) -> Option<Classification> {
        self.buffered.extend_from_slice(data);
        if self.state == SnifferState::Sniffing && self.buffered.len() >= SNIFF_LEN {
            self.state = SnifferState::Classified(classify(&self.buffered));
        }
        self.classification()
    }

    pub fn classification(&self) -> Option<Classification> {
        match self.state {
            SnifferState::Sniffing => None,
            SnifferState::Classified(c) => Some(c),
        }
    }

    /// Every byte fed so far, in arrival order
    pub fn into_buffered(self) -> Bytes {
        self.buffered.freeze()
    }
}

/// Classify a prefix of at least [`SNIFF_LEN`] bytes
pub fn classify(prefix: &[u8]) -> Classification {
    if prefix.len() >= SNIFF_LEN && prefix[..SNIFF_LEN].eq_ignore_ascii_case(b"GET") {
        Classification::Http
    } else {
        Classification::Legacy
    }
}

/// Read from `io` until it can be classified.
///
/// The returned stream replays everything read so far. Legacy connections
/// are refused with [`ServerError::LegacyDisabled`] when `disable_legacy` is
/// set; nothing is forwarded for them.
pub async fn sniff<S>(
    conn_id: &str,
    mut io: S,
    disable_legacy: bool,
) -> Result<(Classification, PrefixedStream<S>), ServerError>
where
    S: AsyncRead + Unpin,
{
    let mut sniffer = HandshakeSniffer::new();
    let mut chunk = [0u8; 512];

    let classification = loop {
        let n = io.read(&mut chunk).await?;
        if n == 0 {
            debug!("[{}] Connection closed before protocol detection", conn_id);
            return Err(ServerError::ClosedDuringSniff);
        }
        if let Some(classification) = sniffer.feed(&chunk[..n]) {
            break classification;
        }
    };

    match classification {
        Classification::Http => {
            info!("[{}] HTTP GET detected, trying WebSocket upgrade", conn_id);
        }
        Classification::Legacy if disable_legacy => {
            warn!(
                "[{}] Legacy TCP connection refused, legacy connections are disabled",
                conn_id
            );
            return Err(ServerError::LegacyDisabled);
        }
        Classification::Legacy => {
            info!("[{}] Legacy TCP connection detected", conn_id);
        }
    }

    Ok((classification, PrefixedStream::new(sniffer.into_buffered(), io)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_classify() {
        assert_eq!(classify(b"GET / HTTP/1.1"), Classification::Http);
        assert_eq!(classify(b"get /"), Classification::Http);
        assert_eq!(classify(b"gEt"), Classification::Http);
        assert_eq!(classify(b"POST /"), Classification::Legacy);
        assert_eq!(classify(&[0x10, 0x00, 0xF4]), Classification::Legacy);
    }

    #[test]
    fn test_sniffer_waits_for_three_bytes() {
        let mut sniffer = HandshakeSniffer::new();
        assert_eq!(sniffer.feed(b"G"), None);
        assert_eq!(sniffer.feed(b"E"), None);
        assert_eq!(sniffer.feed(b"T /"), Some(Classification::Http));
        assert_eq!(&sniffer.into_buffered()[..], b"GET /");
    }

    #[test]
    fn test_classification_is_sticky() {
        let mut sniffer = HandshakeSniffer::new();
        assert_eq!(sniffer.feed(&[0x0F, 0x00, 0x2F]), Some(Classification::Legacy));
        assert_eq!(sniffer.feed(b"GET"), Some(Classification::Legacy));
    }

    #[tokio::test]
    async fn test_sniff_replays_legacy_bytes() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(&[0x10, 0x00, 0xF4, 0x05]).await.unwrap();
        client.write_all(b"rest").await.unwrap();
        drop(client);

        let (classification, mut stream) = sniff("ws-test", server, false).await.unwrap();
        assert_eq!(classification, Classification::Legacy);

        let mut replayed = Vec::new();
        stream.read_to_end(&mut replayed).await.unwrap();
        assert_eq!(replayed, b"\x10\x00\xF4\x05rest");
    }

    #[tokio::test]
    async fn test_sniff_refuses_disabled_legacy() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(&[0x10, 0x00, 0xF4]).await.unwrap();

        let err = sniff("ws-test", server, true).await.unwrap_err();
        assert!(matches!(err, ServerError::LegacyDisabled));
    }

    #[tokio::test]
    async fn test_sniff_http_even_when_legacy_disabled() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();

        let (classification, stream) = sniff("ws-test", server, true).await.unwrap();
        assert_eq!(classification, Classification::Http);
        assert_eq!(stream.prefix(), b"GET / HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn test_sniff_early_close() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"GE").await.unwrap();
        drop(client);

        let err = sniff("ws-test", server, false).await.unwrap_err();
        assert!(matches!(err, ServerError::ClosedDuringSniff));
    }
}
