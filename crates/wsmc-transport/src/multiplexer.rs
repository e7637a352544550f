//! Translation between stream bytes and WebSocket messages

use bytes::Bytes;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};
use wsmc_proto::{decode_tagged, encode_tagged, hex_dump, MuxError, StreamTag};

use crate::secondary::SecondarySlot;

/// Outcome of decoding one inbound message
#[derive(Debug, PartialEq)]
pub enum Inbound {
    /// Bytes for the primary-stream sink
    Primary(Bytes),
    /// Text message for the control path
    Control(String),
    /// Secondary payload, handed to the consumer if one was registered
    Secondary { delivered: bool },
    /// Peer started the closing handshake
    Close,
    /// Ping/pong, answered by the WebSocket layer
    Keepalive,
    /// Malformed frame dropped; the connection continues
    Discarded(MuxError),
}

/// Per-connection codec state. Owned by the connection task.
#[derive(Debug, Clone)]
pub struct FrameMultiplexer {
    conn_id: String,
    multiplexing: bool,
    dump_bytes: bool,
    secondary: SecondarySlot,
}

impl FrameMultiplexer {
    pub fn new(conn_id: impl Into<String>, multiplexing: bool, secondary: SecondarySlot) -> Self {
        Self {
            conn_id: conn_id.into(),
            multiplexing,
            dump_bytes: false,
            secondary,
        }
    }

    pub fn with_dump_bytes(mut self, enabled: bool) -> Self {
        self.dump_bytes = enabled;
        self
    }

    pub fn multiplexing(&self) -> bool {
        self.multiplexing
    }

    pub fn secondary_slot(&self) -> &SecondarySlot {
        &self.secondary
    }

    /// Wrap primary-stream bytes in one binary message
    pub fn encode_primary(&self, payload: Bytes) -> Message {
        self.dump("out primary", &payload);
        if self.multiplexing {
            Message::Binary(encode_tagged(StreamTag::Primary, &payload))
        } else {
            Message::Binary(Vec::from(payload))
        }
    }

    /// Wrap secondary-stream bytes, or drop them when multiplexing is off
    pub fn encode_secondary(&self, payload: Bytes) -> Option<Message> {
        if !self.multiplexing {
            trace!(
                "[{}] Dropping {} secondary bytes, multiplexing is off",
                self.conn_id,
                payload.len()
            );
            return None;
        }
        self.dump("out secondary", &payload);
        Some(Message::Binary(encode_tagged(StreamTag::Secondary, &payload)))
    }

    pub fn decode(&self, message: Message) -> Inbound {
        match message {
            Message::Binary(data) => self.decode_binary(Bytes::from(data)),
            Message::Text(text) => {
                trace!("[{}] Control message: {} bytes", self.conn_id, text.len());
                Inbound::Control(text)
            }
            Message::Close(frame) => {
                match frame {
                    Some(frame) => debug!(
                        "[{}] WebSocket closed by peer: code={} reason={:?}",
                        self.conn_id,
                        u16::from(frame.code),
                        frame.reason
                    ),
                    None => debug!("[{}] WebSocket closed by peer without status", self.conn_id),
                }
                Inbound::Close
            }
            Message::Ping(_) | Message::Pong(_) => {
                trace!("[{}] Received ping/pong", self.conn_id);
                Inbound::Keepalive
            }
            Message::Frame(_) => Inbound::Keepalive,
        }
    }

    fn decode_binary(&self, data: Bytes) -> Inbound {
        if !self.multiplexing {
            self.dump("in primary", &data);
            return Inbound::Primary(data);
        }

        match decode_tagged(data) {
            Ok((StreamTag::Primary, payload)) => {
                self.dump("in primary", &payload);
                Inbound::Primary(payload)
            }
            Ok((StreamTag::Secondary, payload)) => {
                self.dump("in secondary", &payload);
                let delivered = self.secondary.deliver(payload);
                if !delivered {
                    trace!("[{}] No secondary consumer, payload dropped", self.conn_id);
                }
                Inbound::Secondary { delivered }
            }
            Err(e) => {
                warn!("[{}] Discarding frame: {}", self.conn_id, e);
                Inbound::Discarded(e)
            }
        }
    }

    fn dump(&self, direction: &str, data: &[u8]) {
        if !self.dump_bytes {
            return;
        }
        trace!("[{}] {} ({} bytes)", self.conn_id, direction, data.len());
        for row in hex_dump(data) {
            trace!("[{}]   {}", self.conn_id, row);
        }
    }
}
