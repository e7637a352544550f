//! WebSocket tunnel transport
//!
//! This crate carries one raw byte stream (the primary stream) and an optional
//! side channel (the secondary stream) over a single WebSocket connection.
//!
//! # Framing
//!
//! When both ends negotiated multiplexing during the upgrade, every binary
//! message is prefixed with one tag byte:
//! - `0x00`: primary stream payload
//! - `0x01`: secondary stream payload
//!
//! Without multiplexing the message body is primary payload verbatim and the
//! secondary stream does not exist. Text messages are never tagged and are
//! handed to the control handler.

pub mod config;
pub mod connection;
pub mod error;
pub mod multiplexer;
pub mod prefixed;
pub mod secondary;
pub mod tls;

pub use config::TunnelConfig;
pub use connection::{Tunnel, TunnelHandle, TunnelStats};
pub use error::{TunnelError, TunnelResult};
pub use multiplexer::{FrameMultiplexer, Inbound};
pub use prefixed::PrefixedStream;
pub use secondary::{RegisteredConsumer, SecondaryConsumer, SecondarySender, SecondarySlot};

pub use tokio_tungstenite::tungstenite;

/// Generate a connection id used as the log prefix for one connection
pub fn new_connection_id() -> String {
    format!("ws-{}", uuid::Uuid::new_v4())
}

/// Object-safe alias for the byte streams a tunnel runs over
pub trait AsyncIo: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send {}
impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send> AsyncIo for T {}
