//! Tunnel Protocol Definitions
//!
//! This crate defines the connection-string model, the stream-tag framing used
//! when multiplexing is negotiated, and the wire constants shared by the client
//! and server ends of the WebSocket tunnel.

pub mod address;
pub mod mux;

pub use address::{ConnectionDescriptor, Scheme, ServerAddress, TargetUri};
pub use mux::{decode_tagged, encode_tagged, hex_dump, MuxError, StreamTag};

/// Header carrying the requested/accepted tunnel protocol version
pub const VERSION_HEADER: &str = "X-WSMC-Version";

/// Version value that requests (and, when echoed, confirms) multiplexing
pub const MULTIPLEX_VERSION: &str = "2";

/// WebSocket protocol version spoken on the upgrade leg
pub const WEBSOCKET_VERSION: &str = "13";

/// Default ceiling for a single frame payload (2 MiB)
pub const DEFAULT_MAX_FRAME_PAYLOAD: usize = 2 * 1024 * 1024;

/// Default port of the raw game protocol
pub const LEGACY_DEFAULT_PORT: u16 = 25565;

/// Body of the fixed response served to plain HTTP requests
pub const FALLBACK_BODY: &str = "HTTP default response";
