//! Server side of the WebSocket tunnel
//!
//! A single port accepts both raw game clients and WebSocket tunnels:
//!
//! ```text
//! accept -> sniffer --GET--> upgrade negotiator --101--> tunnel <-> backend
//!                  \--other--> backend (bytes replayed)
//! ```
//!
//! An optional secure listener terminates TLS with certificates chosen by
//! SNI and feeds the decrypted stream straight into the upgrade negotiator.

pub mod config;
pub mod error;
pub mod listener;
pub mod registry;
pub mod secure;
pub mod sni;
pub mod sniffer;
pub mod upgrade;

pub use config::{SecureListenerConfig, ServerConfig};
pub use error::ServerError;
pub use listener::{ConnectionHandler, TunnelHook, TunnelServer};
pub use registry::{ConnectionInfo, ConnectionKind, ConnectionRegistry};
pub use secure::SecureListener;
pub use sni::{SniRouterError, SniVirtualHostRouter};
pub use sniffer::{Classification, HandshakeSniffer};
pub use upgrade::{HandshakeObserver, UpgradeError, UpgradeNegotiator, UpgradeOutcome, UpgradeRequest};
