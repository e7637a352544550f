//! Client side of the WebSocket tunnel
//!
//! Turns a [`ConnectionDescriptor`](wsmc_proto::ConnectionDescriptor) into an
//! established tunnel:
//!
//! ```ignore
//! let descriptor = ConnectionDescriptor::parse("wss://play.example.com/mc")?;
//! let session = TunnelClient::new(ClientConfig::default()).connect(descriptor).await?;
//! session.run(local_reader, local_writer).await?;
//! ```

pub mod config;
pub mod connector;
pub mod error;
pub mod handshake;
pub mod pipeline;
pub mod status;

pub use config::ClientConfig;
pub use connector::{ClientSession, ClientStream, PendingConnection, TunnelClient};
pub use error::ClientError;
pub use handshake::{ClientHandshake, HandshakeCompletion, HandshakeError, HandshakeState, ResponseHead};
pub use pipeline::{
    HostStage, HostStages, Pipeline, PipelineError, PipelineHook, Stage, DEFAULT_CONFLICTING_STAGE,
};
pub use status::{StatusEntry, StatusLevel, StatusLog, STATUS_LOG_CAPACITY};
