//! Outbound connection pipeline
//!
//! A pipeline is the ordered list of stages a client connection's bytes pass
//! through, from the socket towards the host application:
//!
//! ```text
//! [tls] -> http-codec -> http-aggregator -> tunnel -> host stages...
//! ```
//!
//! The host may inspect and mutate it through a [`PipelineHook`] before the
//! connection is opened. The stage list drives the connection: a `tls` stage
//! turns on TLS, the upgrade only runs when the HTTP stages sit immediately
//! ahead of the tunnel, and host stages left after the handshake process the
//! primary bytes coming back from the server, in order.
//! [`Pipeline::ensure_prerequisites`] puts the HTTP stages back if something
//! removed or moved them.

use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use wsmc_proto::ConnectionDescriptor;

/// Host stage that frames the game protocol by length. It must not see
/// WebSocket frames once the tunnel is established.
pub const DEFAULT_CONFLICTING_STAGE: &str = "splitter";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Stage {
    /// TLS session presenting `server_name`
    Tls { server_name: String },
    /// HTTP/1.1 request encoder and response decoder
    HttpCodec,
    /// Collects one complete HTTP response head
    HttpAggregator,
    /// Handshake state machine and frame multiplexer
    Tunnel,
    /// Stage owned by the host application
    Host(String),
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Tls { server_name } => write!(f, "tls({})", server_name),
            Stage::HttpCodec => f.write_str("http-codec"),
            Stage::HttpAggregator => f.write_str("http-aggregator"),
            Stage::Tunnel => f.write_str("tunnel"),
            Stage::Host(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("Tunnel stage is missing from the pipeline")]
    MissingTunnel,

    #[error("Stage {0} not found")]
    StageNotFound(String),

    #[error("HTTP stages are not directly ahead of the tunnel: {0}")]
    HttpStagesMissing(String),
}

/// Host-owned processing of primary-stream bytes arriving from the server
pub trait HostStage: Send + Sync {
    fn on_inbound(&self, data: Bytes) -> Bytes;
}

impl<F> HostStage for F
where
    F: Fn(Bytes) -> Bytes + Send + Sync,
{
    fn on_inbound(&self, data: Bytes) -> Bytes {
        self(data)
    }
}

/// Handlers for host stages, by stage name
pub type HostStages = HashMap<String, Arc<dyn HostStage>>;

/// Mutates a pipeline before the connection is opened
pub trait PipelineHook: Send + Sync {
    fn on_pipeline(&self, descriptor: &ConnectionDescriptor, pipeline: &mut Pipeline);
}

impl<F> PipelineHook for F
where
    F: Fn(&ConnectionDescriptor, &mut Pipeline) + Send + Sync,
{
    fn on_pipeline(&self, descriptor: &ConnectionDescriptor, pipeline: &mut Pipeline) {
        self(descriptor, pipeline)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.stages.iter().map(|s| s.to_string()).collect();
        f.write_str(&names.join(" -> "))
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Standard stages for a descriptor; TLS only for `wss`
    pub fn for_descriptor(descriptor: &ConnectionDescriptor) -> Self {
        let mut stages = Vec::with_capacity(4);
        if descriptor.scheme().is_secure() {
            stages.push(Stage::Tls {
                server_name: descriptor.tls_server_name(),
            });
        }
        stages.extend([Stage::HttpCodec, Stage::HttpAggregator, Stage::Tunnel]);
        Self { stages }
    }

    /// Append host-owned stages after the tunnel
    pub fn with_host_stages<I, N>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        self.stages
            .extend(names.into_iter().map(|name| Stage::Host(name.into())));
        self
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn contains(&self, stage: &Stage) -> bool {
        self.stages.contains(stage)
    }

    pub fn position(&self, stage: &Stage) -> Option<usize> {
        self.stages.iter().position(|s| s == stage)
    }

    pub fn push(&mut self, stage: Stage) {
        self.stages.push(stage);
    }

    /// Insert `stage` immediately before `anchor`
    pub fn insert_before(&mut self, anchor: &Stage, stage: Stage) -> Result<(), PipelineError> {
        let index = self
            .position(anchor)
            .ok_or_else(|| PipelineError::StageNotFound(anchor.to_string()))?;
        self.stages.insert(index, stage);
        Ok(())
    }

    /// Remove every occurrence of `stage`; true if any was present
    pub fn remove(&mut self, stage: &Stage) -> bool {
        let before = self.stages.len();
        self.stages.retain(|s| s != stage);
        self.stages.len() != before
    }

    /// Server name of the TLS stage, if the connection uses TLS
    pub fn tls_server_name(&self) -> Option<&str> {
        self.stages.iter().find_map(|stage| match stage {
            Stage::Tls { server_name } => Some(server_name.as_str()),
            _ => None,
        })
    }

    /// Whether the HTTP codec and aggregator sit directly ahead of the
    /// tunnel, once each, so the upgrade can run
    pub fn upgrade_ready(&self) -> bool {
        let Some(tunnel) = self.position(&Stage::Tunnel) else {
            return false;
        };
        tunnel >= 2
            && self.stages[tunnel - 2] == Stage::HttpCodec
            && self.stages[tunnel - 1] == Stage::HttpAggregator
            && self
                .stages
                .iter()
                .filter(|s| matches!(s, Stage::HttpCodec | Stage::HttpAggregator))
                .count()
                == 2
    }

    /// Fails unless [`Pipeline::upgrade_ready`] holds
    pub fn check_upgrade_ready(&self) -> Result<(), PipelineError> {
        if !self.contains(&Stage::Tunnel) {
            return Err(PipelineError::MissingTunnel);
        }
        if !self.upgrade_ready() {
            return Err(PipelineError::HttpStagesMissing(self.to_string()));
        }
        Ok(())
    }

    /// Make sure the HTTP codec and aggregator sit directly ahead of the
    /// tunnel, in that order.
    ///
    /// Returns whether the pipeline had to be repaired. Calling it again on a
    /// repaired pipeline changes nothing.
    pub fn ensure_prerequisites(&mut self) -> Result<bool, PipelineError> {
        if !self.contains(&Stage::Tunnel) {
            return Err(PipelineError::MissingTunnel);
        }
        if self.upgrade_ready() {
            return Ok(false);
        }

        warn!("HTTP stages missing or out of place ({}), restoring", self);
        self.stages
            .retain(|s| !matches!(s, Stage::HttpCodec | Stage::HttpAggregator));
        self.insert_before(&Stage::Tunnel, Stage::HttpCodec)?;
        self.insert_before(&Stage::Tunnel, Stage::HttpAggregator)?;
        Ok(true)
    }

    /// Drop host stages listed in `names`, returning the ones removed
    pub fn remove_conflicting(&mut self, names: &[String]) -> Vec<String> {
        let mut removed = Vec::new();
        self.stages.retain(|stage| match stage {
            Stage::Host(name) if names.contains(name) => {
                removed.push(name.clone());
                false
            }
            _ => true,
        });
        for name in &removed {
            debug!("Removed conflicting stage {}", name);
        }
        removed
    }

    /// Handlers of the host stages after the tunnel, in pipeline order.
    /// Stages without a registered handler pass bytes through.
    pub fn inbound_handlers(&self, handlers: &HostStages) -> Vec<Arc<dyn HostStage>> {
        let Some(tunnel) = self.position(&Stage::Tunnel) else {
            return Vec::new();
        };
        self.stages[tunnel + 1..]
            .iter()
            .filter_map(|stage| match stage {
                Stage::Host(name) => handlers.get(name).cloned(),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(s: &str) -> ConnectionDescriptor {
        ConnectionDescriptor::parse(s).unwrap()
    }

    #[test]
    fn test_stages_for_plain_and_secure() {
        let plain = Pipeline::for_descriptor(&descriptor("ws://play.example.com"));
        assert_eq!(
            plain.stages(),
            &[Stage::HttpCodec, Stage::HttpAggregator, Stage::Tunnel]
        );
        assert_eq!(plain.tls_server_name(), None);

        let secure = Pipeline::for_descriptor(&descriptor("wss://front.example@play.example.com"));
        assert_eq!(secure.tls_server_name(), Some("front.example"));
        assert_eq!(secure.stages().len(), 4);
    }

    #[test]
    fn test_ensure_prerequisites_reinserts_removed_stages() {
        let mut pipeline = Pipeline::for_descriptor(&descriptor("wss://play.example.com"))
            .with_host_stages(["splitter", "decoder"]);
        pipeline.remove(&Stage::HttpCodec);
        pipeline.remove(&Stage::HttpAggregator);

        assert!(pipeline.ensure_prerequisites().unwrap());
        let tunnel = pipeline.position(&Stage::Tunnel).unwrap();
        assert_eq!(pipeline.stages()[tunnel - 2], Stage::HttpCodec);
        assert_eq!(pipeline.stages()[tunnel - 1], Stage::HttpAggregator);
        assert_eq!(pipeline.stages()[0].to_string(), "tls(play.example.com)");

        let repaired = pipeline.clone();
        assert!(!pipeline.ensure_prerequisites().unwrap());
        assert_eq!(pipeline, repaired);
    }

    #[test]
    fn test_ensure_prerequisites_fixes_order() {
        let mut pipeline = Pipeline::new();
        pipeline.push(Stage::HttpAggregator);
        pipeline.push(Stage::HttpCodec);
        pipeline.push(Stage::Host("foreign".to_string()));
        pipeline.push(Stage::Tunnel);

        assert!(pipeline.ensure_prerequisites().unwrap());
        assert_eq!(
            pipeline.to_string(),
            "foreign -> http-codec -> http-aggregator -> tunnel"
        );
    }

    #[test]
    fn test_ensure_prerequisites_needs_tunnel() {
        let mut pipeline = Pipeline::new();
        pipeline.push(Stage::HttpCodec);
        assert_eq!(
            pipeline.ensure_prerequisites(),
            Err(PipelineError::MissingTunnel)
        );
    }

    #[test]
    fn test_remove_conflicting_host_stages() {
        let mut pipeline = Pipeline::for_descriptor(&descriptor("ws://play.example.com"))
            .with_host_stages(["splitter", "decoder"]);
        let removed = pipeline.remove_conflicting(&[DEFAULT_CONFLICTING_STAGE.to_string()]);
        assert_eq!(removed, vec!["splitter".to_string()]);
        assert!(!pipeline.contains(&Stage::Host("splitter".to_string())));
        assert!(pipeline.contains(&Stage::Host("decoder".to_string())));
    }

    #[test]
    fn test_upgrade_ready() {
        let mut pipeline = Pipeline::for_descriptor(&descriptor("ws://play.example.com"));
        assert!(pipeline.upgrade_ready());
        assert!(pipeline.check_upgrade_ready().is_ok());

        pipeline.remove(&Stage::HttpAggregator);
        assert!(!pipeline.upgrade_ready());
        assert!(matches!(
            pipeline.check_upgrade_ready(),
            Err(PipelineError::HttpStagesMissing(_))
        ));

        pipeline.remove(&Stage::Tunnel);
        assert_eq!(
            pipeline.check_upgrade_ready(),
            Err(PipelineError::MissingTunnel)
        );
    }

    #[test]
    fn test_inbound_handlers_follow_stage_order() {
        let mut handlers = HostStages::new();
        handlers.insert(
            "splitter".to_string(),
            Arc::new(|data: Bytes| Bytes::from([b"|".as_slice(), &data[..]].concat())),
        );
        handlers.insert(
            "decoder".to_string(),
            Arc::new(|data: Bytes| Bytes::from(data.to_ascii_uppercase())),
        );

        let mut pipeline = Pipeline::for_descriptor(&descriptor("ws://play.example.com"))
            .with_host_stages(["splitter", "compressor", "decoder"]);
        // the handler-less stage is skipped
        let run = |pipeline: &Pipeline| {
            pipeline
                .inbound_handlers(&handlers)
                .iter()
                .fold(Bytes::from_static(b"ok"), |data, stage| stage.on_inbound(data))
        };
        assert_eq!(run(&pipeline), Bytes::from_static(b"|OK"));

        pipeline.remove_conflicting(&[DEFAULT_CONFLICTING_STAGE.to_string()]);
        assert_eq!(run(&pipeline), Bytes::from_static(b"OK"));
    }

    #[test]
    fn test_closure_hook() {
        let hook = |_: &ConnectionDescriptor, pipeline: &mut Pipeline| {
            pipeline.remove(&Stage::HttpCodec);
        };
        let descriptor = descriptor("ws://play.example.com");
        let mut pipeline = Pipeline::for_descriptor(&descriptor);
        hook.on_pipeline(&descriptor, &mut pipeline);
        assert!(!pipeline.contains(&Stage::HttpCodec));
    }
}
