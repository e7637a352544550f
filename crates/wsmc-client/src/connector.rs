//! Opens tunnel connections
//!
//! `prepare` builds the pipeline and handshake for a descriptor without
//! touching the network, so the host can adjust stages and queue early
//! primary-stream writes. `establish` dials, runs TLS when the pipeline asks
//! for it, performs the upgrade and returns a session ready to relay.

use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info};
use wsmc_proto::ConnectionDescriptor;
use wsmc_transport::tls::build_tls_connector;
use wsmc_transport::{new_connection_id, AsyncIo, Tunnel, TunnelHandle, TunnelStats};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::handshake::{ClientHandshake, HandshakeCompletion, HandshakeError, ResponseHead};
use crate::pipeline::{HostStage, HostStages, Pipeline, PipelineHook};
use crate::status::StatusLog;

/// Largest response head accepted from the server
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// Byte stream under a client tunnel, plain or TLS
pub type ClientStream = Box<dyn AsyncIo>;

/// A connection that has not been dialled yet
#[derive(Debug)]
pub struct PendingConnection {
    conn_id: String,
    pipeline: Pipeline,
    handshake: ClientHandshake,
    completion: Option<HandshakeCompletion>,
}

impl PendingConnection {
    pub fn connection_id(&self) -> &str {
        &self.conn_id
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        self.handshake.descriptor()
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn pipeline_mut(&mut self) -> &mut Pipeline {
        &mut self.pipeline
    }

    /// Queue primary-stream bytes; they are sent in order right after the
    /// handshake succeeds
    pub fn queue_primary(&mut self, payload: Bytes) {
        self.handshake.queue_primary(payload);
    }

    /// Future resolving with the handshake outcome. Only the first call
    /// returns it.
    pub fn take_completion(&mut self) -> Option<HandshakeCompletion> {
        self.completion.take()
    }
}

pub struct TunnelClient {
    config: ClientConfig,
    hook: Option<Arc<dyn PipelineHook>>,
    host_stages: HostStages,
    status: StatusLog,
}

impl std::fmt::Debug for TunnelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut handlers: Vec<&String> = self.host_stages.keys().collect();
        handlers.sort();
        f.debug_struct("TunnelClient")
            .field("config", &self.config)
            .field("hook", &self.hook.is_some())
            .field("host_stages", &handlers)
            .finish()
    }
}

impl TunnelClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            hook: None,
            host_stages: HostStages::new(),
            status: StatusLog::new(),
        }
    }

    pub fn with_pipeline_hook(mut self, hook: Arc<dyn PipelineHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Handler for the host stage `name`. It runs on primary bytes from the
    /// server while the stage is still in the session's pipeline.
    pub fn with_host_stage(mut self, name: impl Into<String>, stage: Arc<dyn HostStage>) -> Self {
        self.host_stages.insert(name.into(), stage);
        self
    }

    /// Record stage events into `status` instead of a private log
    pub fn with_status_log(mut self, status: StatusLog) -> Self {
        self.status = status;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn status(&self) -> &StatusLog {
        &self.status
    }

    /// Prepare and establish in one step
    pub async fn connect(&self, descriptor: ConnectionDescriptor) -> Result<ClientSession, ClientError> {
        let pending = self.prepare(descriptor);
        self.establish(pending).await
    }

    /// Build the pipeline for `descriptor` and let the hook adjust it
    pub fn prepare(&self, descriptor: ConnectionDescriptor) -> PendingConnection {
        let conn_id = new_connection_id();
        let mut pipeline = Pipeline::for_descriptor(&descriptor)
            .with_host_stages(self.config.host_stages.iter().cloned());
        if let Some(hook) = &self.hook {
            hook.on_pipeline(&descriptor, &mut pipeline);
        }
        debug!("[{}] Pipeline: {}", conn_id, pipeline);

        let (handshake, completion) = ClientHandshake::new(conn_id.clone(), descriptor);
        PendingConnection {
            conn_id,
            pipeline,
            handshake,
            completion: Some(completion),
        }
    }

    /// Dial, upgrade and flush queued writes
    pub async fn establish(&self, pending: PendingConnection) -> Result<ClientSession, ClientError> {
        let PendingConnection {
            conn_id,
            mut pipeline,
            mut handshake,
            ..
        } = pending;
        let descriptor = handshake.descriptor().clone();
        self.status
            .info(format!("[{}] Connecting to {}", conn_id, descriptor.target_uri()));

        let io = match self.open_stream(&conn_id, &descriptor, &mut pipeline).await {
            Ok(io) => io,
            Err(e) => {
                handshake.fail(HandshakeError::Transport(e.to_string()));
                self.status
                    .error(format!("[{}] Connection failed: {}", conn_id, e));
                return Err(e);
            }
        };

        self.status.info(format!("[{}] Handshake started", conn_id));
        let upgraded =
            tokio::time::timeout(self.config.handshake_timeout, upgrade(io, &mut handshake)).await;
        let (io, leftover, multiplexing) = match upgraded {
            Ok(Ok(upgraded)) => upgraded,
            Ok(Err(e)) => {
                self.status
                    .error(format!("[{}] Handshake failed: {}", conn_id, e));
                return Err(e);
            }
            Err(_) => {
                handshake.fail(HandshakeError::Timeout);
                self.status
                    .error(format!("[{}] Handshake failed: timed out", conn_id));
                return Err(HandshakeError::Timeout.into());
            }
        };

        if multiplexing {
            self.status
                .info(format!("[{}] Handshake complete, multiplexing enabled", conn_id));
        } else {
            self.status.warn(format!(
                "[{}] Handshake complete, server does not support multiplexing",
                conn_id
            ));
        }

        let ws = WebSocketStream::from_partially_read(
            io,
            leftover.to_vec(),
            Role::Client,
            Some(self.config.tunnel.websocket_config()),
        )
        .await;
        let (mut tunnel, handle) =
            Tunnel::new(conn_id.clone(), ws, multiplexing, &self.config.tunnel, true);

        for payload in handshake.take_pending() {
            tunnel.send_primary(payload).await?;
        }

        let removed = pipeline.remove_conflicting(&self.config.conflicting_stages);
        if !removed.is_empty() {
            debug!("[{}] Removed host stages {:?}", conn_id, removed);
        }

        let inbound = pipeline.inbound_handlers(&self.host_stages);
        Ok(ClientSession {
            conn_id,
            descriptor,
            pipeline,
            tunnel,
            handle,
            inbound,
            status: self.status.clone(),
        })
    }

    async fn open_stream(
        &self,
        conn_id: &str,
        descriptor: &ConnectionDescriptor,
        pipeline: &mut Pipeline,
    ) -> Result<ClientStream, ClientError> {
        let address = descriptor.dial_address();
        let tcp = match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&address)).await {
            Ok(Ok(tcp)) => tcp,
            Ok(Err(e)) => {
                return Err(ClientError::ConnectionFailed {
                    address,
                    reason: e.to_string(),
                })
            }
            Err(_) => return Err(ClientError::ConnectTimeout(address)),
        };
        if let Err(e) = tcp.set_nodelay(true) {
            debug!("[{}] Failed to set TCP_NODELAY: {}", conn_id, e);
        }

        if self.config.repair_pipeline && pipeline.ensure_prerequisites()? {
            info!("[{}] Restored HTTP stages: {}", conn_id, pipeline);
        }
        pipeline.check_upgrade_ready()?;

        let Some(server_name) = pipeline.tls_server_name() else {
            debug!("[{}] Connected to {}", conn_id, address);
            return Ok(Box::new(tcp));
        };

        let connector =
            build_tls_connector(self.config.insecure_skip_verify, &self.config.root_certs)?;
        let name = rustls::pki_types::ServerName::try_from(server_name.to_string())
            .map_err(|e| ClientError::TlsError(format!("Invalid server name {}: {}", server_name, e)))?;
        let tls = match tokio::time::timeout(self.config.connect_timeout, connector.connect(name, tcp)).await {
            Ok(Ok(tls)) => tls,
            Ok(Err(e)) => return Err(ClientError::TlsError(e.to_string())),
            Err(_) => return Err(ClientError::ConnectTimeout(address)),
        };
        debug!(
            "[{}] Connected to {} with TLS (SNI {})",
            conn_id, address, server_name
        );
        Ok(Box::new(tls))
    }
}

/// Send the upgrade request and read the response head. Bytes after the
/// head are WebSocket frames and are returned with the stream.
async fn upgrade<S>(
    mut io: S,
    handshake: &mut ClientHandshake,
) -> Result<(S, Bytes, bool), ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = handshake.start()?;
    if let Err(e) = write_request(&mut io, &request).await {
        handshake.fail(HandshakeError::Transport(e.to_string()));
        return Err(HandshakeError::Transport(e.to_string()).into());
    }

    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if !buf.is_empty() {
            let parsed = match ResponseHead::parse(&buf) {
                Ok(parsed) => parsed,
                Err(e) => {
                    handshake.fail(e.clone());
                    return Err(e.into());
                }
            };
            if let Some((head, len)) = parsed {
                let multiplexing = handshake.on_response(&head)?;
                let leftover = buf.split_off(len).freeze();
                return Ok((io, leftover, multiplexing));
            }
        }

        if buf.len() >= MAX_RESPONSE_HEAD {
            let error = HandshakeError::InvalidResponse("response head too large".to_string());
            handshake.fail(error.clone());
            return Err(error.into());
        }

        match io.read_buf(&mut buf).await {
            Ok(0) => {
                handshake.on_closed();
                return Err(HandshakeError::ConnectionClosed.into());
            }
            Ok(_) => {}
            Err(e) => {
                let error = HandshakeError::Transport(e.to_string());
                handshake.fail(error.clone());
                return Err(error.into());
            }
        }
    }
}

async fn write_request<S: AsyncWrite + Unpin>(io: &mut S, request: &[u8]) -> std::io::Result<()> {
    io.write_all(request).await?;
    io.flush().await
}

/// An established tunnel, ready to relay the primary stream
pub struct ClientSession {
    conn_id: String,
    descriptor: ConnectionDescriptor,
    pipeline: Pipeline,
    tunnel: Tunnel<ClientStream>,
    handle: TunnelHandle,
    inbound: Vec<Arc<dyn HostStage>>,
    status: StatusLog,
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("conn_id", &self.conn_id)
            .field("descriptor", &self.descriptor)
            .field("pipeline", &self.pipeline)
            .field("multiplexing", &self.handle.multiplexing())
            .finish()
    }
}

impl ClientSession {
    pub fn connection_id(&self) -> &str {
        &self.conn_id
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    /// Pipeline as left after the handshake
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn multiplexing(&self) -> bool {
        self.handle.multiplexing()
    }

    /// Secondary-stream access, usable from other tasks
    pub fn handle(&self) -> &TunnelHandle {
        &self.handle
    }

    /// Receive text frames from the server
    pub fn with_control_handler<F>(mut self, handler: F) -> Self
    where
        F: FnMut(String) + Send + 'static,
    {
        self.tunnel = self.tunnel.with_control_handler(handler);
        self
    }

    pub async fn send_primary(&mut self, payload: Bytes) -> Result<(), ClientError> {
        self.tunnel.send_primary(payload).await?;
        Ok(())
    }

    /// Relay the primary stream until either side closes. Bytes from the
    /// server pass through the remaining host stages on their way to
    /// `writer`.
    pub async fn run<R, W>(self, reader: R, writer: W) -> Result<TunnelStats, ClientError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let ClientSession {
            conn_id,
            mut tunnel,
            inbound,
            status,
            ..
        } = self;

        if !inbound.is_empty() {
            tunnel = tunnel.with_inbound_filter(move |data| {
                inbound
                    .iter()
                    .fold(data, |data, stage| stage.on_inbound(data))
            });
        }

        match tunnel.run(reader, writer).await {
            Ok(stats) => {
                status.info(format!(
                    "[{}] Connection closed (sent={} received={})",
                    conn_id, stats.bytes_sent, stats.bytes_received
                ));
                Ok(stats)
            }
            Err(e) => {
                status.error(format!("[{}] Connection lost: {}", conn_id, e));
                Err(e.into())
            }
        }
    }
}
