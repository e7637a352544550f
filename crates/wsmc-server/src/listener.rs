//! Primary listener and per-connection relay
//!
//! One port serves both legacy game clients and WebSocket tunnels. Each
//! accepted socket is classified by the sniffer; legacy connections are
//! spliced to the backend with the sniffed bytes replayed, HTTP connections go
//! through the upgrade negotiator and, once upgraded, relay primary-stream
//! frames to the backend.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use wsmc_transport::{new_connection_id, Tunnel, TunnelConfig, TunnelHandle};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::registry::{ConnectionKind, ConnectionRegistry, RegistrationGuard};
use crate::secure::SecureListener;
use crate::sniffer::{sniff, Classification};
use crate::upgrade::{HandshakeObserver, UpgradeNegotiator, UpgradeOutcome, UpgradeRequest};

/// Called once per established tunnel, before relaying starts. The handle
/// gives access to the secondary stream of that connection.
pub type TunnelHook = Arc<dyn Fn(&UpgradeRequest, &TunnelHandle) + Send + Sync>;

/// Per-connection pipeline shared by the primary and secure listeners
#[derive(Clone)]
pub struct ConnectionHandler {
    backend_addr: String,
    disable_legacy: bool,
    tunnel_config: TunnelConfig,
    negotiator: UpgradeNegotiator,
    registry: ConnectionRegistry,
    tunnel_hook: Option<TunnelHook>,
}

impl std::fmt::Debug for ConnectionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandler")
            .field("backend_addr", &self.backend_addr)
            .field("disable_legacy", &self.disable_legacy)
            .field("negotiator", &self.negotiator)
            .field("tunnel_hook", &self.tunnel_hook.is_some())
            .finish()
    }
}

impl ConnectionHandler {
    pub fn new(config: &ServerConfig, registry: ConnectionRegistry) -> Self {
        Self {
            backend_addr: config.backend_addr.clone(),
            disable_legacy: config.disable_legacy,
            tunnel_config: config.tunnel.clone(),
            negotiator: UpgradeNegotiator::from_config(config),
            registry,
            tunnel_hook: None,
        }
    }

    pub fn with_observer(mut self, observer: HandshakeObserver) -> Self {
        self.negotiator = self.negotiator.with_observer(observer);
        self
    }

    pub fn with_tunnel_hook(mut self, hook: TunnelHook) -> Self {
        self.tunnel_hook = Some(hook);
        self
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Serve a connection from the primary listener: sniff, then relay as
    /// legacy or negotiate an upgrade
    pub async fn handle_plain<S>(&self, io: S, peer_addr: SocketAddr) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let conn_id = new_connection_id();
        let guard = self.registry.register(&conn_id, peer_addr, false);
        debug!("[{}] Accepted connection from {}", conn_id, peer_addr);

        let (classification, stream) = sniff(&conn_id, io, self.disable_legacy).await?;
        match classification {
            Classification::Legacy => {
                guard.set_kind(ConnectionKind::Legacy);
                self.relay_legacy(&conn_id, stream).await
            }
            Classification::Http => self.relay_upgrade(&guard, stream, peer_addr).await,
        }
    }

    /// Serve a decrypted connection from the secure listener. Only the HTTP
    /// upgrade is accepted there; no sniffing takes place.
    pub async fn handle_secure<S>(&self, io: S, peer_addr: SocketAddr) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let conn_id = new_connection_id();
        let guard = self.registry.register(&conn_id, peer_addr, true);
        debug!("[{}] Accepted TLS connection from {}", conn_id, peer_addr);

        self.relay_upgrade(&guard, io, peer_addr).await
    }

    async fn relay_legacy<S>(&self, conn_id: &str, mut stream: S) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut backend = self.connect_backend(conn_id).await?;
        let (sent, received) = tokio::io::copy_bidirectional(&mut stream, &mut backend).await?;
        debug!(
            "[{}] Legacy connection closed (client->backend={} backend->client={})",
            conn_id, sent, received
        );
        Ok(())
    }

    async fn relay_upgrade<S>(
        &self,
        guard: &RegistrationGuard,
        io: S,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let conn_id = guard.conn_id();

        let (mut ws, multiplexing, request) = match self
            .negotiator
            .negotiate(conn_id, io, Some(peer_addr))
            .await?
        {
            UpgradeOutcome::Fallback { .. } => {
                guard.set_kind(ConnectionKind::Http);
                return Ok(());
            }
            UpgradeOutcome::Upgraded {
                ws,
                multiplexing,
                request,
            } => (ws, multiplexing, request),
        };
        guard.set_kind(ConnectionKind::WebSocket { multiplexing });

        let backend = match self.connect_backend(conn_id).await {
            Ok(backend) => backend,
            Err(e) => {
                if let Err(close_err) = ws.close(None).await {
                    debug!("[{}] Close failed: {}", conn_id, close_err);
                }
                return Err(e);
            }
        };

        let (tunnel, handle) = Tunnel::new(conn_id, ws, multiplexing, &self.tunnel_config, false);
        if let Some(hook) = &self.tunnel_hook {
            hook(&request, &handle);
        }

        let (backend_read, backend_write) = backend.into_split();
        let stats = tunnel.run(backend_read, backend_write).await?;
        info!(
            "[{}] Tunnel from {} finished (sent={} received={})",
            conn_id, peer_addr, stats.bytes_sent, stats.bytes_received
        );
        Ok(())
    }

    async fn connect_backend(&self, conn_id: &str) -> Result<TcpStream, ServerError> {
        let backend = TcpStream::connect(&self.backend_addr).await.map_err(|e| {
            warn!(
                "[{}] Backend {} unreachable: {}",
                conn_id, self.backend_addr, e
            );
            ServerError::BackendUnavailable {
                address: self.backend_addr.clone(),
                reason: e.to_string(),
            }
        })?;
        if let Err(e) = backend.set_nodelay(true) {
            debug!("[{}] Failed to set TCP_NODELAY on backend: {}", conn_id, e);
        }
        Ok(backend)
    }
}

/// Primary listener, plus the secure listener when one is configured
pub struct TunnelServer {
    config: ServerConfig,
    handler: ConnectionHandler,
}

impl TunnelServer {
    pub fn new(config: ServerConfig) -> Self {
        let handler = ConnectionHandler::new(&config, ConnectionRegistry::new());
        Self { config, handler }
    }

    /// Inspect every accepted upgrade request
    pub fn with_observer(mut self, observer: HandshakeObserver) -> Self {
        self.handler = self.handler.with_observer(observer);
        self
    }

    pub fn with_tunnel_hook(mut self, hook: TunnelHook) -> Self {
        self.handler = self.handler.with_tunnel_hook(hook);
        self
    }

    pub fn registry(&self) -> ConnectionRegistry {
        self.handler.registry().clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind and serve until the process exits
    pub async fn start(self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Bind the primary listener
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        self.config.validate()?;
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| ServerError::bind(self.config.bind_addr, e))?;
        info!(
            "Tunnel server listening on {} (backend {}, legacy {})",
            listener.local_addr()?,
            self.config.backend_addr,
            if self.config.disable_legacy { "disabled" } else { "enabled" }
        );
        Ok(listener)
    }

    /// Accept on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<(), ServerError> {
        if let Some(secure) = &self.config.secure {
            match SecureListener::bind(secure, self.handler.clone()).await {
                Ok(secure_listener) => {
                    tokio::spawn(secure_listener.run());
                }
                Err(e) => warn!("Secure listener not started: {}", e),
            }
        }

        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    if let Err(e) = socket.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
                    }

                    let handler = self.handler.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handler.handle_plain(socket, peer_addr).await {
                            debug!("Connection from {} ended: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Listener accept error: {}", e);
                }
            }
        }
    }
}
