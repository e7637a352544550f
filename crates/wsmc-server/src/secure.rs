//! TLS listener with SNI-selected certificates
//!
//! Binds its own port next to the primary listener. Connections are
//! decrypted with the certificate chosen by [`SniVirtualHostRouter`] and then
//! go straight to the upgrade negotiator; legacy clients are not accepted
//! here.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

use crate::config::SecureListenerConfig;
use crate::error::ServerError;
use crate::listener::ConnectionHandler;
use crate::sni::SniVirtualHostRouter;

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SecureListener {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    router: Arc<SniVirtualHostRouter>,
    handler: ConnectionHandler,
}

impl std::fmt::Debug for SecureListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureListener")
            .field("local_addr", &self.listener.local_addr().ok())
            .field("router", &self.router)
            .finish()
    }
}

impl SecureListener {
    /// Load certificates from `config.cert_dir` and bind `config.bind_addr`.
    ///
    /// Fails without binding when the directory yields no usable pair.
    pub async fn bind(
        config: &SecureListenerConfig,
        handler: ConnectionHandler,
    ) -> Result<Self, ServerError> {
        let router = Arc::new(SniVirtualHostRouter::load(&config.cert_dir)?);
        Self::bind_with_router(config.bind_addr, router, handler).await
    }

    pub async fn bind_with_router(
        bind_addr: SocketAddr,
        router: Arc<SniVirtualHostRouter>,
        handler: ConnectionHandler,
    ) -> Result<Self, ServerError> {
        let acceptor = TlsAcceptor::from(Arc::new(router.server_config()));
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| ServerError::bind(bind_addr, e))?;

        info!(
            "Secure listener on {} with {} certificate(s), default {}",
            listener.local_addr()?,
            router.len(),
            router.default_name()
        );

        Ok(Self {
            listener,
            acceptor,
            router,
            handler,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn router(&self) -> &Arc<SniVirtualHostRouter> {
        &self.router
    }

    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((socket, peer_addr)) => {
                    if let Err(e) = socket.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
                    }

                    let acceptor = self.acceptor.clone();
                    let handler = self.handler.clone();
                    tokio::spawn(async move {
                        let tls = match accept_tls(&acceptor, socket, peer_addr).await {
                            Ok(tls) => tls,
                            Err(e) => {
                                debug!("{}", e);
                                return;
                            }
                        };

                        debug!(
                            "TLS session from {} (SNI {:?})",
                            peer_addr,
                            tls.get_ref().1.server_name()
                        );

                        if let Err(e) = handler.handle_secure(tls, peer_addr).await {
                            debug!("TLS connection from {} ended: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Secure listener accept error: {}", e);
                }
            }
        }
    }
}

/// TLS server handshake bounded by [`TLS_HANDSHAKE_TIMEOUT`]
async fn accept_tls<IO>(
    acceptor: &TlsAcceptor,
    io: IO,
    peer_addr: SocketAddr,
) -> Result<TlsStream<IO>, ServerError>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(io)).await {
        Ok(Ok(tls)) => Ok(tls),
        Ok(Err(e)) => Err(ServerError::TlsHandshake(format!("{}: {}", peer_addr, e))),
        Err(_) => Err(ServerError::TlsHandshake(format!("{}: timed out", peer_addr))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    fn acceptor() -> TlsAcceptor {
        let dir = tempfile::tempdir().unwrap();
        let cert = rcgen::generate_simple_self_signed(vec!["play.example".to_string()]).unwrap();
        std::fs::write(dir.path().join("play.example.crt"), cert.cert.pem()).unwrap();
        std::fs::write(dir.path().join("play.example.key"), cert.key_pair.serialize_pem()).unwrap();

        let router = Arc::new(SniVirtualHostRouter::load(dir.path()).unwrap());
        TlsAcceptor::from(Arc::new(router.server_config()))
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_plaintext_client_fails_tls_handshake() {
        let (mut client, server) = duplex(4096);
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: play.example\r\n\r\n")
            .await
            .unwrap();

        let err = accept_tls(&acceptor(), server, peer()).await.unwrap_err();
        match err {
            ServerError::TlsHandshake(reason) => assert!(reason.starts_with("127.0.0.1:40000")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_client_times_out() {
        let (_client, server) = duplex(4096);
        let err = accept_tls(&acceptor(), server, peer()).await.unwrap_err();
        match err {
            ServerError::TlsHandshake(reason) => assert!(reason.ends_with("timed out")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
