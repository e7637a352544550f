use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsConnector;
use wsmc_server::{
    ConnectionHandler, ConnectionRegistry, SecureListener, SecureListenerConfig, ServerConfig,
    ServerError, SniRouterError,
};

/// Accepts any certificate and remembers the leaf it was shown
#[derive(Debug, Default)]
struct RecordingVerifier {
    seen: Mutex<Option<Vec<u8>>>,
}

impl ServerCertVerifier for RecordingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        *self.seen.lock().unwrap() = Some(end_entity.as_ref().to_vec());
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Write `<name>.crt`/`<name>.key` and return the certificate DER
fn write_pair(dir: &Path, name: &str) -> Vec<u8> {
    let cert = rcgen::generate_simple_self_signed(vec![name.to_string()]).unwrap();
    std::fs::write(dir.join(format!("{}.crt", name)), cert.cert.pem()).unwrap();
    std::fs::write(dir.join(format!("{}.key", name)), cert.key_pair.serialize_pem()).unwrap();
    cert.cert.der().to_vec()
}

async fn start_secure(cert_dir: &Path) -> SocketAddr {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend.local_addr().unwrap();
    let config = ServerConfig::new("127.0.0.1:0".parse().unwrap(), backend_addr.to_string());
    let handler = ConnectionHandler::new(&config, ConnectionRegistry::new());

    let secure = SecureListenerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        cert_dir: cert_dir.to_path_buf(),
    };
    let listener = SecureListener::bind(&secure, handler).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(listener.run());
    addr
}

/// Handshake presenting `sni` (or none) and return the leaf the server chose
async fn presented_certificate(addr: SocketAddr, sni: Option<&str>) -> Vec<u8> {
    let verifier = Arc::new(RecordingVerifier::default());
    let mut config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .dangerous()
    .with_custom_certificate_verifier(verifier.clone())
    .with_no_client_auth();
    config.enable_sni = sni.is_some();

    let server_name = ServerName::try_from(sni.unwrap_or("localhost").to_string()).unwrap();
    let tcp = TcpStream::connect(addr).await.unwrap();
    let mut tls = TlsConnector::from(Arc::new(config))
        .connect(server_name, tcp)
        .await
        .unwrap();

    // a plain request exercises the decrypted path behind the handshake
    tls.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    let _ = tls.read_to_end(&mut response).await;
    assert!(response.starts_with(b"HTTP/1.1 200 OK"));

    let seen = verifier.seen.lock().unwrap().clone();
    seen.unwrap()
}

#[tokio::test]
async fn test_sni_selects_matching_certificate() {
    let dir = tempfile::tempdir().unwrap();
    let cert_a = write_pair(dir.path(), "a");
    let cert_b = write_pair(dir.path(), "b");
    let addr = start_secure(dir.path()).await;

    assert_eq!(presented_certificate(addr, Some("b")).await, cert_b);
    assert_eq!(presented_certificate(addr, Some("a")).await, cert_a);
}

#[tokio::test]
async fn test_missing_or_unknown_sni_gets_default() {
    let dir = tempfile::tempdir().unwrap();
    let cert_a = write_pair(dir.path(), "a");
    write_pair(dir.path(), "b");
    let addr = start_secure(dir.path()).await;

    assert_eq!(presented_certificate(addr, None).await, cert_a);
    assert_eq!(presented_certificate(addr, Some("other.example")).await, cert_a);
}

#[tokio::test]
async fn test_no_certificates_means_no_listener() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig::default();
    let handler = ConnectionHandler::new(&config, ConnectionRegistry::new());
    let secure = SecureListenerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        cert_dir: dir.path().to_path_buf(),
    };

    let err = SecureListener::bind(&secure, handler).await.unwrap_err();
    assert!(matches!(
        err,
        ServerError::CertificateError(SniRouterError::NoCertificates(_))
    ));
}
