//! rustls helpers shared by the client connector and the secure listener

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::error::{TunnelError, TunnelResult};

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

pub fn load_certs(path: &Path) -> TunnelResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| TunnelError::TlsError(format!("Failed to open cert file: {}", e)))?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TunnelError::TlsError(format!("Failed to parse certs: {}", e)))?;

    if certs.is_empty() {
        return Err(TunnelError::TlsError(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

pub fn load_private_key(path: &Path) -> TunnelResult<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| TunnelError::TlsError(format!("Failed to open key file: {}", e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TunnelError::TlsError(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| TunnelError::TlsError("No private key found".to_string()))
}

/// Build a client connector.
///
/// With `root_certs` empty the webpki roots are trusted. `insecure` disables
/// certificate verification entirely.
pub fn build_tls_connector(
    insecure: bool,
    root_certs: &[CertificateDer<'static>],
) -> TunnelResult<tokio_rustls::TlsConnector> {
    ensure_crypto_provider();

    let client_crypto = if insecure {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(SkipVerification::new())
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        if root_certs.is_empty() {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        } else {
            for cert in root_certs {
                roots.add(cert.clone()).map_err(|e| {
                    TunnelError::ConfigurationError(format!("Invalid root cert: {}", e))
                })?;
            }
        }
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };

    Ok(tokio_rustls::TlsConnector::from(Arc::new(client_crypto)))
}

// Certificate verifier that skips verification (INSECURE)
#[derive(Debug)]
pub struct SkipVerification;

impl SkipVerification {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_cert_file() {
        let err = load_certs(Path::new("/nonexistent/wsmc.crt")).unwrap_err();
        assert!(matches!(err, TunnelError::TlsError(_)));
    }

    #[test]
    fn test_pem_without_certificates() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("empty.pem");
        std::fs::write(&file, b"not a pem file\n").unwrap();

        assert!(load_certs(&file).is_err());
        assert!(load_private_key(&file).is_err());
    }

    #[test]
    fn test_connectors_build() {
        assert!(build_tls_connector(false, &[]).is_ok());
        assert!(build_tls_connector(true, &[]).is_ok());
    }
}
