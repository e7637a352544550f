//! SNI-based certificate selection for the secure listener
//!
//! Every `<name>.crt` or `<name>.pem` in the certificate directory that has a
//! matching `<name>.key` becomes one TLS identity, selected when the client's
//! SNI equals `<name>`. The first pair loaded (in file-name order) serves
//! clients that send no SNI or an unknown one. The map is built once and
//! never mutated.

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace, warn};
use wsmc_transport::tls::{ensure_crypto_provider, load_certs, load_private_key};

/// SNI routing errors
#[derive(Debug, Error)]
pub enum SniRouterError {
    #[error("Certificate directory not found: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("No valid certificate/key pairs found in {0}")]
    NoCertificates(PathBuf),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid certificate pair {name}: {reason}")]
    InvalidPair { name: String, reason: String },
}

pub struct SniVirtualHostRouter {
    contexts: HashMap<String, Arc<CertifiedKey>>,
    names: Vec<String>,
    default: Arc<CertifiedKey>,
}

impl fmt::Debug for SniVirtualHostRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SniVirtualHostRouter")
            .field("names", &self.names)
            .finish()
    }
}

impl SniVirtualHostRouter {
    /// Scan `dir` once and load every usable certificate pair
    pub fn load(dir: &Path) -> Result<Self, SniRouterError> {
        if !dir.is_dir() {
            return Err(SniRouterError::DirectoryNotFound(dir.to_path_buf()));
        }

        let mut cert_files: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_certificate_file(path))
            .collect();
        cert_files.sort();

        let mut pairs = Vec::new();
        for cert_path in cert_files {
            let Some(name) = cert_path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let key_path = dir.join(format!("{}.key", name));
            if !key_path.is_file() {
                debug!("Skipping {}: no matching key file", cert_path.display());
                continue;
            }

            match load_pair(name, &cert_path, &key_path) {
                Ok(key) => {
                    info!("Loading certificate: {}", cert_path.display());
                    pairs.push((name.to_string(), key));
                }
                Err(e) => warn!("Skipping certificate {}: {}", cert_path.display(), e),
            }
        }

        Self::from_pairs(pairs).map_err(|e| match e {
            SniRouterError::NoCertificates(_) => SniRouterError::NoCertificates(dir.to_path_buf()),
            other => other,
        })
    }

    /// Build from already-loaded identities; the first becomes the default
    pub fn from_pairs(pairs: Vec<(String, Arc<CertifiedKey>)>) -> Result<Self, SniRouterError> {
        let Some((_, default)) = pairs.first() else {
            return Err(SniRouterError::NoCertificates(PathBuf::new()));
        };
        let default = default.clone();

        let mut contexts = HashMap::new();
        let mut names = Vec::new();
        for (name, key) in pairs {
            // rustls lowercases the SNI it hands to the resolver, so keys are lowercased too
            let lookup = name.to_ascii_lowercase();
            if contexts.contains_key(&lookup) {
                debug!("Duplicate certificate name {}, keeping the first", name);
                continue;
            }
            contexts.insert(lookup, key);
            names.push(name);
        }

        Ok(Self {
            contexts,
            names,
            default,
        })
    }

    /// Names in load order; the first is the default
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn default_name(&self) -> &str {
        self.names.first().map(String::as_str).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Identity for `sni`: exact (ASCII case-insensitive) name match, else the
    /// default
    pub fn select(&self, sni: Option<&str>) -> Arc<CertifiedKey> {
        match sni.and_then(|name| self.contexts.get(&name.to_ascii_lowercase())) {
            Some(key) => {
                trace!("SNI {:?} matched a certificate", sni);
                key.clone()
            }
            None => {
                trace!("SNI {:?} using default certificate", sni);
                self.default.clone()
            }
        }
    }

    /// rustls server config resolving certificates through this router
    pub fn server_config(self: &Arc<Self>) -> rustls::ServerConfig {
        ensure_crypto_provider();
        let mut config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(self.clone());
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        config
    }
}

impl ResolvesServerCert for SniVirtualHostRouter {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.select(client_hello.server_name()))
    }
}

fn is_certificate_file(path: &Path) -> bool {
    path.is_file()
        && matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("crt") | Some("pem")
        )
}

fn load_pair(name: &str, cert_path: &Path, key_path: &Path) -> Result<Arc<CertifiedKey>, SniRouterError> {
    let invalid = |reason: String| SniRouterError::InvalidPair {
        name: name.to_string(),
        reason,
    };

    ensure_crypto_provider();
    let certs = load_certs(cert_path).map_err(|e| invalid(e.to_string()))?;
    let key = load_private_key(key_path).map_err(|e| invalid(e.to_string()))?;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| invalid(e.to_string()))?;

    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_pair(dir: &Path, name: &str, cert_ext: &str) {
        let cert = rcgen::generate_simple_self_signed(vec![format!("{}.example", name)]).unwrap();
        std::fs::write(dir.join(format!("{}.{}", name, cert_ext)), cert.cert.pem()).unwrap();
        std::fs::write(dir.join(format!("{}.key", name)), cert.key_pair.serialize_pem()).unwrap();
    }

    #[test]
    fn test_load_pairs_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        write_pair(dir.path(), "b", "pem");
        write_pair(dir.path(), "a", "crt");

        let router = SniVirtualHostRouter::load(dir.path()).unwrap();
        assert_eq!(router.names(), &["a".to_string(), "b".to_string()]);
        assert_eq!(router.default_name(), "a");
    }

    #[test]
    fn test_select_by_name_with_default_fallback() {
        let dir = tempfile::tempdir().unwrap();
        write_pair(dir.path(), "a", "crt");
        write_pair(dir.path(), "b", "crt");
        let router = SniVirtualHostRouter::load(dir.path()).unwrap();

        let a = router.select(Some("a"));
        let b = router.select(Some("b"));
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&router.select(Some("B")), &b));
        assert!(Arc::ptr_eq(&router.select(None), &a));
        assert!(Arc::ptr_eq(&router.select(Some("unknown.example")), &a));
    }

    #[test]
    fn test_mixed_case_file_name_matches_lowercase_sni() {
        let dir = tempfile::tempdir().unwrap();
        write_pair(dir.path(), "Default", "crt");
        write_pair(dir.path(), "Play.Example", "crt");
        let router = SniVirtualHostRouter::load(dir.path()).unwrap();

        assert_eq!(router.names(), &["Default".to_string(), "Play.Example".to_string()]);
        let default = router.select(None);
        let play = router.select(Some("play.example"));
        assert!(!Arc::ptr_eq(&play, &default));
    }

    #[test]
    fn test_unpaired_and_broken_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_pair(dir.path(), "good", "crt");
        std::fs::write(dir.path().join("lonely.crt"), "no key for me").unwrap();
        std::fs::write(dir.path().join("broken.crt"), "not a certificate").unwrap();
        std::fs::write(dir.path().join("broken.key"), "not a key").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let router = SniVirtualHostRouter::load(dir.path()).unwrap();
        assert_eq!(router.names(), &["good".to_string()]);
    }

    #[test]
    fn test_empty_directory_has_no_certificates() {
        let dir = tempfile::tempdir().unwrap();
        let err = SniVirtualHostRouter::load(dir.path()).unwrap_err();
        assert!(matches!(err, SniRouterError::NoCertificates(p) if p == dir.path()));
    }

    #[test]
    fn test_missing_directory() {
        let err = SniVirtualHostRouter::load(Path::new("/nonexistent/wsmc-certs")).unwrap_err();
        assert!(matches!(err, SniRouterError::DirectoryNotFound(_)));
    }
}
