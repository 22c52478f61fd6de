//! TLS material and the certificate challenge table

use anyhow::{anyhow, Result};
use rustls::pki_types::CertificateDer;
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::sync::{Arc, RwLock};
use tidemail_common::config::TlsConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

/// Load certificate and key from disk and build an acceptor
pub fn create_tls_acceptor(tls_config: &TlsConfig) -> Result<TlsAcceptor> {
    let cert_file = File::open(&tls_config.cert_path)
        .map_err(|e| anyhow!("Failed to open certificate file: {}", e))?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs: Vec<CertificateDer<'static>> = certs(&mut cert_reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| anyhow!("Failed to parse certificates: {}", e))?;

    if certs.is_empty() {
        return Err(anyhow!("No certificates found in certificate file"));
    }

    info!("Loaded {} certificate(s)", certs.len());

    let key_file = File::open(&tls_config.key_path)
        .map_err(|e| anyhow!("Failed to open key file: {}", e))?;
    let mut key_reader = BufReader::new(key_file);
    let key = private_key(&mut key_reader)
        .map_err(|e| anyhow!("Failed to read private key: {}", e))?
        .ok_or_else(|| anyhow!("No private key found in key file"))?;

    let mut server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow!("Failed to create TLS config: {}", e))?;
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// Whether certificate material is present on disk
pub fn is_tls_configured(tls_config: &TlsConfig) -> bool {
    tls_config.cert_path.exists() && tls_config.key_path.exists()
}

/// Build an acceptor when certificate material exists.
///
/// Missing or unreadable material yields `None`; the TLS listeners are then
/// skipped for this generation.
pub fn load_acceptor(tls_config: &TlsConfig) -> Option<TlsAcceptor> {
    if !is_tls_configured(tls_config) {
        warn!(
            cert = %tls_config.cert_path.display(),
            "No certificate material found, TLS listeners disabled"
        );
        return None;
    }

    match create_tls_acceptor(tls_config) {
        Ok(acceptor) => Some(acceptor),
        Err(e) => {
            warn!("Failed to initialize TLS: {}. TLS listeners disabled.", e);
            None
        }
    }
}

/// In-memory table of pending certificate challenge tokens
#[derive(Debug, Clone, Default)]
pub struct ChallengeStore {
    tokens: Arc<RwLock<HashMap<String, String>>>,
}

impl ChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish the key authorization for a token
    pub fn insert(&self, token: impl Into<String>, key_authorization: impl Into<String>) {
        if let Ok(mut tokens) = self.tokens.write() {
            tokens.insert(token.into(), key_authorization.into());
        }
    }

    pub fn get(&self, token: &str) -> Option<String> {
        self.tokens.read().ok().and_then(|t| t.get(token).cloned())
    }

    pub fn remove(&self, token: &str) -> Option<String> {
        self.tokens.write().ok().and_then(|mut t| t.remove(token))
    }
}
