//! TLS configuration for both sides of an intercepted connection
//!
//! - Client-facing TLS (proxy ← client) with a leaf certificate signed by the root
//! - Upstream TLS (proxy → origin) with real verification
//!
//! Only `http/1.1` is offered over ALPN so clients never negotiate HTTP/2
//! with the engine.

use super::error::{MitmError, Result};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::version::{TLS12, TLS13};
use rustls::{ClientConfig, RootCertStore, ServerConfig, SupportedProtocolVersion};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use webpki_roots::TLS_SERVER_ROOTS;

/// ALPN protocol offered to clients and origins
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

static TLS12_AND_13: &[&SupportedProtocolVersion] = &[&TLS12, &TLS13];
static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&TLS13];

/// TLS version preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsVersion {
    /// TLS 1.2 and 1.3
    #[default]
    Tls12And13,
    /// TLS 1.3 only
    Tls13Only,
}

impl TlsVersion {
    fn versions(self) -> &'static [&'static SupportedProtocolVersion] {
        match self {
            TlsVersion::Tls12And13 => TLS12_AND_13,
            TlsVersion::Tls13Only => TLS13_ONLY,
        }
    }
}

pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Client-facing TLS config (proxy acts as server with a minted leaf)
pub struct ClientTlsConfig {
    config: Arc<ServerConfig>,
}

impl ClientTlsConfig {
    /// Build a server config presenting `cert_chain`
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
        tls_version: TlsVersion,
    ) -> Result<Self> {
        let mut config = ServerConfig::builder_with_provider(crypto_provider())
            .with_protocol_versions(tls_version.versions())
            .map_err(|e| MitmError::TlsConfigFailed(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(cert_chain, private_key)
            .map_err(|e| MitmError::TlsConfigFailed(e.to_string()))?;

        config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Get rustls ServerConfig
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.config)
    }
}

/// Upstream TLS config (proxy acts as client with real verification)
#[derive(Clone)]
pub struct UpstreamTlsConfig {
    config: Arc<ClientConfig>,
}

impl UpstreamTlsConfig {
    /// Verify origins against the bundled Mozilla roots
    pub fn new(tls_version: TlsVersion) -> Result<Self> {
        let mut root_store = RootCertStore::empty();
        root_store.extend(TLS_SERVER_ROOTS.iter().cloned());

        info!(
            tls_version = ?tls_version,
            roots_count = TLS_SERVER_ROOTS.len(),
            "Upstream TLS config created"
        );
        Self::with_roots(root_store, tls_version)
    }

    /// Verify origins against the certificates in a PEM bundle
    pub fn from_ca_bundle(path: impl AsRef<Path>, tls_version: TlsVersion) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            MitmError::TlsConfigFailed(format!(
                "Failed to open CA bundle {}: {}",
                path.display(),
                e
            ))
        })?;

        let mut reader = BufReader::new(file);
        let certs = rustls_pemfile::certs(&mut reader)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| MitmError::TlsConfigFailed(format!("Failed to parse CA bundle: {}", e)))?;

        let mut root_store = RootCertStore::empty();
        let (added, ignored) = root_store.add_parsable_certificates(certs);
        if added == 0 {
            return Err(MitmError::TlsConfigFailed(format!(
                "No usable certificates in CA bundle {}",
                path.display()
            )));
        }

        info!(
            bundle = %path.display(),
            added,
            ignored,
            "Upstream TLS config created from CA bundle"
        );
        Self::with_roots(root_store, tls_version)
    }

    /// Verify origins against an explicit root store
    pub fn with_roots(root_store: RootCertStore, tls_version: TlsVersion) -> Result<Self> {
        let mut config = ClientConfig::builder_with_provider(crypto_provider())
            .with_protocol_versions(tls_version.versions())
            .map_err(|e| MitmError::TlsConfigFailed(e.to_string()))?
            .with_root_certificates(root_store)
            .with_no_client_auth();

        config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Get rustls ClientConfig
    pub fn client_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.config)
    }
}

/// SNI (Server Name Indication) utilities
pub struct SniUtils;

impl SniUtils {
    /// Parse hostname into ServerName for SNI
    pub fn parse_server_name(hostname: &str) -> Result<ServerName<'static>> {
        ServerName::try_from(hostname.to_owned())
            .map_err(|e| MitmError::InvalidHost(format!("{}: {}", hostname, e)))
    }

    /// Validate hostname format
    pub fn validate_hostname(hostname: &str) -> bool {
        let valid = !hostname.is_empty()
            && !hostname.starts_with('.')
            && !hostname.ends_with('.')
            && hostname.len() <= 253;
        if !valid {
            debug!(hostname, "Rejected SNI hostname");
        }
        valid
    }
}
