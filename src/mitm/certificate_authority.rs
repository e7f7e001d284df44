//! Leaf certificate generation for intercepted hosts
//!
//! Leaves are minted on demand, signed by the root and cached by host. Each
//! cached entry carries a ready-to-use rustls server config.

use super::ca::RootCa;
use super::cert_cache::CertCache;
use super::error::{MitmError, Result};
use super::tls_config::{ClientTlsConfig, TlsVersion};
use rcgen::{
    CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
    SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Host identifier for certificate generation
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub enum HostIdentifier {
    /// Regular domain (e.g., example.com)
    Domain(String),

    /// IP address (e.g., 192.168.1.1)
    IpAddress(IpAddr),
}

impl HostIdentifier {
    /// Parse from a hostname or IP literal
    pub fn from_hostname(hostname: &str) -> Result<Self> {
        let trimmed = hostname
            .trim()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .trim_end_matches('.');

        if let Ok(ip) = trimmed.parse::<IpAddr>() {
            return Ok(Self::IpAddress(ip));
        }

        let valid = !trimmed.is_empty()
            && trimmed.len() <= 253
            && trimmed
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_' | b'*'));
        if !valid {
            return Err(MitmError::InvalidHost(hostname.to_string()));
        }

        Ok(Self::Domain(trimmed.to_ascii_lowercase()))
    }

    /// Cache key and certificate subject
    pub fn name(&self) -> String {
        match self {
            HostIdentifier::Domain(domain) => domain.clone(),
            HostIdentifier::IpAddress(ip) => ip.to_string(),
        }
    }
}

/// A minted leaf and the TLS server config presenting it
pub struct LeafCertificate {
    host: HostIdentifier,
    der: CertificateDer<'static>,
    server_config: Arc<ServerConfig>,
}

impl LeafCertificate {
    pub fn host(&self) -> &HostIdentifier {
        &self.host
    }

    pub fn der(&self) -> &CertificateDer<'static> {
        &self.der
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.server_config)
    }
}

impl std::fmt::Debug for LeafCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafCertificate")
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub hit_rate: f64,
}

/// Certificate Authority - generates and caches leaf certificates
pub struct CertificateAuthority {
    root: Arc<RootCa>,
    cache: Mutex<CertCache<Arc<LeafCertificate>>>,
    validity_days: u32,
    tls_version: TlsVersion,
}

impl CertificateAuthority {
    pub fn new(root: Arc<RootCa>, cache_size: usize, validity_days: u32) -> Self {
        Self {
            root,
            cache: Mutex::new(CertCache::new(cache_size)),
            validity_days: validity_days.max(1),
            tls_version: TlsVersion::default(),
        }
    }

    pub fn root(&self) -> &RootCa {
        &self.root
    }

    /// Get or generate the leaf for `host`
    ///
    /// Signing happens outside the cache lock. When two tasks race for the
    /// same host, the first insert wins and the other leaf is dropped.
    pub async fn get_or_generate(&self, host: &str) -> Result<Arc<LeafCertificate>> {
        let host = HostIdentifier::from_hostname(host)?;
        let key = host.name();

        if let Some(leaf) = self.cache.lock().await.get(&key) {
            debug!(target_host = %key, "Certificate cache hit");
            return Ok(leaf);
        }

        debug!(target_host = %key, "Generating new certificate");
        let leaf = Arc::new(self.generate(host)?);

        Ok(self.cache.lock().await.insert_if_absent(key, leaf))
    }

    /// Sign a new leaf for `host` without touching the cache
    pub fn generate(&self, host: HostIdentifier) -> Result<LeafCertificate> {
        let name = host.name();
        let fail = |e: rcgen::Error| MitmError::cert_generation(name.clone(), e.to_string());

        // `new` turns IP literals into IP SANs and everything else into DNS SANs
        let mut params = CertificateParams::new(vec![name.clone()]).map_err(fail)?;
        params.distinguished_name.push(DnType::CommonName, name.as_str());
        params.is_ca = IsCa::ExplicitNoCa;
        params.use_authority_key_identifier_extension = true;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::days(1);
        params.not_after = now + time::Duration::days(i64::from(self.validity_days));
        params.serial_number = Some(SerialNumber::from(generate_serial_number()));

        let key_pair = KeyPair::generate().map_err(fail)?;
        let cert = params
            .signed_by(&key_pair, self.root.issuer(), self.root.key())
            .map_err(fail)?;

        let der = cert.der().clone();
        let chain = vec![der.clone(), self.root.der().clone()];
        let private_key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

        let server_config =
            ClientTlsConfig::new(chain, private_key, self.tls_version)?.server_config();

        Ok(LeafCertificate {
            host,
            der,
            server_config,
        })
    }

    /// Get cache statistics
    pub async fn cache_stats(&self) -> CacheStats {
        let cache = self.cache.lock().await;
        CacheStats {
            size: cache.len(),
            capacity: cache.capacity(),
            hit_rate: cache.hit_rate(),
        }
    }
}

/// Unique serial number from crypto RNG + timestamp
fn generate_serial_number() -> u64 {
    use rand::Rng;
    let random_part: u32 = rand::thread_rng().gen();
    let timestamp_part = chrono::Utc::now().timestamp() as u32;

    ((timestamp_part as u64) << 32) | (random_part as u64)
}
