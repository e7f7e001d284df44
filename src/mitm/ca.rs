//! Root certificate authority
//!
//! The root is either generated when the engine is constructed or loaded
//! from PEM files. It is read-only afterwards; leaf certificates are signed
//! with it by [`super::certificate_authority::CertificateAuthority`].

use super::error::{MitmError, Result};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::CertificateDer;
use std::fs;
use std::path::Path;
use tracing::info;

/// Subject fields for a generated root
#[derive(Debug, Clone)]
pub struct CaConfig {
    /// Organization name for generated certificates
    pub organization: String,

    /// Common name of the root
    pub common_name: String,

    /// Country code for generated certificates
    pub country: String,

    /// Root validity in days
    pub validity_days: u32,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            organization: "Filterproxy".to_string(),
            common_name: "Filterproxy Root CA".to_string(),
            country: "US".to_string(),
            validity_days: 3650,
        }
    }
}

/// Root certificate and its signing key
pub struct RootCa {
    /// Issuer used by rcgen when signing leaves
    issuer: Certificate,

    /// Signing key
    key: KeyPair,

    /// Certificate as distributed to clients
    pem: String,
    der: CertificateDer<'static>,
}

impl RootCa {
    /// Generate a fresh self-signed root
    pub fn generate(config: &CaConfig) -> Result<Self> {
        info!("Generating CA certificate and private key");

        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);

        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::OrganizationName, &config.organization);
        distinguished_name.push(DnType::CommonName, &config.common_name);
        distinguished_name.push(DnType::CountryName, &config.country);
        params.distinguished_name = distinguished_name;

        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::days(1);
        params.not_after = now + time::Duration::days(i64::from(config.validity_days));

        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let key = KeyPair::generate()
            .map_err(|e| MitmError::ca_generation(format!("Failed to generate key pair: {}", e)))?;

        let issuer = params
            .self_signed(&key)
            .map_err(|e| {
                MitmError::ca_generation(format!("Failed to self-sign certificate: {}", e))
            })?;

        let pem = issuer.pem();
        let der = issuer.der().clone();

        Ok(Self {
            issuer,
            key,
            pem,
            der,
        })
    }

    /// Load a root from PEM text
    ///
    /// The certificate must carry CA basic constraints.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key = KeyPair::from_pem(key_pem)
            .map_err(|e| MitmError::ca_load(format!("Failed to parse private key: {}", e)))?;

        let der = first_certificate(cert_pem)?;

        let params = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| MitmError::ca_load(format!("Failed to parse certificate: {}", e)))?;

        if !matches!(params.is_ca, IsCa::Ca(_)) {
            return Err(MitmError::ca_load("certificate is not a CA"));
        }

        // Re-signing the parsed parameters gives rcgen an issuer with the
        // same subject and key; clients still receive the original DER.
        let issuer = params
            .self_signed(&key)
            .map_err(|e| MitmError::ca_load(format!("Failed to reconstruct certificate: {}", e)))?;

        Ok(Self {
            issuer,
            key,
            pem: cert_pem.to_string(),
            der,
        })
    }

    /// Load a root from a certificate file and a key file
    pub fn from_files(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();
        info!(cert = %cert_path.display(), key = %key_path.display(), "Loading CA from disk");

        let cert_pem = fs::read_to_string(cert_path)
            .map_err(|e| MitmError::ca_load(format!("Failed to read cert file: {}", e)))?;
        let key_pem = fs::read_to_string(key_path)
            .map_err(|e| MitmError::ca_load(format!("Failed to read key file: {}", e)))?;

        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Write the root certificate and key as PEM files
    pub fn save(&self, cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<()> {
        fs::write(cert_path.as_ref(), &self.pem)
            .map_err(|e| MitmError::ca_generation(format!("Failed to save certificate: {}", e)))?;
        fs::write(key_path.as_ref(), self.key.serialize_pem())
            .map_err(|e| MitmError::ca_generation(format!("Failed to save private key: {}", e)))?;
        Ok(())
    }

    /// Root certificate PEM, for installation in client trust stores
    pub fn pem(&self) -> &str {
        &self.pem
    }

    pub fn der(&self) -> &CertificateDer<'static> {
        &self.der
    }

    pub(crate) fn issuer(&self) -> &Certificate {
        &self.issuer
    }

    pub(crate) fn key(&self) -> &KeyPair {
        &self.key
    }
}

impl std::fmt::Debug for RootCa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootCa").finish_non_exhaustive()
    }
}

fn first_certificate(pem: &str) -> Result<CertificateDer<'static>> {
    let mut reader = pem.as_bytes();
    // Bound so the iterator borrowing `reader` is dropped first
    let first = rustls_pemfile::certs(&mut reader)
        .next()
        .ok_or_else(|| MitmError::ca_load("No certificate found in PEM"))?
        .map_err(|e| MitmError::ca_load(format!("Failed to decode PEM: {}", e)));
    first
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_root_pem() {
        let ca = RootCa::generate(&CaConfig::default()).unwrap();
        assert!(ca.pem().starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(!ca.der().is_empty());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("ca.crt");
        let key_path = dir.path().join("ca.key");

        let ca = RootCa::generate(&CaConfig::default()).unwrap();
        ca.save(&cert_path, &key_path).unwrap();

        let loaded = RootCa::from_files(&cert_path, &key_path).unwrap();
        assert_eq!(loaded.pem(), ca.pem());
        assert_eq!(loaded.der(), ca.der());
    }

    #[test]
    fn test_invalid_material_rejected() {
        assert!(RootCa::from_pem("not a cert", "not a key").is_err());
        assert!(RootCa::from_files("/nonexistent/ca.crt", "/nonexistent/ca.key").is_err());
    }

    #[test]
    fn test_leaf_cert_is_not_accepted_as_root() {
        let mut params = CertificateParams::new(vec!["leaf.example.com".to_string()]).unwrap();
        params.is_ca = IsCa::ExplicitNoCa;
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();

        let result = RootCa::from_pem(&cert.pem(), &key.serialize_pem());
        assert!(matches!(result, Err(MitmError::CaLoadFailed(_))));
    }
}
