//! MITM error types

use thiserror::Error;

/// Result type for MITM operations
pub type Result<T> = std::result::Result<T, MitmError>;

/// Certificate and TLS errors
#[derive(Error, Debug)]
pub enum MitmError {
    /// Root CA generation failed
    #[error("Failed to generate CA certificate: {0}")]
    CaGenerationFailed(String),

    /// Root CA material could not be read or is not a CA
    #[error("Failed to load CA certificate: {0}")]
    CaLoadFailed(String),

    /// Leaf certificate generation failed
    #[error("Failed to generate certificate for domain {domain}: {reason}")]
    CertGenerationFailed { domain: String, reason: String },

    /// TLS handshake failed on either side
    #[error("TLS handshake failed for {host}: {reason}")]
    TlsHandshakeFailed { host: String, reason: String },

    /// rustls rejected a configuration
    #[error("TLS configuration failed: {0}")]
    TlsConfigFailed(String),

    /// Host name unusable for SNI or a certificate
    #[error("Invalid host: {0}")]
    InvalidHost(String),

    /// Upstream TCP or TLS connection failed
    #[error("Upstream connection failed for {host}: {reason}")]
    UpstreamConnectionFailed { host: String, reason: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MitmError {
    /// Create a CA generation error
    pub fn ca_generation(msg: impl Into<String>) -> Self {
        Self::CaGenerationFailed(msg.into())
    }

    /// Create a CA load error
    pub fn ca_load(msg: impl Into<String>) -> Self {
        Self::CaLoadFailed(msg.into())
    }

    /// Create a certificate generation error
    pub fn cert_generation(domain: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::CertGenerationFailed {
            domain: domain.into(),
            reason: msg.into(),
        }
    }

    /// Create a TLS handshake error
    pub fn tls_handshake(host: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::TlsHandshakeFailed {
            host: host.into(),
            reason: msg.into(),
        }
    }

    pub fn upstream(host: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::UpstreamConnectionFailed {
            host: host.into(),
            reason: msg.into(),
        }
    }
}
