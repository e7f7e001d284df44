//! MITM (Man-in-the-Middle) interception module
//!
//! This module provides:
//! - Root CA generation and loading
//! - Dynamic leaf certificate generation for intercepted hosts
//! - TLS configuration for the client and upstream sides
//! - Incremental HTTP/1.x parsing
//! - The per-connection filtering pipeline

pub mod ca;
pub(crate) mod cert_cache;
pub mod certificate_authority;
pub mod error;
pub mod http_parser;
pub mod interceptor;
pub mod pipeline;
pub mod tls_config;

// Re-export main types
pub use ca::{CaConfig, RootCa};
pub use certificate_authority::{CacheStats, CertificateAuthority, HostIdentifier, LeafCertificate};
pub use error::MitmError;
pub use http_parser::{
    HttpRequest, HttpResponse, HttpVersion, ParseError as HttpParseError, ParseStatus,
    RequestParser, ResponseParser,
};
pub use interceptor::{InterceptionError, InterceptorSettings, MitmInterceptor};
pub use pipeline::{
    ConnectionContext, FilterPipeline, PlainUpstream, Scheme, TlsUpstream, Upstream,
};
pub use tls_config::{ClientTlsConfig, SniUtils, TlsVersion, UpstreamTlsConfig};
