//! Filterproxy - MITM HTTP/HTTPS content filtering engine
//!
//! Filterproxy terminates client connections on local HTTP and HTTPS ports,
//! decrypts TLS with leaf certificates minted on demand from a local root CA,
//! and filters the plaintext traffic against categorized rule lists.
//!
//! ## Features
//!
//! - **Rule lists**: adblock-style network rules, hosts files, element-hiding
//!   selectors and content trigger phrases, grouped by category
//! - **Request blocking**: matching requests get a local block page and are
//!   never forwarded
//! - **Element hiding**: matched elements are removed from HTML documents
//!   before they reach the client
//! - **TLS interception**: SNI-addressed and CONNECT-addressed traffic
//! - **Live reload**: lists load and unload without stalling connections
//!
//! ## Usage
//!
//! ```rust,no_run
//! use filterproxy::{Category, EngineCallbacks, EngineConfig, FilteringEngine};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let callbacks = EngineCallbacks::new()
//!         .with_on_elements_blocked(|host, count| println!("{}: {} elements", host, count));
//!     let engine = FilteringEngine::new(EngineConfig::default(), callbacks)?;
//!
//!     let ads = Category(1);
//!     engine.load_filtering_list_from_string("##.ad-banner\n||ads.example.com^\n", ads, true);
//!     engine.set_category_enabled(ads, true);
//!     engine.start()?;
//!
//!     println!("{}", engine.root_certificate_pem());
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - `filtering` - rule model, list parsing, rule store, HTML filtering
//! - `mitm` - CA, leaf certificates, TLS configs, HTTP parser, pipeline
//! - `engine` - lifecycle, listeners and runtime
//! - `control` - handle-based surface for embedding hosts

pub mod callbacks;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod filtering;
pub mod mitm;

// Re-export commonly used types

/// Configuration types
pub use config::{EngineConfig, ListSource};

/// Engine and callbacks
pub use callbacks::{
    BlockReason, BlockedRequest, EngineCallbacks, EventReporter, FirewallRequest, ListenerKind,
};
pub use engine::FilteringEngine;
pub use error::EngineError;

/// Rules and filtering
pub use filtering::{
    Category, CategoryMask, ClassifyRequest, ContentVerdict, EngineOption, LoadCounts,
    RuleError, RuleStore,
};

/// MITM types and functionality
pub use mitm::{
    CertificateAuthority, HostIdentifier, InterceptionError, MitmError, MitmInterceptor, RootCa,
    UpstreamTlsConfig,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
