//! Engine-level errors

use crate::filtering::RuleError;
use crate::mitm::{HttpParseError, MitmError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid settings or unusable CA material; aborts construction
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Rule error: {0}")]
    Rule(#[from] RuleError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] HttpParseError),

    #[error("TLS error: {0}")]
    Tls(#[from] MitmError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Engine is not running")]
    NotRunning,
}

impl EngineError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}
