//! Rule loading errors

use thiserror::Error;

/// Result type for rule operations
pub type Result<T> = std::result::Result<T, RuleError>;

/// Errors raised while compiling a single rule or reading a list
///
/// Per-line variants never escape a load call; they are folded into the
/// failed count. Only `Io` is returned to the caller.
#[derive(Error, Debug)]
pub enum RuleError {
    /// The CSS selector compiler rejected the selector text
    #[error("Invalid selector '{selector}': {reason}")]
    InvalidSelector { selector: String, reason: String },

    /// A network rule pattern could not be compiled
    #[error("Invalid pattern '{0}'")]
    InvalidPattern(String),

    /// A `$option` the engine cannot honour
    #[error("Unsupported rule option: {0}")]
    UnsupportedOption(String),

    /// Cosmetic syntax other than plain element hiding
    #[error("Unsupported rule syntax: {0}")]
    UnsupportedSyntax(String),

    /// A domain in a rule's domain list is malformed
    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    /// The list file could not be read
    #[error("Failed to read rule list: {0}")]
    Io(#[from] std::io::Error),
}

impl RuleError {
    pub fn invalid_selector(selector: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSelector {
            selector: selector.into(),
            reason: reason.into(),
        }
    }
}
