//! Categorized CSS selectors for element hiding

use super::category::Category;
use super::domain::host_matches_domain;
use super::error::{Result, RuleError};
use scraper::Selector;
use std::fmt;

/// A compiled CSS selector scoped to domains and tagged with a category
///
/// Construction compiles the selector text; an instance never exists without
/// a compiled selector.
pub struct CategorizedSelector {
    domains: Vec<String>,
    excluded_domains: Vec<String>,
    category: Category,
    selector_text: String,
    compiled: Selector,
}

impl CategorizedSelector {
    /// Compile `selector_text` for the given domain scope
    ///
    /// An empty `domains` list means the selector applies everywhere.
    pub fn new(
        domains: Vec<String>,
        excluded_domains: Vec<String>,
        selector_text: &str,
        category: Category,
    ) -> Result<Self> {
        let compiled = compile_selector(selector_text)?;

        Ok(Self {
            domains,
            excluded_domains,
            category,
            selector_text: selector_text.trim().to_string(),
            compiled,
        })
    }

    /// Selector text as written in the list
    pub fn original_selector(&self) -> &str {
        &self.selector_text
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    pub fn excluded_domains(&self) -> &[String] {
        &self.excluded_domains
    }

    pub fn selector(&self) -> &Selector {
        &self.compiled
    }

    /// True when a `~domain` entry covers `host`
    pub fn is_excluded_for(&self, host: &str) -> bool {
        self.excluded_domains
            .iter()
            .any(|d| host_matches_domain(host, d))
    }
}

impl fmt::Debug for CategorizedSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CategorizedSelector")
            .field("domains", &self.domains)
            .field("excluded_domains", &self.excluded_domains)
            .field("category", &self.category)
            .field("selector", &self.selector_text)
            .finish()
    }
}

/// A `#@#` rule cancelling a selector on some domains
#[derive(Debug, Clone)]
pub struct SelectorException {
    pub domains: Vec<String>,
    pub selector_text: String,
    pub category: Category,
}

/// Compile selector text through the CSS selector engine
pub fn compile_selector(selector_text: &str) -> Result<Selector> {
    let text = selector_text.trim();
    if text.is_empty() {
        return Err(RuleError::invalid_selector(text, "empty selector"));
    }

    Selector::parse(text).map_err(|e| RuleError::invalid_selector(text, format!("{:?}", e)))
}
