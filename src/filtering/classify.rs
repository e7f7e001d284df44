//! Response classification

use super::category::Category;

/// Decision for a response body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentVerdict {
    /// Use the content-type rule
    Default,
    /// Treat as an HTML document and filter it
    Html,
    /// Relay unmodified
    Passthrough,
    /// Replace with a block page if the category is enabled
    Block(Category),
}

/// Facts handed to the classify callback
#[derive(Debug, Clone, Copy)]
pub struct ClassifyRequest<'a> {
    pub host: &'a str,
    pub url: &'a str,
    /// Raw `Content-Type` header value, if any
    pub content_type: Option<&'a str>,
    pub status: u16,
}

/// Media type without parameters, lower-cased
pub fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Default rule: `text/html` and `application/xhtml+xml` are HTML
pub fn is_html_content_type(content_type: Option<&str>) -> bool {
    content_type
        .map(media_type)
        .is_some_and(|media| media == "text/html" || media == "application/xhtml+xml")
}

/// Combine a callback verdict with the content-type rule
///
/// Returns `Html`, `Passthrough` or `Block`; never `Default`.
pub fn resolve(verdict: ContentVerdict, content_type: Option<&str>) -> ContentVerdict {
    match verdict {
        ContentVerdict::Default if is_html_content_type(content_type) => ContentVerdict::Html,
        ContentVerdict::Default => ContentVerdict::Passthrough,
        other => other,
    }
}
