//! HTML document filtering: element hiding and content-trigger scanning

use super::selector::CategorizedSelector;
use super::store::RuleMatches;
use super::trigger::TextTrigger;
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use scraper::Html;
use std::collections::HashSet;
use std::io::{self, Read};
use std::sync::Arc;

/// What happened to a document
#[derive(Debug)]
pub enum DocumentOutcome {
    /// Nothing matched; relay the original bytes
    Unchanged,
    /// Elements were removed
    Filtered { html: String, removed: usize },
    /// A content trigger was found in the document text
    Blocked(Arc<TextTrigger>),
}

/// Which passes to run over a document
#[derive(Debug, Clone, Copy)]
pub struct DocumentFilter {
    pub hide_elements: bool,
    pub scan_content: bool,
}

impl DocumentFilter {
    pub fn is_noop(&self, rules: &RuleMatches) -> bool {
        let hide = self.hide_elements && !rules.selectors.is_empty();
        let scan = self.scan_content && !rules.content_triggers.is_empty();
        !hide && !scan
    }

    /// Parse `source` once, scan its text, then remove matched elements
    ///
    /// Runs synchronously; the parsed DOM never crosses an await point.
    pub fn apply(&self, source: &str, rules: &RuleMatches) -> DocumentOutcome {
        if self.is_noop(rules) {
            return DocumentOutcome::Unchanged;
        }

        let mut document = Html::parse_document(source);

        if self.scan_content && !rules.content_triggers.is_empty() {
            let text = document
                .root_element()
                .text()
                .collect::<String>()
                .to_lowercase();
            if let Some(trigger) = rules
                .content_triggers
                .iter()
                .find(|t| t.matches_text(&text))
            {
                return DocumentOutcome::Blocked(Arc::clone(trigger));
            }
        }

        if !self.hide_elements {
            return DocumentOutcome::Unchanged;
        }

        let removed = remove_matching(&mut document, &rules.selectors);
        if removed == 0 {
            return DocumentOutcome::Unchanged;
        }

        DocumentOutcome::Filtered {
            html: document.html(),
            removed,
        }
    }
}

/// Detach every element matched by any selector; returns the number of
/// distinct elements matched
fn remove_matching(document: &mut Html, selectors: &[Arc<CategorizedSelector>]) -> usize {
    let mut matched = Vec::new();
    let mut seen = HashSet::new();

    for selector in selectors {
        for element in document.select(selector.selector()) {
            if seen.insert(element.id()) {
                matched.push(element.id());
            }
        }
    }

    for id in &matched {
        if let Some(mut node) = document.tree.get_mut(*id) {
            node.detach();
        }
    }

    matched.len()
}

/// `Content-Encoding` values the filter can see through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Identity,
    Gzip,
    Deflate,
    Unsupported,
}

impl ContentEncoding {
    pub fn from_header(value: Option<&str>) -> Self {
        let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
            return ContentEncoding::Identity;
        };

        // Stacked encodings are left alone
        if value.contains(',') {
            return ContentEncoding::Unsupported;
        }

        match value.to_ascii_lowercase().as_str() {
            "identity" => ContentEncoding::Identity,
            "gzip" | "x-gzip" => ContentEncoding::Gzip,
            "deflate" => ContentEncoding::Deflate,
            _ => ContentEncoding::Unsupported,
        }
    }

    pub fn is_supported(self) -> bool {
        self != ContentEncoding::Unsupported
    }

    /// Decode `body`, refusing output larger than `limit` bytes
    pub fn decode(self, body: &[u8], limit: usize) -> io::Result<Vec<u8>> {
        match self {
            ContentEncoding::Identity => Ok(body.to_vec()),
            ContentEncoding::Gzip => read_limited(GzDecoder::new(body), limit),
            ContentEncoding::Deflate => {
                // "deflate" is zlib-wrapped per RFC 9110, but raw streams are common
                read_limited(ZlibDecoder::new(body), limit)
                    .or_else(|_| read_limited(DeflateDecoder::new(body), limit))
            }
            ContentEncoding::Unsupported => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unsupported content encoding",
            )),
        }
    }
}

fn read_limited(reader: impl Read, limit: usize) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    reader.take(limit as u64 + 1).read_to_end(&mut out)?;
    if out.len() > limit {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "decoded body exceeds limit",
        ));
    }
    Ok(out)
}

/// True when a `Content-Type` charset parameter is absent or UTF-8 compatible
pub fn charset_is_utf8(content_type: &str) -> bool {
    content_type
        .split(';')
        .skip(1)
        .filter_map(|param| {
            let (name, value) = param.split_once('=')?;
            name.trim()
                .eq_ignore_ascii_case("charset")
                .then(|| value.trim().trim_matches('"').to_ascii_lowercase())
        })
        .all(|charset| matches!(charset.as_str(), "utf-8" | "utf8" | "us-ascii"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filtering::category::Category;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn rules_with(selectors: &[&str], triggers: &[&str]) -> RuleMatches {
        RuleMatches {
            selectors: selectors
                .iter()
                .map(|s| {
                    Arc::new(CategorizedSelector::new(vec![], vec![], s, Category(1)).unwrap())
                })
                .collect(),
            url_triggers: vec![],
            content_triggers: triggers
                .iter()
                .map(|t| Arc::new(TextTrigger::content(t, Category(2)).unwrap()))
                .collect(),
        }
    }

    const FILTER: DocumentFilter = DocumentFilter {
        hide_elements: true,
        scan_content: true,
    };

    #[test]
    fn test_removes_matched_elements() {
        let source = "<html><body><div class=\"ad-banner\">buy</div><p>hello</p><div class=\"ad-banner\"><span>x</span></div></body></html>";
        let rules = rules_with(&[".ad-banner"], &[]);

        match FILTER.apply(source, &rules) {
            DocumentOutcome::Filtered { html, removed } => {
                assert_eq!(removed, 2);
                assert!(!html.contains("ad-banner"));
                assert!(html.contains("<p>hello</p>"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_overlapping_selectors_count_once() {
        let source = "<html><body><div id=\"top\" class=\"ad\">x</div></body></html>";
        let rules = rules_with(&[".ad", "#top", "div.ad"], &[]);

        match FILTER.apply(source, &rules) {
            DocumentOutcome::Filtered { removed, .. } => assert_eq!(removed, 1),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_no_match_is_unchanged() {
        let rules = rules_with(&[".ad-banner"], &[]);
        assert!(matches!(
            FILTER.apply("<html><body><p>clean</p></body></html>", &rules),
            DocumentOutcome::Unchanged
        ));
    }

    #[test]
    fn test_element_hiding_disabled() {
        let filter = DocumentFilter {
            hide_elements: false,
            scan_content: false,
        };
        let rules = rules_with(&[".ad-banner"], &[]);
        assert!(matches!(
            filter.apply("<div class=\"ad-banner\"></div>", &rules),
            DocumentOutcome::Unchanged
        ));
    }

    #[test]
    fn test_content_trigger_blocks() {
        let rules = rules_with(&[".ad"], &["online casino"]);
        let outcome = FILTER.apply("<html><body><h1>Online CASINO bonus</h1></body></html>", &rules);
        match outcome {
            DocumentOutcome::Blocked(trigger) => assert_eq!(trigger.category(), Category(2)),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_content_encoding_parsing() {
        assert_eq!(ContentEncoding::from_header(None), ContentEncoding::Identity);
        assert_eq!(ContentEncoding::from_header(Some("GZIP")), ContentEncoding::Gzip);
        assert_eq!(ContentEncoding::from_header(Some("deflate")), ContentEncoding::Deflate);
        assert_eq!(ContentEncoding::from_header(Some("br")), ContentEncoding::Unsupported);
        assert_eq!(
            ContentEncoding::from_header(Some("gzip, br")),
            ContentEncoding::Unsupported
        );
    }

    #[test]
    fn test_gzip_decode_with_limit() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"<p>hello</p>").unwrap();
        let compressed = encoder.finish().unwrap();

        let decoded = ContentEncoding::Gzip.decode(&compressed, 1024).unwrap();
        assert_eq!(decoded, b"<p>hello</p>");
        assert!(ContentEncoding::Gzip.decode(&compressed, 4).is_err());
    }

    #[test]
    fn test_charset_detection() {
        assert!(charset_is_utf8("text/html"));
        assert!(charset_is_utf8("text/html; charset=UTF-8"));
        assert!(charset_is_utf8("text/html; charset=\"utf-8\""));
        assert!(!charset_is_utf8("text/html; charset=iso-8859-1"));
    }
}
