//! Text triggers: network rules matched against request URLs and content
//! phrases matched against document text

use super::category::Category;
use super::domain::{base_domain, host_matches_domain};
use super::error::{Result, RuleError};
use regex::{Regex, RegexBuilder};
use std::fmt;

/// What a trigger is matched against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerTarget {
    /// The absolute request URL, before forwarding
    Url,
    /// The text of an HTML document, after the response arrives
    Content,
}

/// Compiled match pattern
#[derive(Debug, Clone)]
pub enum TriggerPattern {
    /// Matches every request to the indexed host (`||host^`, hosts-file lines)
    AnyUrl,
    /// Case-folded substring
    Substring(String),
    /// Compiled wildcard/anchor pattern or literal `/regex/`
    Regex(Regex),
}

/// First- or third-party restriction from `$third-party` / `$~third-party`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Party {
    First,
    Third,
}

/// Page-domain restriction from `$domain=a.com|~b.com`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainConstraint {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl DomainConstraint {
    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    pub fn allows(&self, page_host: &str) -> bool {
        if self
            .exclude
            .iter()
            .any(|d| host_matches_domain(page_host, d))
        {
            return false;
        }
        self.include.is_empty()
            || self
                .include
                .iter()
                .any(|d| host_matches_domain(page_host, d))
    }
}

/// Request facts a URL trigger is evaluated against
#[derive(Debug, Clone, Copy)]
pub struct RequestInfo<'a> {
    /// Absolute URL, e.g. `https://ads.example.com/banner.js`
    pub url: &'a str,
    /// Normalized request host
    pub host: &'a str,
    /// Host of the page that caused the request (Referer), if known
    pub page_host: Option<&'a str>,
}

/// One trigger rule
#[derive(Clone)]
pub struct TextTrigger {
    rule_text: String,
    pattern: TriggerPattern,
    target: TriggerTarget,
    category: Category,
    domains: Vec<String>,
    page_domains: DomainConstraint,
    party: Option<Party>,
    exception: bool,
}

impl TextTrigger {
    /// Network rule matched against URLs
    ///
    /// `domains` are the hosts the rule is indexed under (empty for rules
    /// that must be checked on every request).
    #[allow(clippy::too_many_arguments)]
    pub fn network(
        rule_text: &str,
        pattern: TriggerPattern,
        category: Category,
        domains: Vec<String>,
        page_domains: DomainConstraint,
        party: Option<Party>,
        exception: bool,
    ) -> Self {
        Self {
            rule_text: rule_text.to_string(),
            pattern,
            target: TriggerTarget::Url,
            category,
            domains,
            page_domains,
            party,
            exception,
        }
    }

    /// Content phrase, matched case-insensitively against document text
    pub fn content(phrase: &str, category: Category) -> Result<Self> {
        let phrase = phrase.trim().to_lowercase();
        if phrase.is_empty() {
            return Err(RuleError::InvalidPattern(phrase));
        }

        Ok(Self {
            rule_text: phrase.clone(),
            pattern: TriggerPattern::Substring(phrase),
            target: TriggerTarget::Content,
            category,
            domains: Vec::new(),
            page_domains: DomainConstraint::default(),
            party: None,
            exception: false,
        })
    }

    pub fn rule_text(&self) -> &str {
        &self.rule_text
    }

    pub fn target(&self) -> TriggerTarget {
        self.target
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    pub fn pattern(&self) -> &TriggerPattern {
        &self.pattern
    }

    /// `@@` rules allow a request that another rule would block
    pub fn is_exception(&self) -> bool {
        self.exception
    }

    /// Evaluate a URL trigger against a request
    pub fn matches_request(&self, request: &RequestInfo<'_>) -> bool {
        if self.target != TriggerTarget::Url {
            return false;
        }

        let page_host = request.page_host.unwrap_or(request.host);

        if !self.page_domains.is_empty() && !self.page_domains.allows(page_host) {
            return false;
        }

        if let Some(party) = self.party {
            let third = base_domain(page_host) != base_domain(request.host);
            match party {
                Party::Third if !third => return false,
                Party::First if third => return false,
                _ => {}
            }
        }

        if !self.domains.is_empty()
            && !self
                .domains
                .iter()
                .any(|d| host_matches_domain(request.host, d))
        {
            return false;
        }

        match &self.pattern {
            TriggerPattern::AnyUrl => true,
            TriggerPattern::Substring(needle) => request.url.to_lowercase().contains(needle),
            TriggerPattern::Regex(re) => re.is_match(request.url),
        }
    }

    /// Evaluate a content trigger against lower-cased document text
    pub fn matches_text(&self, lowercase_text: &str) -> bool {
        if self.target != TriggerTarget::Content {
            return false;
        }
        match &self.pattern {
            TriggerPattern::Substring(needle) => lowercase_text.contains(needle.as_str()),
            TriggerPattern::Regex(re) => re.is_match(lowercase_text),
            TriggerPattern::AnyUrl => false,
        }
    }
}

impl fmt::Debug for TextTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TextTrigger")
            .field("rule", &self.rule_text)
            .field("target", &self.target)
            .field("category", &self.category)
            .field("domains", &self.domains)
            .field("exception", &self.exception)
            .finish()
    }
}

/// Compile an adblock-style URL pattern
///
/// Supports `||` host anchors, `|` start/end anchors, `*` wildcards, `^`
/// separators and literal `/regex/` patterns.
pub fn compile_url_pattern(pattern: &str, match_case: bool) -> Result<TriggerPattern> {
    let pattern = pattern.trim();
    if pattern.is_empty() || pattern == "*" {
        return Err(RuleError::InvalidPattern(pattern.to_string()));
    }

    if pattern.len() > 2 && pattern.starts_with('/') && pattern.ends_with('/') {
        let body = &pattern[1..pattern.len() - 1];
        return RegexBuilder::new(body)
            .case_insensitive(!match_case)
            .build()
            .map(TriggerPattern::Regex)
            .map_err(|_| RuleError::InvalidPattern(pattern.to_string()));
    }

    let plain = !pattern.contains(|c| matches!(c, '*' | '^' | '|'));
    if plain && !match_case {
        return Ok(TriggerPattern::Substring(pattern.to_lowercase()));
    }

    let mut rest = pattern;
    let mut source = String::with_capacity(pattern.len() * 2);

    if let Some(stripped) = rest.strip_prefix("||") {
        source.push_str(r"^[a-zA-Z][a-zA-Z0-9+.\-]*://(?:[^/?#]*\.)?");
        rest = stripped;
    } else if let Some(stripped) = rest.strip_prefix('|') {
        source.push('^');
        rest = stripped;
    }

    let end_anchor = rest.ends_with('|');
    if end_anchor {
        rest = &rest[..rest.len() - 1];
    }

    for ch in rest.chars() {
        match ch {
            '*' => source.push_str(".*"),
            '^' => source.push_str(r"(?:[^a-zA-Z0-9_\-.%]|$)"),
            '|' => source.push_str(r"\|"),
            c => source.push_str(&regex::escape(&c.to_string())),
        }
    }

    if end_anchor {
        source.push('$');
    }

    RegexBuilder::new(&source)
        .case_insensitive(!match_case)
        .build()
        .map(TriggerPattern::Regex)
        .map_err(|_| RuleError::InvalidPattern(pattern.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request<'a>(url: &'a str, host: &'a str) -> RequestInfo<'a> {
        RequestInfo {
            url,
            host,
            page_host: None,
        }
    }

    fn url_trigger(pattern: &str) -> TextTrigger {
        TextTrigger::network(
            pattern,
            compile_url_pattern(pattern, false).unwrap(),
            Category(1),
            vec![],
            DomainConstraint::default(),
            None,
            false,
        )
    }

    #[test]
    fn test_substring_pattern_case_insensitive() {
        let trigger = url_trigger("/banner/");
        assert!(trigger.matches_request(&request("http://x.com/BANNER/1.gif", "x.com")));
        assert!(!trigger.matches_request(&request("http://x.com/content/1.gif", "x.com")));
    }

    #[test]
    fn test_host_anchor_pattern() {
        let trigger = url_trigger("||ads.example.com/track");
        assert!(trigger.matches_request(&request(
            "https://ads.example.com/track?id=1",
            "ads.example.com"
        )));
        assert!(trigger.matches_request(&request(
            "https://eu.ads.example.com/track",
            "eu.ads.example.com"
        )));
        assert!(!trigger.matches_request(&request(
            "https://notads.example.com/track",
            "notads.example.com"
        )));
    }

    #[test]
    fn test_separator_and_wildcard() {
        let trigger = url_trigger("/ad*.js^");
        assert!(trigger.matches_request(&request("http://x.com/adserver.js?v=2", "x.com")));
        assert!(trigger.matches_request(&request("http://x.com/ads.js", "x.com")));
        assert!(!trigger.matches_request(&request("http://x.com/ads.json", "x.com")));
    }

    #[test]
    fn test_start_and_end_anchor() {
        let trigger = url_trigger("|http://tracker.");
        assert!(trigger.matches_request(&request("http://tracker.net/p", "tracker.net")));
        assert!(!trigger.matches_request(&request("https://tracker.net/p", "tracker.net")));

        let trigger = url_trigger(".swf|");
        assert!(trigger.matches_request(&request("http://x.com/movie.swf", "x.com")));
        assert!(!trigger.matches_request(&request("http://x.com/movie.swf?x", "x.com")));
    }

    #[test]
    fn test_literal_regex() {
        let pattern = compile_url_pattern(r"/\/ad[0-9]+\//", false).unwrap();
        assert!(matches!(pattern, TriggerPattern::Regex(_)));

        assert!(compile_url_pattern("/[unclosed/", false).is_err());
        assert!(compile_url_pattern("", false).is_err());
    }

    #[test]
    fn test_page_domain_constraint() {
        let trigger = TextTrigger::network(
            "/widget.js$domain=news.com|~sports.news.com",
            compile_url_pattern("/widget.js", false).unwrap(),
            Category(1),
            vec![],
            DomainConstraint {
                include: vec!["news.com".to_string()],
                exclude: vec!["sports.news.com".to_string()],
            },
            None,
            false,
        );

        let mut info = request("http://cdn.net/widget.js", "cdn.net");
        info.page_host = Some("www.news.com");
        assert!(trigger.matches_request(&info));

        info.page_host = Some("sports.news.com");
        assert!(!trigger.matches_request(&info));

        info.page_host = Some("other.com");
        assert!(!trigger.matches_request(&info));
    }

    #[test]
    fn test_third_party_option() {
        let trigger = TextTrigger::network(
            "||cdn.net^$third-party",
            TriggerPattern::AnyUrl,
            Category(1),
            vec!["cdn.net".to_string()],
            DomainConstraint::default(),
            Some(Party::Third),
            false,
        );

        let mut info = request("http://img.cdn.net/a.png", "img.cdn.net");
        info.page_host = Some("www.cdn.net");
        assert!(!trigger.matches_request(&info));

        info.page_host = Some("blog.example.org");
        assert!(trigger.matches_request(&info));
    }

    #[test]
    fn test_content_trigger() {
        let trigger = TextTrigger::content("  Online Casino ", Category(4)).unwrap();
        assert_eq!(trigger.rule_text(), "online casino");
        assert!(trigger.matches_text("welcome to the best online casino in town"));
        assert!(!trigger.matches_text("welcome to the library"));
        assert!(!trigger.matches_request(&request("http://online casino", "x")));

        assert!(TextTrigger::content("   ", Category(4)).is_err());
    }
}
