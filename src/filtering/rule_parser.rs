//! Filter-list and trigger-list parsing
//!
//! Every line is independent. A line that cannot be honoured is counted as
//! failed and skipped; comments and blank lines are not counted at all.

use super::category::Category;
use super::domain::normalize_rule_domain;
use super::error::{Result, RuleError};
use super::selector::{CategorizedSelector, SelectorException};
use super::trigger::{compile_url_pattern, DomainConstraint, Party, TextTrigger, TriggerPattern};
use std::net::IpAddr;
use tracing::debug;

/// One rule produced by the filter-list parser
#[derive(Debug)]
pub enum ParsedRule {
    /// `domains##selector`
    Selector(CategorizedSelector),
    /// `domains#@#selector`
    SelectorException(SelectorException),
    /// Network rule or hosts-file entry
    UrlTrigger(TextTrigger),
}

/// Parse result with the number of rejected lines
#[derive(Debug)]
pub struct ParsedList<T> {
    pub rules: Vec<T>,
    pub failed: usize,
}

impl<T> ParsedList<T> {
    fn new() -> Self {
        Self {
            rules: Vec::new(),
            failed: 0,
        }
    }

    pub fn loaded(&self) -> usize {
        self.rules.len()
    }
}

enum Line<'a> {
    Skip,
    Cosmetic {
        domains: &'a str,
        selector: &'a str,
        exception: bool,
    },
    Host(&'a str),
    Network(&'a str),
}

/// Parse an adblock-style filter list
pub fn parse_filter_list(text: &str, category: Category) -> ParsedList<ParsedRule> {
    let mut parsed = ParsedList::new();

    for raw_line in text.lines() {
        let line = raw_line.trim();

        let result = match classify_line(line) {
            Ok(Line::Skip) => continue,
            Ok(Line::Cosmetic {
                domains,
                selector,
                exception,
            }) => parse_cosmetic(domains, selector, exception, category),
            Ok(Line::Host(host)) => parse_host(host, category).map(ParsedRule::UrlTrigger),
            Ok(Line::Network(rule)) => parse_network(rule, category).map(ParsedRule::UrlTrigger),
            Err(e) => Err(e),
        };

        match result {
            Ok(rule) => parsed.rules.push(rule),
            Err(e) => {
                debug!(rule = %line, error = %e, category = category.id(), "Skipping rule");
                parsed.failed += 1;
            }
        }
    }

    parsed
}

/// Parse a trigger list: one phrase per line
pub fn parse_trigger_list(text: &str, category: Category) -> ParsedList<TextTrigger> {
    let mut parsed = ParsedList::new();

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('!') || line.starts_with('#') {
            continue;
        }

        match TextTrigger::content(line, category) {
            Ok(trigger) => parsed.rules.push(trigger),
            Err(e) => {
                debug!(trigger = %line, error = %e, "Skipping trigger");
                parsed.failed += 1;
            }
        }
    }

    parsed
}

fn classify_line(line: &str) -> Result<Line<'_>> {
    if line.is_empty() || line.starts_with('!') || line.starts_with('[') {
        return Ok(Line::Skip);
    }

    for (idx, _) in line.match_indices('#') {
        let rest = &line[idx..];
        let domains = &line[..idx];

        if let Some(selector) = rest.strip_prefix("#@#") {
            return Ok(Line::Cosmetic {
                domains,
                selector,
                exception: true,
            });
        }

        if let Some(selector) = rest.strip_prefix("##") {
            if selector.starts_with("+js(") || selector.starts_with('^') {
                return Err(RuleError::UnsupportedSyntax(line.to_string()));
            }
            return Ok(Line::Cosmetic {
                domains,
                selector,
                exception: false,
            });
        }

        const UNSUPPORTED: [&str; 6] = ["#?#", "#$#", "#%#", "#@?#", "#@$#", "#@%#"];
        if UNSUPPORTED.iter().any(|marker| rest.starts_with(marker)) {
            return Err(RuleError::UnsupportedSyntax(line.to_string()));
        }
    }

    // Hosts-file comments start with '#'; cosmetic markers were handled above
    if line.starts_with('#') {
        return Ok(Line::Skip);
    }

    if let Some(host) = hosts_file_entry(line) {
        return match host {
            Some(host) => Ok(Line::Host(host)),
            None => Ok(Line::Skip),
        };
    }

    Ok(Line::Network(line))
}

/// `Some(Some(host))` for a hosts-file entry, `Some(None)` for a loopback
/// alias that should be ignored, `None` when the line is not a hosts entry
fn hosts_file_entry(line: &str) -> Option<Option<&str>> {
    let mut parts = line.split_whitespace();
    let address = parts.next()?;
    let host = parts.next()?;

    address.parse::<IpAddr>().ok()?;

    const IGNORED: [&str; 6] = [
        "localhost",
        "localhost.localdomain",
        "local",
        "broadcasthost",
        "ip6-localhost",
        "0.0.0.0",
    ];
    if IGNORED.contains(&host) {
        return Some(None);
    }

    Some(Some(host))
}

fn parse_cosmetic(
    domains: &str,
    selector: &str,
    exception: bool,
    category: Category,
) -> Result<ParsedRule> {
    let mut include = Vec::new();
    let mut exclude = Vec::new();

    for raw in domains.split(',').map(str::trim).filter(|d| !d.is_empty()) {
        let (negated, raw) = match raw.strip_prefix('~') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        let domain =
            normalize_rule_domain(raw).ok_or_else(|| RuleError::InvalidDomain(raw.to_string()))?;
        if negated {
            exclude.push(domain);
        } else {
            include.push(domain);
        }
    }

    if exception {
        let selector_text = selector.trim();
        if selector_text.is_empty() {
            return Err(RuleError::invalid_selector(selector_text, "empty selector"));
        }
        return Ok(ParsedRule::SelectorException(SelectorException {
            domains: include,
            selector_text: selector_text.to_string(),
            category,
        }));
    }

    CategorizedSelector::new(include, exclude, selector, category).map(ParsedRule::Selector)
}

#[derive(Default)]
struct NetworkOptions {
    page_domains: DomainConstraint,
    party: Option<Party>,
    match_case: bool,
}

fn parse_host(host: &str, category: Category) -> Result<TextTrigger> {
    let domain = normalize_rule_domain(host)
        .ok_or_else(|| RuleError::InvalidDomain(host.to_string()))?;

    Ok(TextTrigger::network(
        host,
        TriggerPattern::AnyUrl,
        category,
        vec![domain],
        DomainConstraint::default(),
        None,
        false,
    ))
}

fn parse_network(line: &str, category: Category) -> Result<TextTrigger> {
    let (exception, body) = match line.strip_prefix("@@") {
        Some(rest) => (true, rest),
        None => (false, line),
    };

    let (pattern, options) = split_options(body);
    let options = match options {
        Some(text) => parse_options(text)?,
        None => NetworkOptions::default(),
    };

    let pattern = pattern.trim();
    if pattern.is_empty() {
        return Err(RuleError::InvalidPattern(line.to_string()));
    }

    let (compiled, domains) = match host_anchor(pattern) {
        Some((host, true)) => (TriggerPattern::AnyUrl, vec![host]),
        Some((host, false)) => (compile_url_pattern(pattern, options.match_case)?, vec![host]),
        None => (compile_url_pattern(pattern, options.match_case)?, Vec::new()),
    };

    Ok(TextTrigger::network(
        line,
        compiled,
        category,
        domains,
        options.page_domains,
        options.party,
        exception,
    ))
}

/// Extract the host of a `||host` rule
///
/// Returns the host and whether the rule is nothing more than the host
/// (`||host^`), in which case every URL on that host matches.
fn host_anchor(pattern: &str) -> Option<(String, bool)> {
    let rest = pattern.strip_prefix("||")?;
    let rest = rest.strip_prefix('.').unwrap_or(rest);

    let end = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_'))
        .unwrap_or(rest.len());
    let host = &rest[..end];
    let tail = &rest[end..];

    // Without a terminator the host text is a prefix, not a full name
    if !matches!(tail.chars().next(), Some('^' | '/' | ':' | '|')) {
        return None;
    }

    let host = normalize_rule_domain(host)?;
    if !host.contains('.') && host != "localhost" {
        return None;
    }

    let whole_host = tail == "^" || tail == "^|";
    Some((host, whole_host))
}

fn split_options(body: &str) -> (&str, Option<&str>) {
    if body.len() > 2 && body.starts_with('/') && body.ends_with('/') {
        return (body, None);
    }
    match body.rfind('$') {
        Some(pos) if !body[pos + 1..].contains('/') => (&body[..pos], Some(&body[pos + 1..])),
        _ => (body, None),
    }
}

fn parse_options(text: &str) -> Result<NetworkOptions> {
    let mut options = NetworkOptions::default();

    for option in text.split(',').map(str::trim).filter(|o| !o.is_empty()) {
        match option {
            "third-party" | "3p" => options.party = Some(Party::Third),
            "~third-party" | "~3p" | "first-party" | "1p" => options.party = Some(Party::First),
            "match-case" => options.match_case = true,
            _ => {
                let Some(list) = option.strip_prefix("domain=") else {
                    return Err(RuleError::UnsupportedOption(option.to_string()));
                };
                for raw in list.split('|').map(str::trim).filter(|d| !d.is_empty()) {
                    let (negated, raw) = match raw.strip_prefix('~') {
                        Some(rest) => (true, rest),
                        None => (false, raw),
                    };
                    let domain = normalize_rule_domain(raw)
                        .ok_or_else(|| RuleError::InvalidDomain(raw.to_string()))?;
                    if negated {
                        options.page_domains.exclude.push(domain);
                    } else {
                        options.page_domains.include.push(domain);
                    }
                }
            }
        }
    }

    Ok(options)
}
