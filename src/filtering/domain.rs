//! Host normalization and dot-boundary suffix matching

/// Normalize a host or URL-ish string into an index key
///
/// Strips scheme, userinfo, path, port and trailing dot; lower-cases.
/// Bracketed IPv6 literals lose their brackets.
pub fn normalize_host(input: &str) -> String {
    let mut host = input.trim();

    if let Some(idx) = host.find("://") {
        host = &host[idx + 3..];
    }
    if let Some(idx) = host.find(|c| c == '/' || c == '?' || c == '#') {
        host = &host[..idx];
    }
    if let Some(idx) = host.rfind('@') {
        host = &host[idx + 1..];
    }

    if let Some(rest) = host.strip_prefix('[') {
        host = match rest.find(']') {
            Some(end) => &rest[..end],
            None => rest,
        };
    } else if host.matches(':').count() == 1 {
        if let Some(idx) = host.find(':') {
            host = &host[..idx];
        }
    }

    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Iterate `host` and each parent domain on dot boundaries
///
/// `a.b.example.com` yields `a.b.example.com`, `b.example.com`,
/// `example.com`, `com`.
pub fn suffixes(host: &str) -> impl Iterator<Item = &str> {
    let mut next = if host.is_empty() { None } else { Some(host) };
    std::iter::from_fn(move || {
        let current = next?;
        next = current.find('.').map(|idx| &current[idx + 1..]).filter(|s| !s.is_empty());
        Some(current)
    })
}

/// True when `host` equals `domain` or is a subdomain of it
pub fn host_matches_domain(host: &str, domain: &str) -> bool {
    if host.len() == domain.len() {
        return host == domain;
    }
    host.len() > domain.len()
        && host.ends_with(domain)
        && host.as_bytes()[host.len() - domain.len() - 1] == b'.'
}

/// Validate and normalize a domain written in a rule
pub fn normalize_rule_domain(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_matches('.');
    if trimmed.is_empty() {
        return None;
    }

    if !trimmed
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-' || b == b'_')
    {
        return None;
    }

    Some(trimmed.to_ascii_lowercase())
}

/// Last two labels of a host, used as an approximation of the site
pub fn base_domain(host: &str) -> &str {
    let mut dots = host.rmatch_indices('.');
    dots.next();
    match dots.next() {
        Some((idx, _)) => &host[idx + 1..],
        None => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("Example.COM"), "example.com");
        assert_eq!(normalize_host("example.com:8443"), "example.com");
        assert_eq!(normalize_host("https://user@Sub.Example.com:443/path?q"), "sub.example.com");
        assert_eq!(normalize_host("example.com."), "example.com");
        assert_eq!(normalize_host("[::1]:8080"), "::1");
        assert_eq!(normalize_host("::1"), "::1");
    }

    #[test]
    fn test_suffixes() {
        let all: Vec<&str> = suffixes("a.b.example.com").collect();
        assert_eq!(all, vec!["a.b.example.com", "b.example.com", "example.com", "com"]);
        assert_eq!(suffixes("").count(), 0);
        assert_eq!(suffixes("localhost").collect::<Vec<_>>(), vec!["localhost"]);
    }

    #[test]
    fn test_host_matches_domain_on_dot_boundary() {
        assert!(host_matches_domain("example.com", "example.com"));
        assert!(host_matches_domain("sub.example.com", "example.com"));
        assert!(!host_matches_domain("notexample.com", "example.com"));
        assert!(!host_matches_domain("example.com", "sub.example.com"));
    }

    #[test]
    fn test_normalize_rule_domain() {
        assert_eq!(normalize_rule_domain("Ads.Example.com"), Some("ads.example.com".to_string()));
        assert_eq!(normalize_rule_domain(".example.com."), Some("example.com".to_string()));
        assert_eq!(normalize_rule_domain("exa mple.com"), None);
        assert_eq!(normalize_rule_domain(""), None);
        assert_eq!(normalize_rule_domain("example.*"), None);
    }

    #[test]
    fn test_base_domain() {
        assert_eq!(base_domain("a.b.example.com"), "example.com");
        assert_eq!(base_domain("example.com"), "example.com");
        assert_eq!(base_domain("localhost"), "localhost");
    }
}
