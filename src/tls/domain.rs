//! Certificate domain pattern matching
//!
//! Follows RFC 6125 section 6.4.3: the wildcard may only appear once, only
//! in the left-most label, and covers exactly one label. A pattern needs at
//! least two labels after the wildcard label, so `*.com` matches nothing.

use crate::net::resolver::parse_ip_literal;

/// Check whether `pattern` (from a certificate's CN or DNS SAN) matches `host`
pub fn matches(pattern: &str, host: &str) -> bool {
    let pattern = normalize(pattern);
    let host = normalize(host);

    if pattern.is_empty() || host.is_empty() {
        return false;
    }

    if !pattern.contains('*') {
        return pattern == host;
    }

    if parse_ip_literal(&host).is_some() {
        return false;
    }

    let pattern_labels: Vec<&str> = pattern.split('.').collect();
    let host_labels: Vec<&str> = host.split('.').collect();

    if pattern_labels.len() != host_labels.len() || pattern_labels.len() < 3 {
        return false;
    }

    let (first_pattern, rest_pattern) = match pattern_labels.split_first() {
        Some(split) => split,
        None => return false,
    };
    let (first_host, rest_host) = match host_labels.split_first() {
        Some(split) => split,
        None => return false,
    };

    if rest_pattern.iter().any(|label| label.contains('*')) || rest_pattern != rest_host {
        return false;
    }

    match_label(first_pattern, first_host)
}

fn match_label(pattern: &str, label: &str) -> bool {
    if pattern == "*" {
        return !label.is_empty();
    }

    // Partial wildcards are ambiguous for IDN A-labels
    if pattern.starts_with("xn--") || label.starts_with("xn--") {
        return false;
    }

    let mut parts = pattern.splitn(2, '*');
    let prefix = parts.next().unwrap_or("");
    let suffix = match parts.next() {
        Some(suffix) if !suffix.contains('*') => suffix,
        _ => return false,
    };

    label.len() > prefix.len() + suffix.len() && label.starts_with(prefix) && label.ends_with(suffix)
}

fn normalize(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match_is_case_insensitive() {
        assert!(matches("example.com", "example.com"));
        assert!(matches("Example.COM", "example.com"));
        assert!(matches("example.com.", "EXAMPLE.com"));
        assert!(!matches("example.com", "www.example.com"));
    }

    #[test]
    fn test_wildcard_single_label() {
        assert!(matches("*.example.com", "foo.example.com"));
        assert!(matches("*.Example.com", "FOO.example.com"));
        assert!(!matches("*.example.com", "example.com"));
        assert!(!matches("*.example.com", "a.b.example.com"));
    }

    #[test]
    fn test_wildcard_restrictions() {
        assert!(!matches("*.com", "example.com"));
        assert!(!matches("foo.*.com", "foo.example.com"));
        assert!(!matches("*.*.example.com", "a.b.example.com"));
        assert!(!matches("*.0.0.1", "127.0.0.1"));
    }

    #[test]
    fn test_partial_wildcard() {
        assert!(matches("w*.example.com", "www.example.com"));
        assert!(matches("*w.example.com", "aw.example.com"));
        assert!(!matches("w*.example.com", "w.example.com"));
        assert!(!matches("w*.example.com", "mail.example.com"));
        assert!(!matches("xn--*.example.com", "xn--bcher-kva.example.com"));
    }

    #[test]
    fn test_empty_inputs() {
        assert!(!matches("", "example.com"));
        assert!(!matches("*.example.com", ""));
    }
}
