//! URL patterns for classifying outgoing requests.

use serde::{Deserialize, Serialize};
use url::Url;

/// Type of URL pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    /// Exact URL match.
    Exact,
    /// Prefix match on the full URL.
    Prefix,
    /// Contains substring.
    Contains,
    /// URL scheme match (e.g. `chrome-extension`).
    Scheme,
    /// Host match, including subdomains.
    Host,
}

/// URL pattern for matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlPattern {
    /// Pattern type.
    #[serde(rename = "type")]
    pub pattern_type: PatternType,
    /// Pattern string.
    pub pattern: String,
}

impl UrlPattern {
    /// Create an exact match pattern.
    pub fn exact(url: &str) -> Self {
        Self::new(PatternType::Exact, url)
    }

    /// Create a prefix match pattern.
    pub fn prefix(prefix: &str) -> Self {
        Self::new(PatternType::Prefix, prefix)
    }

    /// Create a contains pattern.
    pub fn contains(substring: &str) -> Self {
        Self::new(PatternType::Contains, substring)
    }

    /// Create a scheme pattern.
    pub fn scheme(scheme: &str) -> Self {
        Self::new(PatternType::Scheme, scheme)
    }

    /// Create a host pattern. `example.com` also matches `cdn.example.com`.
    pub fn host(host: &str) -> Self {
        Self::new(PatternType::Host, host)
    }

    fn new(pattern_type: PatternType, pattern: &str) -> Self {
        Self {
            pattern_type,
            pattern: pattern.to_string(),
        }
    }

    /// Check if a URL matches this pattern.
    pub fn matches(&self, url: &Url) -> bool {
        let url_str = url.as_str();
        match self.pattern_type {
            PatternType::Exact => url_str == self.pattern,
            PatternType::Prefix => url_str.starts_with(&self.pattern),
            PatternType::Contains => url_str.contains(&self.pattern),
            PatternType::Scheme => url.scheme().eq_ignore_ascii_case(&self.pattern),
            PatternType::Host => match url.host_str() {
                Some(host) => {
                    host.eq_ignore_ascii_case(&self.pattern)
                        || host
                            .to_ascii_lowercase()
                            .ends_with(&format!(".{}", self.pattern.to_ascii_lowercase()))
                }
                None => false,
            },
        }
    }

    /// Whether any pattern in `patterns` matches.
    pub fn any_matches(patterns: &[UrlPattern], url: &Url) -> bool {
        patterns.iter().any(|p| p.matches(url))
    }
}
