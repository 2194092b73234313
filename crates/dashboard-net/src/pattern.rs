//! URL path patterns used to classify intercepted requests.

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::NetError;

/// Type of URL pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    /// Exact path match.
    Exact,
    /// Path prefix match.
    Prefix,
    /// Path suffix match (e.g., file extension).
    Suffix,
    /// Contains substring.
    Contains,
    /// Regular expression over the path.
    Regex,
}

/// Serialized form of a pattern: `{"kind": "prefix", "pattern": "/api/"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternSpec {
    pub kind: PatternType,
    pub pattern: String,
}

/// A pattern matched against the path component of a URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "PatternSpec", into = "PatternSpec")]
pub struct UrlPattern {
    /// Pattern type.
    pub pattern_type: PatternType,
    /// Pattern string.
    pub pattern: String,
    compiled: Option<Regex>,
}

impl UrlPattern {
    /// Create an exact match pattern.
    pub fn exact(path: &str) -> Self {
        Self::plain(PatternType::Exact, path)
    }

    /// Create a prefix match pattern.
    pub fn prefix(prefix: &str) -> Self {
        Self::plain(PatternType::Prefix, prefix)
    }

    /// Create a suffix match pattern.
    pub fn suffix(suffix: &str) -> Self {
        Self::plain(PatternType::Suffix, suffix)
    }

    /// Create a contains pattern.
    pub fn contains(substring: &str) -> Self {
        Self::plain(PatternType::Contains, substring)
    }

    /// Create a regex pattern.
    pub fn regex(expression: &str) -> Result<Self, NetError> {
        let compiled = Regex::new(expression)
            .map_err(|e| NetError::RequestFailed(format!("invalid pattern {expression:?}: {e}")))?;
        Ok(Self {
            pattern_type: PatternType::Regex,
            pattern: expression.to_string(),
            compiled: Some(compiled),
        })
    }

    fn plain(pattern_type: PatternType, pattern: &str) -> Self {
        Self {
            pattern_type,
            pattern: pattern.to_string(),
            compiled: None,
        }
    }

    /// Check if a URL's path matches this pattern.
    pub fn matches(&self, url: &Url) -> bool {
        self.matches_path(url.path())
    }

    /// Check if a path matches this pattern.
    pub fn matches_path(&self, path: &str) -> bool {
        match self.pattern_type {
            PatternType::Exact => path == self.pattern,
            PatternType::Prefix => path.starts_with(&self.pattern),
            PatternType::Suffix => path.ends_with(&self.pattern),
            PatternType::Contains => path.contains(&self.pattern),
            PatternType::Regex => self
                .compiled
                .as_ref()
                .is_some_and(|re| re.is_match(path)),
        }
    }
}

impl PartialEq for UrlPattern {
    fn eq(&self, other: &Self) -> bool {
        self.pattern_type == other.pattern_type && self.pattern == other.pattern
    }
}

impl TryFrom<PatternSpec> for UrlPattern {
    type Error = NetError;

    fn try_from(spec: PatternSpec) -> Result<Self, Self::Error> {
        match spec.kind {
            PatternType::Regex => Self::regex(&spec.pattern),
            kind => Ok(Self::plain(kind, &spec.pattern)),
        }
    }
}

impl From<UrlPattern> for PatternSpec {
    fn from(pattern: UrlPattern) -> Self {
        Self {
            kind: pattern.pattern_type,
            pattern: pattern.pattern,
        }
    }
}
