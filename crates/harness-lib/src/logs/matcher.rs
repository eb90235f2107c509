//! Line matchers for the log tailer

use crate::error::Result;
use regex::Regex;

/// Pure predicate over a single log line
///
/// The default matcher never matches, so a tailer built without one always
/// times out.
#[derive(Debug, Clone, Default)]
pub enum LineMatcher {
    Contains(String),
    Regex(Regex),
    #[default]
    Never,
}

impl LineMatcher {
    pub fn contains(needle: impl Into<String>) -> Self {
        LineMatcher::Contains(needle.into())
    }

    pub fn regex(pattern: &str) -> Result<Self> {
        Ok(LineMatcher::Regex(Regex::new(pattern)?))
    }

    pub fn matches(&self, line: &str) -> bool {
        match self {
            LineMatcher::Contains(needle) => line.contains(needle.as_str()),
            LineMatcher::Regex(re) => re.is_match(line),
            LineMatcher::Never => false,
        }
    }
}

impl std::fmt::Display for LineMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LineMatcher::Contains(needle) => write!(f, "contains {:?}", needle),
            LineMatcher::Regex(re) => write!(f, "matches /{}/", re.as_str()),
            LineMatcher::Never => write!(f, "never"),
        }
    }
}
