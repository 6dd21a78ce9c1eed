//! Line predicates for search.

use crate::error::{LogdexError, Result};
use grep_matcher::Matcher;
use grep_regex::RegexMatcher;
use memchr::memmem::Finder;

/// Decides whether a raw line is a hit
#[derive(Debug, Clone)]
pub enum LineMatcher {
    /// Plain byte substring containment
    Substring(Finder<'static>),
    /// Regular expression search anywhere in the line
    Regex(RegexMatcher),
}

impl LineMatcher {
    pub fn substring(needle: &str) -> Self {
        LineMatcher::Substring(Finder::new(needle.as_bytes()).into_owned())
    }

    pub fn regex(pattern: &str) -> Result<Self> {
        RegexMatcher::new(pattern)
            .map(LineMatcher::Regex)
            .map_err(|e| LogdexError::pattern(format!("'{pattern}': {e}")))
    }

    pub fn is_match(&self, line: &[u8]) -> bool {
        match self {
            LineMatcher::Substring(finder) => finder.find(line).is_some(),
            LineMatcher::Regex(regex) => regex.is_match(line).unwrap_or(false),
        }
    }
}
