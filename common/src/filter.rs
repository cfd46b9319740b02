//! Ordered include/exclude filtering of entries
//!
//! Filters are evaluated in the order they were given on the command line and the **last**
//! filter whose pattern matches decides the outcome. A path no filter matches is included.
//! Reordering filters therefore changes results:
//!
//! ```
//! use common::filter::FilterChain;
//!
//! let mut chain = FilterChain::new();
//! chain.add_exclude("*").unwrap();
//! chain.add_include("*.txt").unwrap();
//! assert!(chain.includes("a.txt"));
//! assert!(!chain.includes("a.log"));
//! ```
//!
//! # Pattern Syntax
//!
//! Patterns are globs matched against the entry's `compare_key` (relative, `/` separated):
//!
//! - `*` matches anything; it also crosses `/` unless the chain was built with
//!   [`FilterChain::with_literal_separator`], in which case it stays within one segment
//! - `**` matches anything including `/`
//! - `?` matches a single character
//! - `[...]` character classes
//! - Leading `/` anchors the pattern to the operation root

use anyhow::{Context, anyhow};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FilterVerb {
    Include,
    Exclude,
}

impl std::fmt::Display for FilterVerb {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            FilterVerb::Include => write!(f, "--include"),
            FilterVerb::Exclude => write!(f, "--exclude"),
        }
    }
}

/// A compiled filter pattern with metadata about its original form
#[derive(Debug, Clone)]
pub struct FilterPattern {
    /// original pattern string
    pub original: String,
    /// compiled glob matcher
    matcher: globset::GlobMatcher,
    /// pattern starts with / (anchored to root)
    pub anchored: bool,
    /// `*` stops at `/`
    literal_separator: bool,
}

impl FilterPattern {
    /// Parse a pattern string into a FilterPattern
    pub fn parse(pattern: &str, literal_separator: bool) -> Result<Self, anyhow::Error> {
        if pattern.is_empty() {
            return Err(anyhow!("empty pattern is not allowed"));
        }
        let anchored = pattern.starts_with('/');
        let pattern_str = pattern.trim_start_matches('/');
        if pattern_str.is_empty() {
            return Err(anyhow!(
                "pattern '{}' results in empty glob after stripping / markers",
                pattern
            ));
        }
        let glob = globset::GlobBuilder::new(pattern_str)
            .literal_separator(literal_separator)
            .build()
            .with_context(|| format!("invalid glob pattern: {}", pattern))?;
        Ok(Self {
            original: pattern.to_string(),
            matcher: glob.compile_matcher(),
            anchored,
            literal_separator,
        })
    }

    /// Path patterns contain `/` past the anchor and must match the full key.
    fn is_path_pattern(&self) -> bool {
        self.original.trim_start_matches('/').contains('/')
    }

    /// Check if this pattern matches the given relative key
    pub fn matches(&self, compare_key: &str) -> bool {
        if self.matcher.is_match(compare_key) {
            return true;
        }
        if self.anchored || self.is_path_pattern() || !self.literal_separator {
            return false;
        }
        // with literal separators simple patterns still match a file name at any depth
        compare_key
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .is_some_and(|name| self.matcher.is_match(name))
    }
}

/// Result of evaluating a filter chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterResult {
    /// no filter matched
    Included,
    /// the last matching filter was an include
    IncludedByPattern(String),
    /// the last matching filter was an exclude
    ExcludedByPattern(String),
}

impl FilterResult {
    #[must_use]
    pub fn is_included(&self) -> bool {
        !matches!(self, FilterResult::ExcludedByPattern(_))
    }
}

/// An ordered sequence of include/exclude filters
#[derive(Debug, Clone, Default)]
pub struct FilterChain {
    filters: Vec<(FilterVerb, FilterPattern)>,
    literal_separator: bool,
}

impl FilterChain {
    /// Create a chain where `*` matches across `/`
    pub fn new() -> Self {
        Self::default()
    }
    /// Create a chain where `*` does not match `/`
    pub fn with_literal_separator() -> Self {
        Self {
            filters: Vec::new(),
            literal_separator: true,
        }
    }
    /// Append a filter, order of calls is significant
    pub fn add(&mut self, verb: FilterVerb, pattern: &str) -> Result<(), anyhow::Error> {
        self.filters
            .push((verb, FilterPattern::parse(pattern, self.literal_separator)?));
        Ok(())
    }
    pub fn add_include(&mut self, pattern: &str) -> Result<(), anyhow::Error> {
        self.add(FilterVerb::Include, pattern)
    }
    pub fn add_exclude(&mut self, pattern: &str) -> Result<(), anyhow::Error> {
        self.add(FilterVerb::Exclude, pattern)
    }
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
    pub fn len(&self) -> usize {
        self.filters.len()
    }
    /// Iterate over (verb, original pattern) in evaluation order
    pub fn iter(&self) -> impl Iterator<Item = (FilterVerb, &str)> {
        self.filters
            .iter()
            .map(|(verb, pattern)| (*verb, pattern.original.as_str()))
    }
    /// Evaluate all filters in order, the last match wins
    pub fn evaluate(&self, compare_key: &str) -> FilterResult {
        let mut result = FilterResult::Included;
        for (verb, pattern) in &self.filters {
            if pattern.matches(compare_key) {
                let original = pattern.original.clone();
                result = match verb {
                    FilterVerb::Include => FilterResult::IncludedByPattern(original),
                    FilterVerb::Exclude => FilterResult::ExcludedByPattern(original),
                };
            }
        }
        result
    }
    pub fn includes(&self, compare_key: &str) -> bool {
        self.evaluate(compare_key).is_included()
    }
    /// Parse a filter chain from a file
    ///
    /// # File Format
    /// ```text
    /// # comments supported
    /// --exclude *
    /// --include *.rs
    /// ```
    pub fn from_file(
        path: &std::path::Path,
        literal_separator: bool,
    ) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read filter file: {:?}", path))?;
        Self::parse_content(&content, literal_separator)
    }
    /// Parse a filter chain from a string (filter file format)
    pub fn parse_content(content: &str, literal_separator: bool) -> Result<Self, anyhow::Error> {
        let mut chain = if literal_separator {
            Self::with_literal_separator()
        } else {
            Self::new()
        };
        for (line_num, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line_num = line_num + 1; // 1-based for error messages
            let (verb, pattern) = if let Some(pattern) = line.strip_prefix("--include ") {
                (FilterVerb::Include, pattern)
            } else if let Some(pattern) = line.strip_prefix("--exclude ") {
                (FilterVerb::Exclude, pattern)
            } else {
                return Err(anyhow!(
                    "line {}: invalid syntax '{}', expected '--include PATTERN' or '--exclude PATTERN'",
                    line_num,
                    line
                ));
            };
            chain
                .add(verb, pattern.trim())
                .with_context(|| format!("line {}: invalid {} pattern", line_num, verb))?;
        }
        Ok(chain)
    }
}
