//! Namespace pattern matching for the `replicate-to` annotation
//!
//! The annotation holds a comma-separated list of regular expressions. Every
//! entry is trimmed and anchored before compilation, so `prod` selects the
//! namespace `prod` and nothing else; wildcards must be spelled out
//! (`prod-.*`). Entries that fail to compile are logged and skipped, the rest
//! of the list still applies.

use regex::Regex;
use tracing::warn;

use extsync_common::Error;

/// A compiled `replicate-to` value
#[derive(Clone, Debug, Default)]
pub struct NamespacePatterns {
    patterns: Vec<Regex>,
}

impl NamespacePatterns {
    /// Compile a raw annotation value, skipping invalid entries
    pub fn parse(list: &str) -> Self {
        let patterns = list
            .split(',')
            .filter(|raw| !raw.trim().is_empty())
            .filter_map(|raw| match compile_strict(raw) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    warn!(patterns = %list, error = %e, "Skipping invalid namespace pattern");
                    None
                }
            })
            .collect();
        Self { patterns }
    }

    /// True if `namespace` fully matches at least one valid pattern
    pub fn matches(&self, namespace: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(namespace))
    }

    /// Namespaces from `candidates` that should receive a replica of a
    /// source living in `source_namespace`.
    ///
    /// The source namespace is always excluded, even if a pattern selects it.
    pub fn targets<'a, I>(&self, source_namespace: &str, candidates: I) -> Vec<&'a str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        candidates
            .into_iter()
            .filter(|ns| *ns != source_namespace && self.matches(ns))
            .collect()
    }

    /// True when no valid pattern survived compilation
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Anchor a pattern as a whole, so alternations cannot escape the anchors.
///
/// User supplied `^`/`$` at the ends are dropped before wrapping.
pub fn anchor(pattern: &str) -> String {
    let mut body = pattern.trim();
    body = body.strip_prefix('^').unwrap_or(body);
    if body.ends_with('$') && !body.ends_with("\\$") {
        body = &body[..body.len() - 1];
    }
    format!("^(?:{})$", body)
}

/// Compile a single anchored pattern
pub fn compile_strict(pattern: &str) -> Result<Regex, Error> {
    let anchored = anchor(pattern);
    Regex::new(&anchored).map_err(|e| Error::InvalidPattern {
        pattern: anchored,
        message: e.to_string(),
    })
}
