//! Helpers shared by the log grammars.
//!
//! A line that carries a grammar's prefix but does not fully match yields a
//! [`ParseMismatch`] instead of a panic. Individual numeric fields that fail
//! to parse fall back to zero.

use regex::{Captures, Regex};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line does not match the {grammar} grammar: {line}")]
pub struct ParseMismatch {
    pub grammar: &'static str,
    pub line: String,
}

impl ParseMismatch {
    #[must_use]
    pub fn new(grammar: &'static str, line: &str) -> Self {
        Self { grammar, line: line.to_string() }
    }
}

/// Match `re` against `line`, or report which grammar rejected it.
pub fn captures<'l>(re: &Regex, grammar: &'static str, line: &'l str) -> Result<Captures<'l>, ParseMismatch> {
    re.captures(line).ok_or_else(|| ParseMismatch::new(grammar, line))
}

/// Parse capture group `index` as `T`, defaulting (with a warning) when absent or malformed.
pub fn field<T>(caps: &Captures<'_>, index: usize, name: &str) -> T
where
    T: FromStr + Default,
{
    let Some(raw) = caps.get(index).map(|m| m.as_str().trim()) else {
        tracing::warn!(field = name, "missing capture, defaulting");
        return T::default();
    };
    raw.parse().unwrap_or_else(|_| {
        tracing::warn!(field = name, value = raw, "unparseable value, defaulting");
        T::default()
    })
}

/// Capture group `index` as trimmed text, empty when absent.
pub fn text(caps: &Captures<'_>, index: usize) -> String {
    caps.get(index).map(|m| m.as_str().trim().to_string()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mismatch_carries_grammar_and_line() {
        let re = Regex::new(r"^(\d+) apples$").unwrap();
        let err = captures(&re, "fruit", "seven apples").unwrap_err();
        assert_eq!(err.grammar, "fruit");
        assert_eq!(err.line, "seven apples");
        assert!(err.to_string().contains("fruit grammar"));
    }

    #[test]
    fn test_field_defaults_on_bad_number() {
        let re = Regex::new(r"^(.*) / (.*)$").unwrap();
        let caps = captures(&re, "pair", "1.2.3 / 42").unwrap();
        let first: f64 = field(&caps, 1, "first");
        let second: i64 = field(&caps, 2, "second");
        let missing: i64 = field(&caps, 7, "missing");
        assert!(first.abs() < f64::EPSILON);
        assert_eq!(second, 42);
        assert_eq!(missing, 0);
        assert_eq!(text(&caps, 2), "42");
    }
}
