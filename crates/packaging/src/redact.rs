//! Scrubbing of credentials from build output before it is logged or
//! surfaced in an error.

use regex::Regex;
use std::borrow::Cow;
use std::sync::LazyLock;

pub const REDACTED: &str = "[REDACTED]";

/// `scheme://user:password@` credentials embedded in URLs, as git prints
/// them when a clone fails.
static URL_USERINFO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?P<scheme>[A-Za-z][A-Za-z0-9+.\-]*://)[^/@\s:]+:[^/@\s]*@")
        .expect("invalid userinfo pattern")
});

/// Redacts a fixed set of literal values plus any URL userinfo.
#[derive(Debug, Clone, Default)]
pub struct Redactor<'a> {
    literals: Vec<&'a str>,
}

impl<'a> Redactor<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_literal(mut self, literal: &'a str) -> Self {
        if !literal.is_empty() {
            self.literals.push(literal);
        }
        self
    }

    pub fn redact<'s>(&self, input: &'s str) -> Cow<'s, str> {
        let mut output = URL_USERINFO.replace_all(input, format!("${{scheme}}{REDACTED}@"));
        for &literal in &self.literals {
            if output.contains(literal) {
                output = Cow::Owned(output.replace(literal, REDACTED));
            }
        }
        output
    }

    /// Redacts and keeps only the last `max_lines` lines, for error messages
    /// built from process output.
    pub fn redact_tail(&self, input: &str, max_lines: usize) -> String {
        let redacted = self.redact(input);
        let lines: Vec<&str> = redacted.lines().collect();
        let start = lines.len().saturating_sub(max_lines);
        lines[start..].join("\n")
    }
}
