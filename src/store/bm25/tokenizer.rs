// src/store/bm25/tokenizer.rs
// Regex tokenizer for the keyword index.

use anyhow::{Context, Result};
use regex::Regex;

/// Lowercases input and extracts tokens with a configurable pattern.
/// The default pattern follows the regex crate's Unicode word semantics.
#[derive(Debug, Clone)]
pub struct Tokenizer {
    pattern: Regex,
    pattern_source: String,
}

pub const DEFAULT_PATTERN: &str = r"\b\w+\b";

impl Tokenizer {
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern)
            .with_context(|| format!("invalid tokenizer pattern: {pattern}"))?;
        Ok(Self {
            pattern: regex,
            pattern_source: pattern.to_string(),
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern_source
    }

    pub fn tokenize(&self, text: &str) -> Vec<String> {
        let lowered = text.to_lowercase();
        self.pattern
            .find_iter(&lowered)
            .map(|m| m.as_str().to_string())
            .collect()
    }
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new(DEFAULT_PATTERN).expect("default pattern is valid")
    }
}
