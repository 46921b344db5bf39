// src/validator/mod.rs
// Rule-based query validation. A failed validation is a normal "not allowed"
// outcome, not an error.

use chrono::{Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MnemoError, Result};

/// Runtime context a query is validated against.
#[derive(Debug, Clone, Default)]
pub struct ValidationContext {
    /// Where the query came from (e.g. "cli", "telegram").
    pub source: String,
    pub user_id: String,
    /// Permission level granted to the user; 0 when unknown.
    pub permission_level: i64,
    /// Hour of day override for evaluation; defaults to the current UTC hour.
    pub hour_override: Option<u32>,
}

/// Validation rules, discriminated by `type` in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Rule {
    /// Query source must be in the allowed list.
    Source { allowed: Vec<String> },
    /// Query length must fall within [min, max].
    Length { min: usize, max: usize },
    /// Query must not contain any forbidden keyword (case-insensitive).
    Keyword { forbidden: Vec<String> },
    /// Query must match the pattern.
    Regex { pattern: String },
    /// Queries are only allowed between start_hour and end_hour (inclusive,
    /// wrapping over midnight when start > end).
    Time { start_hour: u32, end_hour: u32 },
    /// Context permission level must reach the required level.
    Permission { required_level: i64 },
}

impl Rule {
    fn evaluate(&self, query: &str, context: &ValidationContext) -> Result<Option<String>> {
        let failure = match self {
            Rule::Source { allowed } => {
                if allowed.iter().any(|s| s == &context.source) {
                    None
                } else {
                    Some(format!(
                        "source '{}' is not allowed (allowed: {})",
                        context.source,
                        allowed.join(", ")
                    ))
                }
            }
            Rule::Length { min, max } => {
                let length = query.chars().count();
                if length < *min {
                    Some(format!("query too short ({length} < {min})"))
                } else if length > *max {
                    Some(format!("query too long ({length} > {max})"))
                } else {
                    None
                }
            }
            Rule::Keyword { forbidden } => {
                let lowered = query.to_lowercase();
                forbidden
                    .iter()
                    .find(|keyword| lowered.contains(&keyword.to_lowercase()))
                    .map(|keyword| format!("query contains forbidden term '{keyword}'"))
            }
            Rule::Regex { pattern } => {
                let regex = regex::Regex::new(pattern).map_err(|e| {
                    MnemoError::Config(format!("invalid validation pattern '{pattern}': {e}"))
                })?;
                if regex.is_match(query) {
                    None
                } else {
                    Some(format!("query does not match required pattern '{pattern}'"))
                }
            }
            Rule::Time {
                start_hour,
                end_hour,
            } => {
                let hour = context.hour_override.unwrap_or_else(|| Utc::now().hour());
                let inside = if start_hour <= end_hour {
                    (*start_hour..=*end_hour).contains(&hour)
                } else {
                    hour >= *start_hour || hour <= *end_hour
                };
                if inside {
                    None
                } else {
                    Some(format!(
                        "queries are only allowed between {start_hour}:00 and {end_hour}:59"
                    ))
                }
            }
            Rule::Permission { required_level } => {
                if context.permission_level >= *required_level {
                    None
                } else {
                    Some(format!(
                        "permission level {} is below required {}",
                        context.permission_level, required_level
                    ))
                }
            }
        };
        Ok(failure)
    }
}

/// Evaluates a rule list against a query and its runtime context.
pub struct RuleBasedValidator {
    /// Sources always allowed; the built-in source rule evaluates first.
    allowed_sources: Vec<String>,
    /// Collect every failure instead of stopping at the first.
    collect_all: bool,
}

impl RuleBasedValidator {
    pub fn new(allowed_sources: Vec<String>, collect_all: bool) -> Self {
        Self {
            allowed_sources,
            collect_all,
        }
    }

    /// Validate a query. Returns (ok, failure reasons).
    pub fn validate(
        &self,
        query: &str,
        context: &ValidationContext,
        rules: &[Rule],
    ) -> Result<(bool, Vec<String>)> {
        let mut failures = Vec::new();

        // Built-in source check, always active
        let source_rule = Rule::Source {
            allowed: self.allowed_sources.clone(),
        };
        if let Some(failure) = source_rule.evaluate(query, context)? {
            failures.push(failure);
            if !self.collect_all {
                return Ok((false, failures));
            }
        }

        for rule in rules {
            if let Some(failure) = rule.evaluate(query, context)? {
                failures.push(failure);
                if !self.collect_all {
                    break;
                }
            }
        }

        let ok = failures.is_empty();
        if !ok {
            debug!(user = %context.user_id, failures = failures.len(), "validation failed");
        }
        Ok((ok, failures))
    }
}
