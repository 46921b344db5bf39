// src/document.rs
// Document model shared across preprocessors, the vector store, and retrieval

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Message sources routed to their own collections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Telegram,
    Whatsapp,
    Github,
    File,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Telegram => "telegram",
            Source::Whatsapp => "whatsapp",
            Source::Github => "github",
            Source::File => "file",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Source {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "telegram" => Ok(Source::Telegram),
            "whatsapp" => Ok(Source::Whatsapp),
            "github" => Ok(Source::Github),
            "file" => Ok(Source::File),
            _ => Err(anyhow::anyhow!("Unknown source: {}", s)),
        }
    }
}

/// Typed metadata value. Persisted as JSON alongside the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl MetadataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetadataValue::Int(i) => Some(*i),
            MetadataValue::Float(f) => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetadataValue::Float(f) => Some(*f),
            MetadataValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MetadataValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        MetadataValue::Str(s.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        MetadataValue::Str(s)
    }
}

impl From<i64> for MetadataValue {
    fn from(i: i64) -> Self {
        MetadataValue::Int(i)
    }
}

impl From<f64> for MetadataValue {
    fn from(f: f64) -> Self {
        MetadataValue::Float(f)
    }
}

impl From<bool> for MetadataValue {
    fn from(b: bool) -> Self {
        MetadataValue::Bool(b)
    }
}

/// Ordered key/value metadata map
pub type Metadata = BTreeMap<String, MetadataValue>;

/// The unit of storage in the vector store.
///
/// Message documents carry stable ids of the form
/// `{source}_{conversation_id}_{message_id}`; documents written without an id
/// get a generated UUID at store time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
    /// Attached at write time; not all call sites carry vectors around.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vec<f32>>,
}

impl Document {
    pub fn new(id: impl Into<String>, text: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            metadata,
            vector: None,
        }
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    pub fn meta_i64(&self, key: &str) -> Option<i64> {
        self.metadata.get(key).and_then(|v| v.as_i64())
    }

    /// Normalized epoch seconds for ordering and gap detection.
    /// Prefers `timestamp_sec`, falls back to normalizing `timestamp`.
    pub fn timestamp_sec(&self) -> Option<i64> {
        if let Some(sec) = self.meta_i64("timestamp_sec") {
            return Some(sec);
        }
        self.metadata.get("timestamp").and_then(timestamp_to_secs)
    }
}

/// Epoch values below this are seconds; at or above, milliseconds.
/// Second-precision epochs stay below 10^10 until the year 2286, while every
/// realistic millisecond epoch is above it.
const MILLIS_CUTOFF: i64 = 10_000_000_000;

/// Normalize a metadata timestamp to epoch seconds.
///
/// Accepts numeric epochs (seconds or milliseconds) and ISO-8601 strings.
pub fn timestamp_to_secs(value: &MetadataValue) -> Option<i64> {
    match value {
        MetadataValue::Int(n) => Some(normalize_epoch(*n)),
        MetadataValue::Float(f) => Some(normalize_epoch(*f as i64)),
        MetadataValue::Str(s) => parse_iso_timestamp(s),
        MetadataValue::Bool(_) => None,
    }
}

/// Collapse a numeric epoch to seconds regardless of original precision.
pub fn normalize_epoch(n: i64) -> i64 {
    if n.abs() >= MILLIS_CUTOFF { n / 1000 } else { n }
}

fn parse_iso_timestamp(s: &str) -> Option<i64> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp());
    }
    // Bare datetime without offset, e.g. "2024-01-02T03:04:05"
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc().timestamp());
    }
    // Numeric epoch that arrived as a string
    s.trim().parse::<i64>().ok().map(normalize_epoch)
}

/// Whether a prev/next message-id token denotes a real message.
/// The sentinels "false" and "null" mean "absent".
pub fn is_real_message_id(token: &str) -> bool {
    let t = token.trim();
    !t.is_empty() && !t.eq_ignore_ascii_case("false") && !t.eq_ignore_ascii_case("null")
}

/// Split a comma-joined id list into real message-id tokens.
pub fn split_id_list(joined: &str) -> Vec<&str> {
    joined
        .split(',')
        .map(str::trim)
        .filter(|t| is_real_message_id(t))
        .collect()
}
