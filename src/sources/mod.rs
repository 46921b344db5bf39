// src/sources/mod.rs
// Source adapters: capability objects over external systems.
// The pipeline only sees this trait; protocol details stay in each adapter.

pub mod file;
pub mod github;
pub mod telegram;
pub mod whatsapp;

pub use file::FileAdapter;
pub use github::GithubAdapter;
pub use telegram::TelegramAdapter;
pub use whatsapp::WhatsappAdapter;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::document::Source;
use crate::error::{MnemoError, Result};

/// Raw source-shaped records, exactly as the remote system hands them over.
/// Preprocessors turn these into documents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawBatch {
    #[serde(default)]
    pub messages: Vec<serde_json::Value>,
    #[serde(default)]
    pub conversations: Vec<serde_json::Value>,
    #[serde(default)]
    pub repositories: Vec<serde_json::Value>,
}

impl RawBatch {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.conversations.is_empty() && self.repositories.is_empty()
    }

    pub fn record_count(&self) -> usize {
        self.messages.len() + self.conversations.len() + self.repositories.len()
    }
}

/// Adapter health signal.
#[derive(Debug, Clone)]
pub struct AdapterHealth {
    pub healthy: bool,
    pub details: String,
}

/// Fetch capabilities every source exposes. Bounded batches only; adapters
/// never hand out open-ended iterators.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> Source;

    /// Fetch all available history (first run).
    async fn fetch_full(&self) -> Result<RawBatch>;

    /// Fetch records newer than the given instant (incremental run).
    async fn fetch_since(&self, since: DateTime<Utc>) -> Result<RawBatch>;

    /// Fetch records within a closed time range.
    async fn fetch_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<RawBatch>;

    async fn healthcheck(&self) -> AdapterHealth;

    /// Whether the source needs interactive authorization before fetching.
    /// Most sources are pre-authorized.
    async fn is_authenticated(&self) -> Result<bool> {
        Ok(true)
    }

    /// Where the user completes authorization (e.g. a QR page), when needed.
    async fn auth_url(&self) -> Option<String> {
        None
    }

    /// Block until the source is authorized, or the timeout elapses.
    /// Returns whether authorization completed.
    async fn wait_for_auth(&self, _timeout: Duration) -> Result<bool> {
        Ok(true)
    }
}

/// Map an HTTP error status to the adapter error taxonomy.
/// 429 carries the server's Retry-After when present.
pub(crate) fn error_for_status(
    source: Source,
    status: reqwest::StatusCode,
    retry_after: Option<u64>,
    body: &str,
) -> MnemoError {
    match status.as_u16() {
        429 => MnemoError::RateLimited {
            wait_seconds: retry_after.unwrap_or(1),
        },
        401 | 403 => MnemoError::AuthRequired(format!("{source}: {status}")),
        _ => MnemoError::Source(format!("{source} request failed ({status}): {body}")),
    }
}

/// Parse a Retry-After header value (seconds form only).
pub(crate) fn parse_retry_after(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}
