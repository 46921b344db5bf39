// src/sources/telegram.rs
// Client for a local MTProto gateway that exports conversations as JSON.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::debug;

use super::{AdapterHealth, RawBatch, SourceAdapter, error_for_status, parse_retry_after};
use crate::config::TelegramIngestorConfig;
use crate::document::Source;
use crate::error::{MnemoError, Result};
use crate::utils::RateLimiter;

/// Adapter over the Telegram gateway's export API.
///
/// The gateway owns the MTProto session; this client only pages messages.
/// Gateway timestamps are epoch seconds.
pub struct TelegramAdapter {
    base_url: String,
    session: Option<String>,
    http_client: reqwest::Client,
    rate_limiter: RateLimiter,
}

impl TelegramAdapter {
    pub fn new(config: &TelegramIngestorConfig) -> Result<Self> {
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            session: config.session.clone(),
            http_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            rate_limiter: RateLimiter::new(config.rate_limit_per_minute)
                .map_err(MnemoError::Anyhow)?,
        })
    }

    async fn fetch(&self, query: &[(&str, String)]) -> Result<RawBatch> {
        self.rate_limiter.acquire().await;

        let url = format!("{}/messages", self.base_url);
        let mut request = self.http_client.get(&url).query(query);
        if let Some(session) = &self.session {
            request = request.header("X-Session", session);
        }

        let response = request
            .send()
            .await
            .map_err(|e| MnemoError::Source(format!("telegram gateway unreachable: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let retry_after = parse_retry_after(&response);
            let body = response.text().await.unwrap_or_default();
            return Err(error_for_status(Source::Telegram, status, retry_after, &body));
        }

        let batch: RawBatch = response
            .json()
            .await
            .map_err(|e| MnemoError::Source(format!("malformed telegram payload: {e}")))?;
        debug!(records = batch.record_count(), "fetched telegram batch");
        Ok(batch)
    }
}

#[async_trait]
impl SourceAdapter for TelegramAdapter {
    fn source(&self) -> Source {
        Source::Telegram
    }

    async fn fetch_full(&self) -> Result<RawBatch> {
        self.fetch(&[]).await
    }

    async fn fetch_since(&self, since: DateTime<Utc>) -> Result<RawBatch> {
        self.fetch(&[("since", since.timestamp().to_string())]).await
    }

    async fn fetch_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<RawBatch> {
        self.fetch(&[
            ("start", start.timestamp().to_string()),
            ("end", end.timestamp().to_string()),
        ])
        .await
    }

    async fn healthcheck(&self) -> AdapterHealth {
        let url = format!("{}/health", self.base_url);
        match self.http_client.get(&url).send().await {
            Ok(response) if response.status().is_success() => AdapterHealth {
                healthy: true,
                details: "telegram gateway reachable".to_string(),
            },
            Ok(response) => AdapterHealth {
                healthy: false,
                details: format!("telegram gateway returned {}", response.status()),
            },
            Err(e) => AdapterHealth {
                healthy: false,
                details: format!("telegram gateway unreachable: {e}"),
            },
        }
    }
}
