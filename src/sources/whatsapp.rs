// src/sources/whatsapp.rs
// Client for a WhatsApp HTTP bridge. The bridge pairs via QR code; fetches
// are refused until pairing completes. Bridge timestamps are epoch millis.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

use super::{AdapterHealth, RawBatch, SourceAdapter, error_for_status, parse_retry_after};
use crate::config::WhatsappIngestorConfig;
use crate::document::Source;
use crate::error::{MnemoError, Result};
use crate::utils::RateLimiter;

/// Poll interval while waiting for QR pairing.
const AUTH_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct BridgeStatus {
    #[serde(default)]
    authenticated: bool,
    #[serde(default)]
    qr_url: Option<String>,
}

pub struct WhatsappAdapter {
    base_url: String,
    http_client: reqwest::Client,
    rate_limiter: RateLimiter,
}

impl WhatsappAdapter {
    pub fn new(config: &WhatsappIngestorConfig) -> Result<Self> {
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            http_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            rate_limiter: RateLimiter::new(config.rate_limit_per_minute)
                .map_err(MnemoError::Anyhow)?,
        })
    }

    async fn status(&self) -> Result<BridgeStatus> {
        let url = format!("{}/api/status", self.base_url);
        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| MnemoError::Source(format!("whatsapp bridge unreachable: {e}")))?;
        if !response.status().is_success() {
            return Err(MnemoError::Source(format!(
                "whatsapp bridge status returned {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| MnemoError::Source(format!("malformed whatsapp status: {e}")))
    }

    async fn fetch(&self, query: &[(&str, String)]) -> Result<RawBatch> {
        self.rate_limiter.acquire().await;

        let url = format!("{}/api/messages", self.base_url);
        let response = self
            .http_client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| MnemoError::Source(format!("whatsapp bridge unreachable: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let retry_after = parse_retry_after(&response);
            let body = response.text().await.unwrap_or_default();
            return Err(error_for_status(Source::Whatsapp, status, retry_after, &body));
        }

        let batch: RawBatch = response
            .json()
            .await
            .map_err(|e| MnemoError::Source(format!("malformed whatsapp payload: {e}")))?;
        debug!(records = batch.record_count(), "fetched whatsapp batch");
        Ok(batch)
    }
}

#[async_trait]
impl SourceAdapter for WhatsappAdapter {
    fn source(&self) -> Source {
        Source::Whatsapp
    }

    async fn fetch_full(&self) -> Result<RawBatch> {
        self.fetch(&[]).await
    }

    async fn fetch_since(&self, since: DateTime<Utc>) -> Result<RawBatch> {
        // The bridge speaks milliseconds
        self.fetch(&[("since", since.timestamp_millis().to_string())])
            .await
    }

    async fn fetch_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<RawBatch> {
        self.fetch(&[
            ("start", start.timestamp_millis().to_string()),
            ("end", end.timestamp_millis().to_string()),
        ])
        .await
    }

    async fn healthcheck(&self) -> AdapterHealth {
        match self.status().await {
            Ok(status) => AdapterHealth {
                healthy: status.authenticated,
                details: if status.authenticated {
                    "whatsapp bridge paired".to_string()
                } else {
                    "whatsapp bridge reachable but not paired".to_string()
                },
            },
            Err(e) => AdapterHealth {
                healthy: false,
                details: e.to_string(),
            },
        }
    }

    async fn is_authenticated(&self) -> Result<bool> {
        Ok(self.status().await?.authenticated)
    }

    async fn auth_url(&self) -> Option<String> {
        self.status().await.ok().and_then(|s| s.qr_url)
    }

    async fn wait_for_auth(&self, timeout: Duration) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.status().await?.authenticated {
                info!("whatsapp bridge paired");
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(
                AUTH_POLL_INTERVAL
                    .min(deadline.saturating_duration_since(tokio::time::Instant::now())),
            )
            .await;
        }
    }
}
