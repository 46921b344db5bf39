// src/sources/github.rs
// Repository reader over the GitHub REST API: repo metadata plus recent
// commits for each configured repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, warn};

use super::{AdapterHealth, RawBatch, SourceAdapter, error_for_status, parse_retry_after};
use crate::config::GithubIngestorConfig;
use crate::document::Source;
use crate::error::{MnemoError, Result};
use crate::utils::RateLimiter;

pub struct GithubAdapter {
    api_base: String,
    token: Option<String>,
    repos: Vec<String>,
    http_client: reqwest::Client,
    rate_limiter: RateLimiter,
}

impl GithubAdapter {
    pub fn new(config: &GithubIngestorConfig) -> Result<Self> {
        Ok(Self {
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            repos: config.repos.clone(),
            http_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .connect_timeout(Duration::from_secs(10))
                .user_agent("mnemo-ingest")
                .build()
                .unwrap_or_default(),
            rate_limiter: RateLimiter::new(config.rate_limit_per_minute)
                .map_err(MnemoError::Anyhow)?,
        })
    }

    async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<Value> {
        self.rate_limiter.acquire().await;

        let mut request = self.http_client.get(url).query(query);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| MnemoError::Source(format!("github unreachable: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let retry_after = parse_retry_after(&response);
            let body = response.text().await.unwrap_or_default();
            return Err(error_for_status(Source::Github, status, retry_after, &body));
        }

        response
            .json()
            .await
            .map_err(|e| MnemoError::Source(format!("malformed github payload: {e}")))
    }

    /// Fetch one repository's records: the repo descriptor and its commits,
    /// optionally bounded by a time window.
    async fn fetch_repo(
        &self,
        full_name: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<Value>> {
        let repo_url = format!("{}/repos/{}", self.api_base, full_name);
        let repo = self.get_json(&repo_url, &[]).await?;

        let mut query: Vec<(&str, String)> = vec![("per_page", "100".to_string())];
        if let Some(since) = since {
            query.push(("since", since.to_rfc3339()));
        }
        if let Some(until) = until {
            query.push(("until", until.to_rfc3339()));
        }
        let commits_url = format!("{}/repos/{}/commits", self.api_base, full_name);
        let commits = self.get_json(&commits_url, &query).await?;

        let mut records = vec![json!({
            "repo": full_name,
            "kind": "repository",
            "id": repo.get("id").cloned().unwrap_or(Value::Null),
            "description": repo.get("description").cloned().unwrap_or(Value::Null),
            "updated_at": repo.get("updated_at").cloned().unwrap_or(Value::Null),
        })];

        if let Some(commits) = commits.as_array() {
            for commit in commits {
                records.push(json!({
                    "repo": full_name,
                    "kind": "commit",
                    "sha": commit.get("sha").cloned().unwrap_or(Value::Null),
                    "message": commit
                        .pointer("/commit/message")
                        .cloned()
                        .unwrap_or(Value::Null),
                    "author": commit
                        .pointer("/commit/author/name")
                        .cloned()
                        .unwrap_or(Value::Null),
                    "date": commit
                        .pointer("/commit/author/date")
                        .cloned()
                        .unwrap_or(Value::Null),
                }));
            }
        }
        Ok(records)
    }

    async fn fetch_all(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<RawBatch> {
        let mut repositories = Vec::new();
        for full_name in &self.repos {
            match self.fetch_repo(full_name, since, until).await {
                Ok(records) => repositories.extend(records),
                // Rate limiting propagates so the pipeline can back off;
                // other per-repo failures skip the repo.
                Err(e @ MnemoError::RateLimited { .. }) => return Err(e),
                Err(e) => warn!("skipping repository {}: {}", full_name, e),
            }
        }
        debug!(records = repositories.len(), "fetched github batch");
        Ok(RawBatch {
            repositories,
            ..Default::default()
        })
    }
}

#[async_trait]
impl SourceAdapter for GithubAdapter {
    fn source(&self) -> Source {
        Source::Github
    }

    async fn fetch_full(&self) -> Result<RawBatch> {
        self.fetch_all(None, None).await
    }

    async fn fetch_since(&self, since: DateTime<Utc>) -> Result<RawBatch> {
        self.fetch_all(Some(since), None).await
    }

    async fn fetch_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<RawBatch> {
        self.fetch_all(Some(start), Some(end)).await
    }

    async fn healthcheck(&self) -> AdapterHealth {
        let url = format!("{}/rate_limit", self.api_base);
        match self.get_json(&url, &[]).await {
            Ok(_) => AdapterHealth {
                healthy: true,
                details: "github api reachable".to_string(),
            },
            Err(e) => AdapterHealth {
                healthy: false,
                details: e.to_string(),
            },
        }
    }
}
