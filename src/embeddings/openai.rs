// src/embeddings/openai.rs
// OpenAI embeddings via /v1/embeddings

use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

/// Max texts per batch request
const MAX_BATCH_SIZE: usize = 256;

/// Retry attempts for transient failures
const RETRY_ATTEMPTS: usize = 1;

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

/// OpenAI embeddings client
pub struct OpenAiEmbeddings {
    api_key: String,
    model: String,
    dimensions: usize,
    base_url: String,
    http_client: reqwest::Client,
}

impl OpenAiEmbeddings {
    pub fn new(
        api_key: String,
        model: String,
        dimensions: usize,
        base_url: Option<String>,
    ) -> Self {
        let base_url = base_url
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
            .trim_end_matches('/')
            .to_string();

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            api_key,
            model,
            dimensions,
            base_url,
            http_client,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            warn!("embedding empty text, returning zero vector");
            return Ok(vec![0.0; self.dimensions]);
        }
        let results = self.embed_texts(&[text.to_string()]).await?;
        results
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Empty embedding response from OpenAI"))
    }

    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        // Empty texts get zero vectors without a round trip; the rest keep
        // their positions.
        let mut results = vec![Vec::new(); texts.len()];
        let mut pending_idx = Vec::new();
        let mut pending = Vec::new();
        for (i, text) in texts.iter().enumerate() {
            if text.trim().is_empty() {
                warn!("embedding empty text at position {}, returning zero vector", i);
                results[i] = vec![0.0; self.dimensions];
            } else {
                pending_idx.push(i);
                pending.push(text.clone());
            }
        }

        let mut embedded = Vec::with_capacity(pending.len());
        for chunk in pending.chunks(MAX_BATCH_SIZE) {
            embedded.extend(self.embed_texts(chunk).await?);
        }
        if embedded.len() != pending_idx.len() {
            anyhow::bail!(
                "OpenAI returned {} embeddings for {} inputs",
                embedded.len(),
                pending_idx.len()
            );
        }
        for (slot, vector) in pending_idx.into_iter().zip(embedded) {
            results[slot] = vector;
        }
        Ok(results)
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "input": texts,
            "model": self.model,
            "dimensions": self.dimensions,
        });
        let url = format!("{}/embeddings", self.base_url);

        let mut last_error = None;
        for attempt in 0..=RETRY_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(1000)).await;
            }

            match self
                .http_client
                .post(&url)
                .bearer_auth(&self.api_key)
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await
            {
                Ok(response) => {
                    if response.status().is_success() {
                        let resp: EmbeddingResponse = response
                            .json()
                            .await
                            .context("Failed to parse OpenAI embedding response")?;

                        let mut data = resp.data;
                        data.sort_by_key(|d| d.index);

                        let embeddings: Vec<Vec<f32>> =
                            data.into_iter().map(|d| d.embedding).collect();

                        for embedding in &embeddings {
                            if embedding.len() != self.dimensions {
                                anyhow::bail!(
                                    "OpenAI embedding has {} dimensions, expected {}",
                                    embedding.len(),
                                    self.dimensions
                                );
                            }
                        }
                        return Ok(embeddings);
                    }

                    let status = response.status();
                    let body_text = response.text().await.unwrap_or_default();
                    last_error = Some(anyhow::anyhow!(
                        "OpenAI embedding request failed ({}): {}",
                        status,
                        body_text
                    ));
                }
                Err(e) => {
                    last_error = Some(anyhow::anyhow!("OpenAI embedding request error: {}", e));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("OpenAI embedding failed")))
    }
}
