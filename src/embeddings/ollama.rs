// src/embeddings/ollama.rs
// Ollama embeddings via the OpenAI-compatible /v1/embeddings endpoint

use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

/// Max texts per batch request (conservative limit for local models)
const MAX_BATCH_SIZE: usize = 64;

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

/// Ollama embeddings client (no auth required)
pub struct OllamaEmbeddings {
    base_url: String,
    model: String,
    dimensions: usize,
    http_client: reqwest::Client,
}

impl OllamaEmbeddings {
    pub fn new(base_url: String, model: String, dimensions: usize) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            base_url,
            model,
            dimensions,
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
            .ok_or_else(|| anyhow::anyhow!("Empty embedding response from Ollama"))
    }

    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let mut results = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(MAX_BATCH_SIZE) {
            // Preserve positions for empty texts within the chunk
            let mut chunk_results = vec![Vec::new(); chunk.len()];
            let mut pending_idx = Vec::new();
            let mut pending = Vec::new();
            for (i, text) in chunk.iter().enumerate() {
                if text.trim().is_empty() {
                    warn!("embedding empty text, returning zero vector");
                    chunk_results[i] = vec![0.0; self.dimensions];
                } else {
                    pending_idx.push(i);
                    pending.push(text.clone());
                }
            }
            if !pending.is_empty() {
                let embedded = self.embed_texts(&pending).await?;
                for (slot, vector) in pending_idx.into_iter().zip(embedded) {
                    chunk_results[slot] = vector;
                }
            }
            results.extend(chunk_results);
        }
        Ok(results)
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "input": texts,
            "model": self.model,
        });
        let url = format!("{}/v1/embeddings", self.base_url);

        let mut last_error = None;
        for attempt in 0..=RETRY_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(1000)).await;
            }

            match self
                .http_client
                .post(&url)
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
                            .context("Failed to parse Ollama embedding response")?;

                        let mut data = resp.data;
                        data.sort_by_key(|d| d.index);
                        return Ok(data.into_iter().map(|d| d.embedding).collect());
                    }

                    let status = response.status();
                    let body_text = response.text().await.unwrap_or_default();
                    last_error = Some(anyhow::anyhow!(
                        "Ollama embedding request failed ({}): {}",
                        status,
                        body_text
                    ));
                }
                Err(e) => {
                    last_error = Some(anyhow::anyhow!("Ollama embedding request error: {}", e));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("Ollama embedding failed")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_normalization() {
        let client = OllamaEmbeddings::new(
            "http://localhost:11434/".to_string(),
            "nomic-embed-text".to_string(),
            768,
        );
        assert_eq!(client.base_url, "http://localhost:11434");
        assert_eq!(client.model_name(), "nomic-embed-text");
    }
}
