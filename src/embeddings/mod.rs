// src/embeddings/mod.rs
// Embedding providers behind one trait.

mod ollama;
mod openai;

pub use self::ollama::OllamaEmbeddings;
pub use self::openai::OpenAiEmbeddings;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::config::EmbedderConfig;
use crate::error::MnemoError;

/// Text-to-vector capability with a fixed dimension.
///
/// Empty text embeds to the zero vector (with a warning) rather than failing,
/// so media-only messages stay storable.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimensions(&self) -> usize;
    fn model_name(&self) -> String;
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Backend-specific embedding implementation
enum EmbeddingBackend {
    OpenAi(OpenAiEmbeddings),
    Ollama(OllamaEmbeddings),
}

/// Embedding client with provider selection from configuration.
pub struct EmbeddingClient {
    backend: EmbeddingBackend,
}

impl EmbeddingClient {
    pub fn from_config(config: &EmbedderConfig) -> Result<Self, MnemoError> {
        match config.provider.as_str() {
            "openai" => {
                let api_key = config.resolve_api_key().ok_or_else(|| {
                    MnemoError::Config(
                        "embedder.api_key missing and OPENAI_API_KEY not set".into(),
                    )
                })?;
                info!(model = %config.model_name, "using OpenAI embeddings");
                Ok(Self {
                    backend: EmbeddingBackend::OpenAi(OpenAiEmbeddings::new(
                        api_key,
                        config.model_name.clone(),
                        config.dimensions,
                        config.base_url.clone(),
                    )),
                })
            }
            "ollama" => {
                let base_url = config
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "http://localhost:11434".to_string());
                let client = OllamaEmbeddings::new(
                    base_url,
                    config.model_name.clone(),
                    config.dimensions,
                );
                info!(
                    model = client.model_name(),
                    dimensions = client.dimensions(),
                    "using Ollama embeddings"
                );
                Ok(Self {
                    backend: EmbeddingBackend::Ollama(client),
                })
            }
            other => Err(MnemoError::Config(format!(
                "unknown embedder provider '{other}' (expected openai or ollama)"
            ))),
        }
    }

    pub fn provider_id(&self) -> &'static str {
        match &self.backend {
            EmbeddingBackend::OpenAi(_) => "openai",
            EmbeddingBackend::Ollama(_) => "ollama",
        }
    }
}

#[async_trait]
impl Embedder for EmbeddingClient {
    fn dimensions(&self) -> usize {
        match &self.backend {
            EmbeddingBackend::OpenAi(c) => c.dimensions(),
            EmbeddingBackend::Ollama(c) => c.dimensions(),
        }
    }

    fn model_name(&self) -> String {
        match &self.backend {
            EmbeddingBackend::OpenAi(c) => c.model_name().to_string(),
            EmbeddingBackend::Ollama(c) => c.model_name().to_string(),
        }
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        match &self.backend {
            EmbeddingBackend::OpenAi(c) => c.embed(text).await,
            EmbeddingBackend::Ollama(c) => c.embed(text).await,
        }
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        match &self.backend {
            EmbeddingBackend::OpenAi(c) => c.embed_batch(texts).await,
            EmbeddingBackend::Ollama(c) => c.embed_batch(texts).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_provider_rejected() {
        let config = EmbedderConfig {
            provider: "cohere".to_string(),
            model_name: "embed-v3".to_string(),
            dimensions: 8,
            api_key: Some("k".to_string()),
            base_url: None,
        };
        assert!(EmbeddingClient::from_config(&config).is_err());
    }

    #[test]
    fn test_ollama_selection_without_key() {
        let config = EmbedderConfig {
            provider: "ollama".to_string(),
            model_name: "nomic-embed-text".to_string(),
            dimensions: 768,
            api_key: None,
            base_url: None,
        };
        let client = EmbeddingClient::from_config(&config).unwrap();
        assert_eq!(client.provider_id(), "ollama");
        assert_eq!(client.dimensions(), 768);
    }
}
