// src/llm/mod.rs
// Language model clients for answer generation and query expansion.

mod openai_compat;

pub use openai_compat::OpenAiCompatClient;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::{GenerationOptions, GeneratorConfig};
use crate::error::MnemoError;

/// Opaque text generation capability.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Generate a completion for a prompt. `options` override the
    /// provider-level defaults per call.
    async fn generate(&self, prompt: &str, options: Option<GenerationOptions>) -> Result<String>;

    fn model_name(&self) -> String;
}

/// Build a generator from configuration. Providers speaking the
/// OpenAI-compatible chat API (openai, ollama, local proxies) share one
/// client.
pub fn generator_from_config(
    config: &GeneratorConfig,
) -> Result<std::sync::Arc<dyn Generator>, MnemoError> {
    match config.provider.as_str() {
        "openai" | "openai_compat" | "ollama" => {
            Ok(std::sync::Arc::new(OpenAiCompatClient::from_config(config)?))
        }
        other => Err(MnemoError::Config(format!(
            "unknown generator provider '{other}'"
        ))),
    }
}
