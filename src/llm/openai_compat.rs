// src/llm/openai_compat.rs
// Chat-completions client for OpenAI-compatible providers.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use super::Generator;
use crate::config::{GenerationOptions, GeneratorConfig};
use crate::error::MnemoError;

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

/// Client for /chat/completions endpoints.
pub struct OpenAiCompatClient {
    api_key: Option<String>,
    model: String,
    base_url: String,
    defaults: GenerationOptions,
    http_client: reqwest::Client,
}

impl OpenAiCompatClient {
    pub fn from_config(config: &GeneratorConfig) -> Result<Self, MnemoError> {
        let api_key = config.resolve_api_key();
        if api_key.is_none() && config.base_url.contains("api.openai.com") {
            return Err(MnemoError::Config(
                "generator.api_key missing and OPENAI_API_KEY not set".into(),
            ));
        }

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Ok(Self {
            api_key,
            model: config.model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            defaults: config.default_options.clone(),
            http_client,
        })
    }
}

#[async_trait]
impl Generator for OpenAiCompatClient {
    async fn generate(&self, prompt: &str, options: Option<GenerationOptions>) -> Result<String> {
        let options = options.unwrap_or_else(|| self.defaults.clone());
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": options.temperature,
            "max_tokens": options.max_tokens,
            "top_p": options.top_p,
        });

        let url = format!("{}/chat/completions", self.base_url);
        let mut request = self
            .http_client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.context("chat request failed")?;
        if !response.status().is_success() {
            let status = response.status();
            let body_text = response.text().await.unwrap_or_default();
            anyhow::bail!("chat request failed ({}): {}", status, body_text);
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .context("Failed to parse chat response")?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|content| !content.is_empty())
            .ok_or_else(|| anyhow::anyhow!("chat response contained no content"))
    }

    fn model_name(&self) -> String {
        self.model.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base_url: &str, api_key: Option<&str>) -> GeneratorConfig {
        GeneratorConfig {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: api_key.map(str::to_string),
            base_url: base_url.to_string(),
            default_options: GenerationOptions::default(),
        }
    }

    #[test]
    fn test_local_provider_needs_no_key() {
        let client =
            OpenAiCompatClient::from_config(&config("http://localhost:11434/v1", None)).unwrap();
        assert_eq!(client.model_name(), "gpt-4o-mini");
    }

    #[test]
    fn test_base_url_trimmed() {
        let client =
            OpenAiCompatClient::from_config(&config("http://localhost:8000/v1/", Some("k")))
                .unwrap();
        assert_eq!(client.base_url, "http://localhost:8000/v1");
    }
}
