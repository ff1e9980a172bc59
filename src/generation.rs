//! Text-generation capability used by query expansion and re-ranking.
//!
//! The orchestrator only needs "prompt in, text out". [`OpenAIGenerator`]
//! speaks the OpenAI-compatible `/v1/chat/completions` protocol, which also
//! covers local gateways that mimic it.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::GenerationConfig;
use crate::http;

/// Per-call generation settings.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub system: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            system: None,
            temperature: 0.2,
            max_tokens: 512,
        }
    }
}

/// A prompt-to-text model.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn model_name(&self) -> &str;
    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<String>;
}

/// Whether a text generator can be used for this process.
#[derive(Clone)]
pub enum GenerationCapability {
    Available(Arc<dyn TextGenerator>),
    Unavailable { reason: String },
}

impl std::fmt::Debug for GenerationCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GenerationCapability::Available(g) => f
                .debug_tuple("Available")
                .field(&g.model_name())
                .finish(),
            GenerationCapability::Unavailable { reason } => f
                .debug_struct("Unavailable")
                .field("reason", reason)
                .finish(),
        }
    }
}

impl GenerationCapability {
    pub fn available(generator: Arc<dyn TextGenerator>) -> Self {
        GenerationCapability::Available(generator)
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        GenerationCapability::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn from_config(config: &GenerationConfig) -> Self {
        match config.provider.as_str() {
            "disabled" => Self::unavailable("generation provider is disabled"),
            "openai" => match OpenAIGenerator::new(config) {
                Ok(g) => {
                    tracing::info!(model = g.model_name(), "generation provider ready");
                    Self::available(Arc::new(g))
                }
                Err(e) => {
                    tracing::warn!(error = %e, "generation provider unavailable");
                    Self::unavailable(e.to_string())
                }
            },
            other => Self::unavailable(format!("unknown generation provider: {}", other)),
        }
    }

    pub fn generator(&self) -> Option<&Arc<dyn TextGenerator>> {
        match self {
            GenerationCapability::Available(g) => Some(g),
            GenerationCapability::Unavailable { .. } => None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.generator().is_some()
    }
}

/// Chat-completions client for OpenAI and compatible servers.
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAIGenerator {
    model: String,
    url: String,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generation.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());

        Ok(Self {
            model,
            url,
            api_key,
            max_retries: config.max_retries,
            client: http::build_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl TextGenerator for OpenAIGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<String> {
        let mut messages = Vec::new();
        if let Some(system) = &options.system {
            messages.push(serde_json::json!({"role": "system", "content": system}));
        }
        messages.push(serde_json::json!({"role": "user", "content": prompt}));

        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": options.temperature,
            "max_tokens": options.max_tokens,
        });

        let json = http::post_json_with_retry(
            &self.client,
            &format!("{}/v1/chat/completions", self.url.trim_end_matches('/')),
            Some(&self.api_key),
            &body,
            self.max_retries,
            "OpenAI",
        )
        .await?;

        if let Some(usage) = json.get("usage") {
            tracing::debug!(
                model = %self.model,
                prompt_tokens = usage.get("prompt_tokens").and_then(|v| v.as_u64()),
                completion_tokens = usage.get("completion_tokens").and_then(|v| v.as_u64()),
                "chat completion usage"
            );
        }

        parse_chat_response(&json)
    }
}

/// Extract `choices[0].message.content`.
fn parse_chat_response(json: &serde_json::Value) -> Result<String> {
    let content = json
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str());

    match content {
        Some(text) => Ok(text.to_string()),
        None => bail!("Invalid chat response: missing choices[0].message.content"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chat_response() {
        let json = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "[1, 0]"}}]
        });
        assert_eq!(parse_chat_response(&json).unwrap(), "[1, 0]");
    }

    #[test]
    fn test_parse_chat_response_missing_content() {
        let json = serde_json::json!({"choices": []});
        assert!(parse_chat_response(&json).is_err());
    }

    #[test]
    fn test_disabled_config_is_unavailable() {
        let cap = GenerationCapability::from_config(&GenerationConfig::default());
        assert!(!cap.is_available());
    }
}
