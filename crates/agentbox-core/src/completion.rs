//! HTTP completion provider
//!
//! Talks to an OpenAI-compatible chat-completions endpoint. Used by "ai"
//! low-code steps when a provider is configured.

use agentbox_sandbox::completion::{Completion, CompletionError, CompletionService};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

/// Configuration for the completion provider
#[derive(Debug, Clone)]
pub struct CompletionConfig {
    pub api_key: String,
    pub model: String,
    pub api_url: String,
    pub temperature: f64,
}

impl CompletionConfig {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            model: "google/gemini-3-flash-preview".to_string(),
            api_url: "https://openrouter.ai/api/v1/chat/completions".to_string(),
            temperature: 0.7,
        }
    }

    /// `AGENTBOX_COMPLETION_API_KEY` is required; model and URL are optional
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("AGENTBOX_COMPLETION_API_KEY").ok().filter(|k| !k.is_empty())?;
        let mut config = Self::new(api_key);
        if let Ok(model) = std::env::var("AGENTBOX_COMPLETION_MODEL") {
            config.model = model;
        }
        if let Ok(url) = std::env::var("AGENTBOX_COMPLETION_URL") {
            config.api_url = url;
        }
        Some(config)
    }
}

pub struct HttpCompletionService {
    config: CompletionConfig,
    client: reqwest::Client,
}

impl HttpCompletionService {
    pub fn new(config: CompletionConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn request_body(&self, system_prompt: &str, user_prompt: &str) -> Value {
        json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt},
            ],
            "temperature": self.config.temperature,
        })
    }
}

#[async_trait]
impl CompletionService for HttpCompletionService {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<Completion, CompletionError> {
        debug!(model = %self.config.model, "Requesting completion");
        let resp = self
            .client
            .post(&self.config.api_url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .json(&self.request_body(system_prompt, user_prompt))
            .send()
            .await
            .map_err(|e| CompletionError::Request(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CompletionError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| CompletionError::Response(e.to_string()))?;
        parse_response(&json)
    }
}

fn parse_response(json: &Value) -> Result<Completion, CompletionError> {
    if let Some(err) = json.get("error") {
        let msg = err["message"].as_str().unwrap_or("Unknown API error");
        return Err(CompletionError::Response(msg.to_string()));
    }

    let text = json["choices"][0]["message"]["content"]
        .as_str()
        .ok_or_else(|| CompletionError::Response("missing choices[0].message.content".to_string()))?
        .to_string();
    let tokens_used = json["usage"]["total_tokens"].as_u64().unwrap_or(0);
    Ok(Completion { text, tokens_used })
}
