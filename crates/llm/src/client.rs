use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::retry::{CallError, RetryConfig, RetryPolicy};

/// Text-generation backend. Implementations own their own retries.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        history: &[String],
        params: &SamplingParams,
    ) -> Result<String>;
}

/// Sampling parameters for one call.
///
/// Only `temperature`, `max_tokens`, `top_p` and `top_k` change what a
/// deterministic model returns, so only those take part in cache keys.
/// Anything else the backend understands goes into `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f64>,
    pub top_k: Option<u32>,
    pub extra: BTreeMap<String, Value>,
}

impl SamplingParams {
    pub const DEFAULT_TEMPERATURE: f64 = 0.0;
    pub const DEFAULT_MAX_TOKENS: u32 = 4096;
    pub const DEFAULT_TOP_P: f64 = 0.95;
    pub const DEFAULT_TOP_K: u32 = 50;

    pub fn temperature(&self) -> f64 {
        self.temperature.unwrap_or(Self::DEFAULT_TEMPERATURE)
    }

    pub fn max_tokens(&self) -> u32 {
        self.max_tokens.unwrap_or(Self::DEFAULT_MAX_TOKENS)
    }

    pub fn top_p(&self) -> f64 {
        self.top_p.unwrap_or(Self::DEFAULT_TOP_P)
    }

    pub fn top_k(&self) -> u32 {
        self.top_k.unwrap_or(Self::DEFAULT_TOP_K)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
    pub sampling: SamplingParams,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3".to_string(),
            timeout_secs: 120,
            sampling: SamplingParams::default(),
        }
    }
}

#[derive(Clone)]
pub struct OllamaClient {
    base_url: String,
    model: String,
    client: reqwest::Client,
    retry: RetryPolicy,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    options: Map<String, Value>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

impl OllamaClient {
    pub fn new(config: &ModelConfig, retry: &RetryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            client,
            retry: RetryPolicy::from_config(retry),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn chat_once(
        &self,
        prompt: &str,
        history: &[String],
        params: &SamplingParams,
    ) -> Result<String, CallError> {
        let url = format!("{}/api/chat", self.base_url);

        let request = ChatRequest {
            model: &self.model,
            messages: build_messages(prompt, history),
            stream: false,
            options: build_options(params),
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                CallError::Transient(anyhow::Error::new(e).context("Failed to send request to Ollama"))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status));
        }

        let chat: ChatResponse = response.json().await.map_err(|e| {
            let decode = e.is_decode();
            let e = anyhow::Error::new(e).context("Failed to parse Ollama response");
            if decode {
                CallError::Fatal(e)
            } else {
                CallError::Transient(e)
            }
        })?;

        Ok(chat.message.content)
    }
}

/// Throttling and server-side failures may pass; anything else the server
/// rejected will be rejected again.
fn status_error(status: StatusCode) -> CallError {
    let error = anyhow::anyhow!("Ollama request failed: {status}");
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        CallError::Transient(error)
    } else {
        CallError::Fatal(error)
    }
}

#[async_trait]
impl ModelClient for OllamaClient {
    async fn generate(
        &self,
        prompt: &str,
        history: &[String],
        params: &SamplingParams,
    ) -> Result<String> {
        self.retry
            .run("ollama_chat", || self.chat_once(prompt, history, params))
            .await
    }
}

/// History alternates user and assistant turns, oldest first.
fn build_messages<'a>(prompt: &'a str, history: &'a [String]) -> Vec<ChatMessage<'a>> {
    let mut messages: Vec<ChatMessage<'a>> = history
        .iter()
        .enumerate()
        .map(|(i, content)| ChatMessage {
            role: if i % 2 == 0 { "user" } else { "assistant" },
            content,
        })
        .collect();
    messages.push(ChatMessage {
        role: "user",
        content: prompt,
    });
    messages
}

fn build_options(params: &SamplingParams) -> Map<String, Value> {
    let mut options: Map<String, Value> = params
        .extra
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    options.insert("temperature".into(), params.temperature().into());
    options.insert("num_predict".into(), params.max_tokens().into());
    options.insert("top_p".into(), params.top_p().into());
    options.insert("top_k".into(), params.top_k().into());
    options
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_alternates_roles() {
        let history = vec!["q1".to_string(), "a1".to_string()];
        let messages = build_messages("q2", &history);

        let roles: Vec<_> = messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec!["user", "assistant", "user"]);
        assert_eq!(messages[2].content, "q2");
    }

    #[test]
    fn only_throttling_and_server_errors_are_transient() {
        for status in [StatusCode::TOO_MANY_REQUESTS, StatusCode::BAD_GATEWAY, StatusCode::SERVICE_UNAVAILABLE] {
            assert!(matches!(status_error(status), CallError::Transient(_)), "{status}");
        }
        for status in [StatusCode::BAD_REQUEST, StatusCode::UNAUTHORIZED, StatusCode::NOT_FOUND] {
            assert!(matches!(status_error(status), CallError::Fatal(_)), "{status}");
        }
    }

    #[test]
    fn sampling_fields_override_extra() {
        let mut params = SamplingParams {
            temperature: Some(0.7),
            ..Default::default()
        };
        params.extra.insert("temperature".into(), Value::from(1.5));
        params.extra.insert("repeat_penalty".into(), Value::from(1.1));

        let options = build_options(&params);
        assert_eq!(options["temperature"], Value::from(0.7));
        assert_eq!(options["repeat_penalty"], Value::from(1.1));
        assert_eq!(options["num_predict"], Value::from(4096));
    }
}
