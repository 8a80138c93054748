//! LLM client over an OpenAI-compatible chat-completions endpoint.
//!
//! The dialogue driver owns an [`LlmSession`] holding the rolling
//! conversation; the comment watcher appends user messages to the same
//! session when fresh human comments arrive mid-run.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{AgentError, Result};
use crate::log_warn;

/// LLM endpoint configuration. Per-user overrides from the config resolver
/// merge into the model name and API key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_request_timeout() -> u64 {
    120
}

fn default_max_retries() -> u32 {
    5
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:1234/v1".to_string(),
            model: "llama-3.2-1b-instruct".to_string(),
            api_key: None,
            max_tokens: None,
            temperature: None,
            request_timeout_seconds: default_request_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

/// One message of the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Token accounting for one completion or a whole session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

pub struct LlmClient {
    http: reqwest::Client,
    config: LlmConfig,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()?;
        Ok(Self { http, config })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// One completion over the given conversation, with at most
    /// `max_retries` attempts on transport failure.
    pub async fn complete(&self, messages: &[ChatMessage]) -> Result<(String, TokenUsage)> {
        let mut body = json!({
            "model": self.config.model,
            "messages": messages,
        });
        if let Some(max_tokens) = self.config.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = self.config.temperature {
            body["temperature"] = json!(temperature);
        }

        let url = format!("{}/chat/completions", self.config.base_url);
        let mut last_error = String::new();
        for attempt in 1..=self.config.max_retries {
            let mut request = self.http.post(&url).json(&body);
            if let Some(key) = &self.config.api_key {
                request = request.bearer_auth(key);
            }
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    let reply: Value = response.json().await?;
                    return parse_completion(&reply);
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    last_error = format!("status {status}");
                    // Client errors will not improve on retry.
                    if status < 500 && status != 429 {
                        break;
                    }
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }
            log_warn!(
                "LLM attempt {attempt}/{} failed: {last_error}",
                self.config.max_retries
            );
        }
        Err(AgentError::Llm(last_error))
    }
}

fn parse_completion(reply: &Value) -> Result<(String, TokenUsage)> {
    let content = reply
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| AgentError::Llm("completion had no message content".to_string()))?
        .to_string();

    let usage = reply.get("usage").map_or(TokenUsage::default(), |u| {
        let field = |name: &str| u.get(name).and_then(Value::as_i64).unwrap_or(0);
        TokenUsage {
            prompt_tokens: field("prompt_tokens"),
            completion_tokens: field("completion_tokens"),
            total_tokens: field("total_tokens"),
        }
    });

    Ok((content, usage))
}

/// A live conversation: the rolling message list plus cumulative usage.
pub struct LlmSession {
    client: Arc<LlmClient>,
    pub messages: Vec<ChatMessage>,
    pub usage: TokenUsage,
    pub call_count: u32,
}

impl LlmSession {
    pub fn new(client: Arc<LlmClient>) -> Self {
        Self {
            client,
            messages: Vec::new(),
            usage: TokenUsage::default(),
            call_count: 0,
        }
    }

    pub fn send_system(&mut self, content: impl Into<String>) {
        self.messages.push(ChatMessage::system(content));
    }

    pub fn send_user(&mut self, content: impl Into<String>) {
        self.messages.push(ChatMessage::user(content));
    }

    /// Run one completion, record the assistant reply on the conversation,
    /// and return it.
    pub async fn complete(&mut self) -> Result<String> {
        let (reply, usage) = self.client.complete(&self.messages).await?;
        self.usage.add(usage);
        self.call_count += 1;
        self.messages.push(ChatMessage::assistant(reply.clone()));
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_completion_reads_content_and_usage() {
        let reply = json!({
            "choices": [{"message": {"role": "assistant", "content": "hello"}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        });
        let (content, usage) = parse_completion(&reply).expect("parse");
        assert_eq!(content, "hello");
        assert_eq!(usage.total_tokens, 15);
    }

    #[test]
    fn parse_completion_tolerates_missing_usage() {
        let reply = json!({"choices": [{"message": {"content": "x"}}]});
        let (_, usage) = parse_completion(&reply).expect("parse");
        assert_eq!(usage, TokenUsage::default());
    }

    #[test]
    fn session_accumulates_messages() {
        let client = Arc::new(LlmClient::new(LlmConfig::default()).expect("client"));
        let mut session = LlmSession::new(client);
        session.send_system("sys");
        session.send_user("hi");
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].role, "system");
        assert_eq!(session.messages[1].role, "user");
    }
}
