// src/llm.rs

use crate::config::LlmConfig;
use crate::error::LlmError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// One prompt to send to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
}

/// Raw model output plus token accounting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub content: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

/// Anything that can answer a chat completion.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError>;
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// OpenAI-compatible `/chat/completions` client.
pub struct ChatClient {
    http: Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl ChatClient {
    /// Reads the API key from the environment variable named in config.
    pub fn from_config(cfg: &LlmConfig) -> Result<Self, LlmError> {
        let api_key = std::env::var(&cfg.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| LlmError::MissingApiKey(cfg.api_key_env.clone()))?;
        let http = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()?;
        info!(url = %cfg.base_url, model = %cfg.model, "Using chat completion endpoint");
        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            model: cfg.model.clone(),
            api_key,
        })
    }
}

#[async_trait]
impl CompletionClient for ChatClient {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError> {
        let body = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: request.system,
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: request.prompt,
                },
            ],
            temperature: 0.0,
            max_tokens: request.max_tokens,
        };

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api { status, body });
        }

        let chat: ChatResponse = response.json().await?;
        into_completion(chat)
    }
}

fn into_completion(chat: ChatResponse) -> Result<Completion, LlmError> {
    let usage = chat.usage.unwrap_or_default();
    let content = chat
        .choices
        .into_iter()
        .next()
        .map(|c| c.message.content)
        .filter(|c| !c.trim().is_empty())
        .ok_or(LlmError::EmptyResponse)?;
    debug!(
        tokens_in = usage.prompt_tokens,
        tokens_out = usage.completion_tokens,
        "completion received"
    );
    Ok(Completion {
        content,
        tokens_in: usage.prompt_tokens,
        tokens_out: usage.completion_tokens,
    })
}

/// Pull the JSON object out of a model reply that may be wrapped in markdown
/// fences or preceded by reasoning text.
pub fn extract_json_object(content: &str) -> Result<&str, LlmError> {
    let s = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let start = s
        .find('{')
        .ok_or_else(|| LlmError::Parse("no '{' in response".to_string()))?;
    let end = s
        .rfind('}')
        .ok_or_else(|| LlmError::Parse("no '}' in response".to_string()))?;
    if end <= start {
        return Err(LlmError::Parse("malformed JSON object".to_string()));
    }
    Ok(&s[start..=end])
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_from_fenced_reply() {
        let reply = "```json\n{\"account_number\": \"123\"}\n```";
        assert_eq!(extract_json_object(reply).unwrap(), "{\"account_number\": \"123\"}");

        let reply = "<think>checking the bill</think> {\"a\": {\"b\": 1}} trailing";
        assert_eq!(extract_json_object(reply).unwrap(), "{\"a\": {\"b\": 1}}");

        assert!(matches!(extract_json_object("no json here"), Err(LlmError::Parse(_))));
        assert!(matches!(extract_json_object("} {"), Err(LlmError::Parse(_))));
    }

    #[test]
    fn test_usage_is_read_from_response() {
        let chat: ChatResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"{}"}}],
                "usage":{"prompt_tokens":812,"completion_tokens":64,"total_tokens":876}}"#,
        )
        .unwrap();
        let c = into_completion(chat).unwrap();
        assert_eq!((c.tokens_in, c.tokens_out), (812, 64));
    }

    #[test]
    fn test_empty_choices_is_error() {
        let chat: ChatResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert!(matches!(into_completion(chat), Err(LlmError::EmptyResponse)));
    }

    #[test]
    fn test_missing_api_key() {
        let cfg = LlmConfig {
            api_key_env: "BILL_INTAKE_TEST_UNSET_KEY".to_string(),
            ..LlmConfig::default()
        };
        assert!(matches!(
            ChatClient::from_config(&cfg),
            Err(LlmError::MissingApiKey(var)) if var == "BILL_INTAKE_TEST_UNSET_KEY"
        ));
    }
}
