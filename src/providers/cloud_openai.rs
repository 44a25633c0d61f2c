//! Cloud OpenAI-compatible provider — standard chat-completions
//! endpoint with bearer auth.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::collaborators::PromptMessages;
use crate::domain::ModelDescriptor;
use crate::provider::{Provider, ProviderError, ProviderKind, TokenUsage, TranslateResult};

const MAX_TOKENS: u32 = 150;
/// Pinned low per spec.md §4.3/§6 ("temperature ≤ 0.2"); translation
/// wants a deterministic rendering, not creative variation.
const TEMPERATURE: f32 = 0.2;

/// Deadline for establishing the TCP/TLS connection.
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
/// Deadline for reading the response body once headers arrive.
const DEFAULT_READ_TIMEOUT_SECS: u64 = 30;
/// Ceiling on the whole request, connect through body read.
const DEFAULT_TOTAL_TIMEOUT_SECS: u64 = 60;

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat<'a>>,
}

#[derive(Serialize)]
struct ResponseFormat<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<UsageFields>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageOwned,
}

#[derive(Deserialize)]
struct ChatMessageOwned {
    content: String,
}

#[derive(Deserialize)]
struct UsageFields {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct ModelsResponse {
    data: Vec<ModelsEntry>,
}

#[derive(Deserialize)]
struct ModelsEntry {
    id: String,
}

pub struct CloudOpenAiProvider {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    /// Some providers in this family reject `response_format`;
    /// disabled rather than removed so it can be re-enabled per
    /// endpoint without a rebuild.
    use_response_format: bool,
    read_timeout: Duration,
    total_timeout: Duration,
}

impl CloudOpenAiProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> anyhow::Result<Self> {
        let connect_timeout = Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS);
        let read_timeout = Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS);
        let total_timeout = Duration::from_secs(DEFAULT_TOTAL_TIMEOUT_SECS);
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(total_timeout)
            .pool_max_idle_per_host(8)
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
            use_response_format: true,
            read_timeout,
            total_timeout,
        })
    }

    pub fn without_response_format(mut self) -> Self {
        self.use_response_format = false;
        self
    }

    /// Overrides the three deadlines, rebuilding the underlying
    /// `reqwest::Client` so the new connect/total values take effect.
    pub fn with_timeouts(
        mut self,
        connect_timeout: Duration,
        read_timeout: Duration,
        total_timeout: Duration,
    ) -> anyhow::Result<Self> {
        self.client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(total_timeout)
            .pool_max_idle_per_host(8)
            .build()?;
        self.read_timeout = read_timeout;
        self.total_timeout = total_timeout;
        Ok(self)
    }

    fn build_messages(messages: &PromptMessages) -> Vec<ChatMessage<'_>> {
        vec![
            ChatMessage {
                role: "system",
                content: &messages.system,
            },
            ChatMessage {
                role: "user",
                content: &messages.user,
            },
        ]
    }
}

#[async_trait]
impl Provider for CloudOpenAiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::CloudOpenAi
    }

    async fn translate(
        &self,
        messages: &PromptMessages,
        model_id: &str,
    ) -> Result<TranslateResult, ProviderError> {
        let wire_messages = Self::build_messages(messages);
        let body = ChatRequest {
            model: model_id,
            messages: wire_messages,
            temperature: TEMPERATURE,
            max_tokens: MAX_TOKENS,
            response_format: self.use_response_format.then_some(ResponseFormat { kind: "text" }),
        };

        let url = format!("{}/v1/chat/completions", self.base_url);
        let started = Instant::now();

        tokio::time::timeout(self.total_timeout, self.send_and_parse(&url, &body, started))
            .await
            .unwrap_or_else(|_| Err(ProviderError::new(None, "request timed out")))
    }

    fn available(&self) -> bool {
        !self.api_key.is_empty()
    }

    async fn list_models(&self) -> anyhow::Result<Vec<ModelDescriptor>> {
        let url = format!("{}/v1/models", self.base_url);
        let response = self.client.get(&url).bearer_auth(&self.api_key).send().await?;
        let parsed: ModelsResponse = response.json().await?;
        Ok(parsed
            .data
            .into_iter()
            .map(|m| ModelDescriptor {
                id: m.id,
                provider: "cloud_openai".to_string(),
                context_length: 8192,
                suggested_parallelism: 4,
                capabilities: Default::default(),
                available: true,
            })
            .collect())
    }
}

impl CloudOpenAiProvider {
    async fn send_and_parse(
        &self,
        url: &str,
        body: &ChatRequest<'_>,
        started: Instant,
    ) -> Result<TranslateResult, ProviderError> {
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::new(None, e.to_string()).with_source(e.into()))?;

        let status = response.status();
        let latency_ms = started.elapsed().as_millis() as u64;

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::new(Some(status.as_u16()), text));
        }

        let bytes = match tokio::time::timeout(self.read_timeout, response.bytes()).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => return Err(ProviderError::new(None, e.to_string()).with_source(e.into())),
            Err(_) => return Err(ProviderError::new(None, "response body read timed out")),
        };

        let parsed: ChatResponse = serde_json::from_slice(&bytes)
            .map_err(|e| ProviderError::new(None, e.to_string()).with_source(e.into()))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::new(None, "no choices in response"))?;

        let usage = parsed
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        Ok(TranslateResult {
            text: choice.message.content.trim().to_string(),
            usage,
            latency_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_messages_keeps_system_and_user_roles() {
        let messages = PromptMessages {
            system: "system prompt".to_string(),
            user: "hello".to_string(),
        };
        let wire = CloudOpenAiProvider::build_messages(&messages);
        assert_eq!(wire.len(), 2);
        assert_eq!(wire[0].role, "system");
        assert_eq!(wire[1].content, "hello");
    }

    #[test]
    fn available_requires_nonempty_api_key() {
        let provider = CloudOpenAiProvider::new("http://example.test", "").unwrap();
        assert!(!provider.available());
        let provider = CloudOpenAiProvider::new("http://example.test", "sk-test").unwrap();
        assert!(provider.available());
    }

    #[test]
    fn response_parses_with_usage() {
        let raw = r#"{"choices":[{"message":{"content":"hola"}}],"usage":{"prompt_tokens":3,"completion_tokens":1}}"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.choices[0].message.content, "hola");
    }
}
