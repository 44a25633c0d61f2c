//! Local-HTTP provider — Ollama-compatible `/api/chat`.
//!
//! Accepts either a ChatCompletions-shaped response
//! (`choices[0].message.content`) or the legacy Ollama
//! `{"message": {"content": ...}}`/`{"response": ...}` shapes, since
//! local servers vary in which one they emit.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::collaborators::PromptMessages;
use crate::domain::ModelDescriptor;
use crate::provider::{Provider, ProviderError, ProviderKind, TokenUsage, TranslateResult};

const TEMPERATURE: f32 = 0.1;

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
    stream: bool,
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
struct ChatCompletionsResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<UsageFields>,
}

#[derive(Deserialize)]
struct UsageFields {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

/// Legacy Ollama-style response: either a top-level `message.content`
/// or a bare `response` string.
#[derive(Deserialize)]
struct LegacyResponse {
    #[serde(default)]
    message: Option<ChatMessageOwned>,
    #[serde(default)]
    response: Option<String>,
}

#[derive(Deserialize)]
struct ModelsListResponse {
    #[serde(default)]
    models: Vec<ModelsListEntry>,
}

#[derive(Deserialize)]
struct ModelsListEntry {
    name: String,
}

pub struct LocalHttpProvider {
    base_url: String,
    client: reqwest::Client,
    read_timeout: Duration,
    total_timeout: Duration,
}

impl LocalHttpProvider {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let connect_timeout = Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS);
        let read_timeout = Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS);
        let total_timeout = Duration::from_secs(DEFAULT_TOTAL_TIMEOUT_SECS);
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(total_timeout)
            .pool_max_idle_per_host(4)
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            read_timeout,
            total_timeout,
        })
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
            .pool_max_idle_per_host(4)
            .build()?;
        self.read_timeout = read_timeout;
        self.total_timeout = total_timeout;
        Ok(self)
    }
}

#[async_trait]
impl Provider for LocalHttpProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::LocalHttp
    }

    async fn translate(
        &self,
        messages: &PromptMessages,
        model_id: &str,
    ) -> Result<TranslateResult, ProviderError> {
        let body = ChatRequest {
            model: model_id,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &messages.system,
                },
                ChatMessage {
                    role: "user",
                    content: &messages.user,
                },
            ],
            temperature: TEMPERATURE,
            stream: false,
        };

        let url = format!("{}/api/chat", self.base_url);
        let started = Instant::now();

        tokio::time::timeout(self.total_timeout, self.send_and_parse(&url, &body, started))
            .await
            .unwrap_or_else(|_| Err(ProviderError::new(None, "request timed out")))
    }

    fn available(&self) -> bool {
        true
    }

    async fn list_models(&self) -> anyhow::Result<Vec<ModelDescriptor>> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self.client.get(&url).send().await?;
        let parsed: ModelsListResponse = response.json().await?;
        Ok(parsed
            .models
            .into_iter()
            .map(|m| ModelDescriptor {
                id: m.name,
                provider: "local_http".to_string(),
                context_length: 4096,
                suggested_parallelism: 2,
                capabilities: Default::default(),
                available: true,
            })
            .collect())
    }
}

impl LocalHttpProvider {
    async fn send_and_parse(
        &self,
        url: &str,
        body: &ChatRequest<'_>,
        started: Instant,
    ) -> Result<TranslateResult, ProviderError> {
        let response = self
            .client
            .post(url)
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

        if let Ok(chat) = serde_json::from_slice::<ChatCompletionsResponse>(&bytes) {
            if let Some(choice) = chat.choices.into_iter().next() {
                let usage = chat
                    .usage
                    .map(|u| TokenUsage {
                        prompt_tokens: u.prompt_tokens,
                        completion_tokens: u.completion_tokens,
                    })
                    .unwrap_or_default();
                return Ok(TranslateResult {
                    text: choice.message.content.trim().to_string(),
                    usage,
                    latency_ms,
                });
            }
        }

        let legacy: LegacyResponse = serde_json::from_slice(&bytes)
            .map_err(|e| ProviderError::new(None, format!("unrecognized response shape: {e}")))?;

        let text = legacy
            .message
            .map(|m| m.content)
            .or(legacy.response)
            .ok_or_else(|| ProviderError::new(None, "response had neither message nor response field"))?;

        Ok(TranslateResult {
            text: text.trim().to_string(),
            usage: TokenUsage::default(),
            latency_ms,
        })
    }
}
