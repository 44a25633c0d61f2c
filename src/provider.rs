//! Provider Clients (C3) — the `Provider` trait and registry.
//!
//! The engine holds a `Arc<dyn Provider>` and never inspects the
//! concrete type; dispatch across backends happens once, at registry
//! lookup time, per the Design Notes' "no duck-typed branches on
//! `llm_type`" directive.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::collaborators::PromptMessages;
use crate::domain::ModelDescriptor;
use crate::error::ErrorClass;

/// A typed failure from a provider call, with the original cause
/// attached for logging.
#[derive(Debug)]
pub struct ProviderError {
    pub class: ErrorClass,
    pub status: Option<u16>,
    pub message: String,
    pub source: Option<anyhow::Error>,
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.class, self.message)
    }
}

impl std::error::Error for ProviderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

impl ProviderError {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        let message = message.into();
        let class = ErrorClass::classify(status, &message);
        Self {
            class,
            status,
            message,
            source: None,
        }
    }

    pub fn with_source(mut self, source: anyhow::Error) -> Self {
        self.source = Some(source);
        self
    }
}

/// Token usage reported by (or estimated for) a single provider call.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Result of a single successful provider call.
#[derive(Debug, Clone)]
pub struct TranslateResult {
    pub text: String,
    pub usage: TokenUsage,
    pub latency_ms: u64,
}

/// A single capability: turn an already-built `PromptMessages` pair
/// into a translated string. The message pair comes from
/// `PromptSource::build`; the provider maps `system`/`user` onto its own
/// wire format and never inspects the engine's notion of source text or
/// context window.
#[async_trait]
pub trait Provider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn translate(
        &self,
        messages: &PromptMessages,
        model_id: &str,
    ) -> Result<TranslateResult, ProviderError>;

    fn available(&self) -> bool {
        true
    }

    async fn list_models(&self) -> anyhow::Result<Vec<ModelDescriptor>>;
}

/// Identifies a provider backend. Additional providers are additive:
/// adding a variant plus a registry entry never changes engine code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    LocalHttp,
    CloudOpenAi,
}

/// Dispatches by `ProviderKind` to a concrete `Provider`
/// implementation. The engine only ever sees this registry and the
/// `Provider` trait object it returns.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: ProviderKind, provider: Arc<dyn Provider>) {
        self.providers.insert(kind, provider);
    }

    pub fn get(&self, kind: ProviderKind) -> Option<Arc<dyn Provider>> {
        self.providers.get(&kind).cloned()
    }
}
