use anyhow::{Context, Result};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;

use crate::content::{ContentBlock, TextKind, UsageUpdate};
use crate::error::ChatError;
use crate::models::{ModelConfig, ProviderType, TitleResult, Turn};
use crate::registry::ProviderInfo;

pub mod gemini;
pub mod openai;

pub use gemini::GeminiProvider;
pub use openai::OpenAIProvider;

/// Vendor events, already classified into the closed set the aggregator understands.
#[derive(Clone, Debug, PartialEq)]
pub enum RawEvent {
    TextDelta { kind: TextKind, text: String },
    /// The open block must close even if the next delta has the same kind.
    BlockBoundary,
    /// A complete non-text block (tool call, grounding data).
    Block(ContentBlock),
    UsageUpdate(UsageUpdate),
    TerminalSignal { reason: String },
}

impl RawEvent {
    pub fn text(kind: TextKind, text: impl Into<String>) -> Self {
        RawEvent::TextDelta { kind, text: text.into() }
    }
}

// Alias for the stream type adapters return
pub type RawEventStream = Pin<Box<dyn Stream<Item = Result<RawEvent>> + Send>>;

/// Built-in tools a request may enable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tool {
    WebSearch,
}

impl Tool {
    pub fn parse(id: &str) -> Option<Self> {
        match id {
            "internal_web_search" => Some(Tool::WebSearch),
            _ => None,
        }
    }
}

/// Everything an adapter needs to open one streamed turn.
#[derive(Clone, Copy)]
pub struct ChatRequest<'a> {
    pub provider: &'a ProviderInfo,
    pub model: &'a ModelConfig,
    /// Ancestor turns, oldest first.
    pub history: &'a [Turn],
    pub prompt: &'a Turn,
    pub tools: &'a [Tool],
}

// Trait defining the interface for LLM API providers
#[async_trait]
pub trait LLMApiProvider: Send + Sync {
    /// Opens a streamed generation. Errors here mean nothing was generated.
    async fn stream_chat(&self, request: ChatRequest<'_>) -> Result<RawEventStream>;

    /// One structured-output call returning `{title, icon}`.
    async fn generate_title(
        &self,
        provider: &ProviderInfo,
        model: &ModelConfig,
        system_instruction: &str,
        content: &str,
    ) -> Result<TitleResult, ChatError>;
}

/// One adapter per vendor family.
#[derive(Clone)]
pub struct Adapters {
    openai: Arc<dyn LLMApiProvider>,
    gemini: Arc<dyn LLMApiProvider>,
}

impl Adapters {
    pub fn new(openai: Arc<dyn LLMApiProvider>, gemini: Arc<dyn LLMApiProvider>) -> Self {
        Self { openai, gemini }
    }

    /// The real HTTP adapters sharing one connection pool.
    pub fn http() -> Self {
        let client = Client::new();
        Self::new(
            Arc::new(OpenAIProvider::with_client(client.clone())),
            Arc::new(GeminiProvider::with_client(client)),
        )
    }

    pub fn for_type(&self, provider_type: ProviderType) -> Arc<dyn LLMApiProvider> {
        match provider_type {
            ProviderType::OpenAI => self.openai.clone(),
            ProviderType::Gemini => self.gemini.clone(),
        }
    }
}

/// Fails with the vendor's error body when the status is not a success.
pub(crate) async fn ensure_success(
    response: reqwest::Response,
    vendor: &str,
) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let error_body = response
        .text()
        .await
        .unwrap_or_else(|_| "<Failed to read error body>".to_string());
    log::error!("{} API request failed with status {}: {}", vendor, status, error_body);
    Err(anyhow::anyhow!(
        "{} API request failed with status {}: {}",
        vendor,
        status,
        error_body
    ))
}

/// Splits an SSE body into JSON payloads, dropping keep-alives and `[DONE]`.
pub(crate) fn json_events(response: reqwest::Response) -> impl Stream<Item = Result<Value>> + Send {
    response
        .bytes_stream()
        .eventsource()
        .filter_map(|event_result| async move {
            let event = match event_result {
                Ok(event) => event,
                Err(e) => return Some(Err(anyhow::anyhow!("Error reading stream event: {}", e))),
            };
            let data = event.data.trim();
            if data.is_empty() || data == "[DONE]" {
                return None;
            }
            Some(
                serde_json::from_str::<Value>(data)
                    .with_context(|| format!("Failed to parse stream chunk as JSON: {}", data)),
            )
        })
}

/// Parses structured title output; anything that does not fit the schema is a `Schema` error.
pub(crate) fn parse_title(raw: &str) -> Result<TitleResult, ChatError> {
    serde_json::from_str::<TitleResult>(raw.trim())
        .map_err(|e| ChatError::Schema(format!("Title output did not match schema: {}", e)))
}
