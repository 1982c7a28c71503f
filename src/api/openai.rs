//! OpenAI Responses API adapter.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{ensure_success, json_events, parse_title, ChatRequest, LLMApiProvider, RawEvent, RawEventStream, Tool};
use crate::content::{message_texts, ContentBlock, FunctionCall, TextKind, UsageUpdate};
use crate::error::ChatError;
use crate::models::{ModelConfig, Role, TitleResult};
use crate::registry::ProviderInfo;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Serialize, Debug)]
struct ResponsesRequest<'a> {
    model: &'a str,
    input: Vec<InputMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning: Option<ReasoningParam>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolParam>,
    stream: bool,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
struct InputMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize, Debug)]
struct ReasoningParam {
    summary: &'static str,
}

#[derive(Serialize, Debug)]
struct ToolParam {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize, Debug)]
struct TitleRequest<'a> {
    model: &'a str,
    instructions: &'a str,
    input: &'a str,
    text: Value,
}

// Non-streaming response body, reduced to what title generation reads
#[derive(Deserialize, Debug)]
struct ResponsesOutput {
    #[serde(default)]
    output: Vec<OutputItem>,
}

#[derive(Deserialize, Debug)]
struct OutputItem {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: Vec<OutputContent>,
}

#[derive(Deserialize, Debug)]
struct OutputContent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

impl ResponsesOutput {
    fn output_text(&self) -> String {
        self.output
            .iter()
            .filter(|item| item.kind == "message")
            .flat_map(|item| item.content.iter())
            .filter(|content| content.kind == "output_text")
            .map(|content| content.text.as_str())
            .collect()
    }
}

pub struct OpenAIProvider {
    client: Client,
}

impl Default for OpenAIProvider {
    fn default() -> Self {
        Self::with_client(Client::new())
    }
}

impl OpenAIProvider {
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn endpoint(provider: &ProviderInfo) -> String {
        let base = if provider.base_url.is_empty() {
            DEFAULT_BASE_URL
        } else {
            provider.base_url.as_str()
        };
        format!("{}/responses", base.trim_end_matches('/'))
    }
}

fn input_role(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::System => "system",
    }
}

/// Vendor input: one message per replayed `message` block, then the new prompt.
fn build_input<'a>(request: &ChatRequest<'a>) -> Vec<InputMessage<'a>> {
    request
        .history
        .iter()
        .chain(std::iter::once(request.prompt))
        .flat_map(|turn| {
            let role = input_role(turn.role);
            message_texts(&turn.content).map(move |content| InputMessage { role, content })
        })
        .collect()
}

fn build_tools(tools: &[Tool]) -> Vec<ToolParam> {
    tools
        .iter()
        .map(|tool| match tool {
            Tool::WebSearch => ToolParam { kind: "web_search" },
        })
        .collect()
}

fn title_format() -> Value {
    json!({
        "format": {
            "type": "json_schema",
            "name": "title_and_icon",
            "description": "Generate title and icon for a conversation",
            "strict": true,
            "schema": {
                "type": "object",
                "properties": {
                    "title": { "type": "string" },
                    "icon": { "type": "string" }
                },
                "additionalProperties": false,
                "required": ["title", "icon"]
            }
        }
    })
}

fn count(value: &Value, pointer: &str) -> Option<u32> {
    value
        .pointer(pointer)
        .and_then(Value::as_u64)
        .map(|v| v.min(u32::MAX as u64) as u32)
}

fn usage_update(usage: &Value) -> UsageUpdate {
    UsageUpdate {
        prompt_token_count: count(usage, "/input_tokens"),
        cached_token_count: count(usage, "/input_tokens_details/cached_tokens"),
        reasoning_token_count: count(usage, "/output_tokens_details/reasoning_tokens"),
        response_token_count: count(usage, "/output_tokens"),
        ..Default::default()
    }
}

fn text_delta(kind: TextKind, event: &Value) -> Vec<Result<RawEvent>> {
    match event.get("delta").and_then(Value::as_str) {
        Some(delta) if !delta.is_empty() => vec![Ok(RawEvent::text(kind, delta))],
        _ => Vec::new(),
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

/// A finished output item: tool calls become blocks, anything else closes the open block.
fn output_item_done(item: Option<&Value>) -> RawEvent {
    let Some(item) = item else {
        return RawEvent::BlockBoundary;
    };
    match item.get("type").and_then(Value::as_str) {
        Some("web_search_call") => RawEvent::Block(ContentBlock::FunctionCall(FunctionCall {
            id: str_field(item, "id"),
            name: "web_search".to_string(),
            arguments: item.get("action").cloned().unwrap_or_default(),
            status: str_field(item, "status"),
        })),
        Some("function_call") => {
            let arguments = item
                .get("arguments")
                .and_then(Value::as_str)
                .map(|raw| serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())))
                .unwrap_or_default();
            RawEvent::Block(ContentBlock::FunctionCall(FunctionCall {
                id: str_field(item, "call_id"),
                name: str_field(item, "name").unwrap_or_default(),
                arguments,
                status: str_field(item, "status"),
            }))
        }
        _ => RawEvent::BlockBoundary,
    }
}

/// Maps one Responses API stream event to aggregator events.
pub(crate) fn classify_event(event: &Value) -> Vec<Result<RawEvent>> {
    let event_type = event.get("type").and_then(Value::as_str).unwrap_or_default();
    match event_type {
        "response.output_text.delta" => text_delta(TextKind::Message, event),
        "response.reasoning_summary_text.delta" => text_delta(TextKind::Reasoning, event),
        // Separate consecutive summary parts inside one reasoning block
        "response.reasoning_summary_part.done" => vec![Ok(RawEvent::text(TextKind::Reasoning, "\n\n"))],
        "response.output_item.done" => vec![Ok(output_item_done(event.get("item")))],
        "response.completed" | "response.incomplete" => {
            let response = event.get("response");
            let mut events = Vec::new();
            if let Some(usage) = response.and_then(|r| r.get("usage")) {
                events.push(Ok(RawEvent::UsageUpdate(usage_update(usage))));
            }
            let reason = response
                .and_then(|r| r.get("status"))
                .and_then(Value::as_str)
                .unwrap_or("completed")
                .to_string();
            events.push(Ok(RawEvent::TerminalSignal { reason }));
            events
        }
        "response.failed" | "error" => {
            let message = event
                .pointer("/response/error/message")
                .or_else(|| event.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            vec![Err(anyhow::anyhow!("OpenAI stream failed: {}", message))]
        }
        other => {
            log::trace!("Ignoring OpenAI stream event '{}'", other);
            Vec::new()
        }
    }
}

#[async_trait]
impl LLMApiProvider for OpenAIProvider {
    async fn stream_chat(&self, request: ChatRequest<'_>) -> Result<RawEventStream> {
        let url = Self::endpoint(request.provider);
        log::info!(
            "Sending STREAM request to OpenAI compatible API: {} using model: {}",
            url,
            request.model.id
        );

        let body = ResponsesRequest {
            model: &request.model.id,
            input: build_input(&request),
            reasoning: request
                .model
                .reasoning
                .then_some(ReasoningParam { summary: "auto" }),
            tools: build_tools(request.tools),
            stream: true,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&request.provider.api_key)
            .json(&body)
            .send()
            .await
            .context("Failed to send stream request to OpenAI API")?;
        let response = ensure_success(response, "OpenAI").await?;

        let events = json_events(response).flat_map(|item| {
            stream::iter(match item {
                Ok(event) => classify_event(&event),
                Err(e) => vec![Err(e)],
            })
        });
        Ok(Box::pin(events))
    }

    async fn generate_title(
        &self,
        provider: &ProviderInfo,
        model: &ModelConfig,
        system_instruction: &str,
        content: &str,
    ) -> Result<TitleResult, ChatError> {
        let body = TitleRequest {
            model: &model.id,
            instructions: system_instruction,
            input: content,
            text: title_format(),
        };

        let response = self
            .client
            .post(Self::endpoint(provider))
            .bearer_auth(&provider.api_key)
            .json(&body)
            .send()
            .await
            .context("Failed to send title request to OpenAI API")
            .map_err(ChatError::VendorTransport)?;
        let response = ensure_success(response, "OpenAI")
            .await
            .map_err(ChatError::VendorTransport)?;

        let output: ResponsesOutput = response
            .json()
            .await
            .map_err(|e| ChatError::Schema(format!("Unexpected OpenAI response body: {}", e)))?;
        parse_title(&output.output_text())
    }
}
