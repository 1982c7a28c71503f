//! Gemini `streamGenerateContent` adapter.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{ensure_success, json_events, parse_title, ChatRequest, LLMApiProvider, RawEvent, RawEventStream, Tool};
use crate::content::{message_texts, ContentBlock, FunctionCall, TextKind, UsageUpdate};
use crate::error::ChatError;
use crate::models::{ModelConfig, Role, TitleResult, Turn};
use crate::registry::ProviderInfo;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

// --- Request types ---

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

impl Content {
    fn text(role: Option<&str>, texts: Vec<String>) -> Self {
        Content {
            role: role.map(str::to_string),
            parts: texts
                .into_iter()
                .map(|text| Part {
                    text: Some(text),
                    ..Default::default()
                })
                .collect(),
        }
    }
}

// --- Response types ---

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    thought: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    thought_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<GeminiFunctionCall>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct GeminiFunctionCall {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct StreamChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
    #[serde(default)]
    grounding_metadata: Option<Value>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    prompt_token_count: Option<u32>,
    candidates_token_count: Option<u32>,
    thoughts_token_count: Option<u32>,
    cached_content_token_count: Option<u32>,
    tool_use_prompt_token_count: Option<u32>,
}

impl From<GeminiUsage> for UsageUpdate {
    fn from(usage: GeminiUsage) -> Self {
        UsageUpdate {
            prompt_token_count: usage.prompt_token_count,
            reasoning_token_count: usage.thoughts_token_count,
            response_token_count: usage.candidates_token_count,
            tool_use_token_count: usage.tool_use_prompt_token_count,
            cached_token_count: usage.cached_content_token_count,
            ..Default::default()
        }
    }
}

impl StreamChunk {
    fn text(&self) -> String {
        self.candidates
            .iter()
            .filter_map(|c| c.content.as_ref())
            .flat_map(|content| content.parts.iter())
            .filter(|part| part.thought != Some(true))
            .filter_map(|part| part.text.as_deref())
            .collect()
    }
}

pub struct GeminiProvider {
    client: Client,
}

impl Default for GeminiProvider {
    fn default() -> Self {
        Self::with_client(Client::new())
    }
}

impl GeminiProvider {
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn endpoint(provider: &ProviderInfo, model: &str, method: &str) -> String {
        let base = if provider.base_url.is_empty() {
            DEFAULT_BASE_URL
        } else {
            provider.base_url.as_str()
        };
        format!("{}/v1beta/models/{}:{}", base.trim_end_matches('/'), model, method)
    }
}

/// Splits turns into vendor contents and the system instruction.
fn build_contents<'a>(turns: impl Iterator<Item = &'a Turn>) -> (Vec<Content>, Option<Content>) {
    let mut contents = Vec::new();
    let mut system_texts = Vec::new();
    for turn in turns {
        let texts: Vec<String> = message_texts(&turn.content).map(str::to_string).collect();
        if texts.is_empty() {
            continue;
        }
        match turn.role {
            Role::System => system_texts.extend(texts),
            Role::User => contents.push(Content::text(Some("user"), texts)),
            Role::Assistant => contents.push(Content::text(Some("model"), texts)),
        }
    }
    let system_instruction = (!system_texts.is_empty()).then(|| Content::text(None, system_texts));
    (contents, system_instruction)
}

fn build_tools(tools: &[Tool]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| match tool {
            Tool::WebSearch => json!({ "googleSearch": {} }),
        })
        .collect()
}

/// Maps one stream chunk to aggregator events, in emission order.
fn classify_chunk(chunk: StreamChunk) -> Vec<Result<RawEvent>> {
    let mut events = Vec::new();
    let mut finish_reason = None;

    for candidate in chunk.candidates {
        for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
            if let Some(call) = part.function_call {
                events.push(RawEvent::Block(ContentBlock::FunctionCall(FunctionCall {
                    id: call.id,
                    name: call.name,
                    arguments: call.args,
                    status: None,
                })));
            } else if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                let kind = if part.thought == Some(true) {
                    TextKind::Reasoning
                } else {
                    TextKind::Message
                };
                events.push(RawEvent::text(kind, text));
            }
            if let Some(signature) = part.thought_signature {
                events.push(RawEvent::UsageUpdate(UsageUpdate {
                    thought_signature: Some(signature),
                    ..Default::default()
                }));
            }
        }
        // Repeated on many chunks; the aggregator attaches the last one as a block at the end
        if let Some(grounding) = candidate.grounding_metadata {
            events.push(RawEvent::UsageUpdate(UsageUpdate {
                google_grounding_data: Some(grounding),
                ..Default::default()
            }));
        }
        if candidate.finish_reason.is_some() {
            finish_reason = candidate.finish_reason;
        }
    }

    if let Some(usage) = chunk.usage_metadata {
        events.push(RawEvent::UsageUpdate(usage.into()));
    }
    if let Some(reason) = finish_reason {
        events.push(RawEvent::TerminalSignal { reason });
    }
    events.into_iter().map(Ok).collect()
}

fn title_generation_config() -> Value {
    json!({
        "responseMimeType": "application/json",
        "responseSchema": {
            "type": "OBJECT",
            "properties": {
                "icon": { "type": "STRING" },
                "title": { "type": "STRING" }
            },
            "required": ["icon", "title"],
            "propertyOrdering": ["icon", "title"]
        }
    })
}

#[async_trait]
impl LLMApiProvider for GeminiProvider {
    async fn stream_chat(&self, request: ChatRequest<'_>) -> Result<RawEventStream> {
        let url = format!(
            "{}?alt=sse",
            Self::endpoint(request.provider, &request.model.id, "streamGenerateContent")
        );
        log::info!("Sending STREAM request to Gemini API using model: {}", request.model.id);

        let (contents, system_instruction) =
            build_contents(request.history.iter().chain(std::iter::once(request.prompt)));
        let body = GenerateContentRequest {
            contents,
            system_instruction,
            tools: build_tools(request.tools),
            generation_config: request
                .model
                .reasoning
                .then(|| json!({ "thinkingConfig": { "includeThoughts": true } })),
        };

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &request.provider.api_key)
            .json(&body)
            .send()
            .await
            .context("Failed to send stream request to Gemini API")?;
        let response = ensure_success(response, "Gemini").await?;

        let events = json_events(response).flat_map(|item| {
            let events = match item.and_then(|value| {
                serde_json::from_value::<StreamChunk>(value).context("Failed to decode Gemini stream chunk")
            }) {
                Ok(chunk) => classify_chunk(chunk),
                Err(e) => vec![Err(e)],
            };
            stream::iter(events)
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
        let body = GenerateContentRequest {
            contents: vec![Content::text(Some("user"), vec![content.to_string()])],
            system_instruction: Some(Content::text(None, vec![system_instruction.to_string()])),
            tools: Vec::new(),
            generation_config: Some(title_generation_config()),
        };

        let response = self
            .client
            .post(Self::endpoint(provider, &model.id, "generateContent"))
            .header("x-goog-api-key", &provider.api_key)
            .json(&body)
            .send()
            .await
            .context("Failed to send title request to Gemini API")
            .map_err(ChatError::VendorTransport)?;
        let response = ensure_success(response, "Gemini")
            .await
            .map_err(ChatError::VendorTransport)?;

        let chunk: StreamChunk = response
            .json()
            .await
            .map_err(|e| ChatError::Schema(format!("Unexpected Gemini response body: {}", e)))?;
        parse_title(&chunk.text())
    }
}
