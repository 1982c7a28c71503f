use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Block `type` discriminators understood by this build.
const KNOWN_BLOCK_TYPES: [&str; 4] = ["message", "reasoning", "function_call", "google_grounding_data"];

/// One contiguous unit of a turn's body.
///
/// Serialized as `{"type": "...", "data": {...}}`; a turn's content column holds
/// a JSON array of these.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ContentBlock {
    Message(TextContent),
    Reasoning(TextContent),
    FunctionCall(FunctionCall),
    GoogleGroundingData(Value),
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TextContent {
    pub content: String,
}

// Tool invocation reported by the vendor (built-in web search or a declared function)
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FunctionCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// The two text-bearing block kinds a stream can interleave.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TextKind {
    Message,
    Reasoning,
}

impl TextKind {
    pub fn into_block(self, content: String) -> ContentBlock {
        match self {
            TextKind::Message => ContentBlock::Message(TextContent { content }),
            TextKind::Reasoning => ContentBlock::Reasoning(TextContent { content }),
        }
    }
}

impl ContentBlock {
    pub fn message(content: impl Into<String>) -> Self {
        ContentBlock::Message(TextContent { content: content.into() })
    }

    pub fn reasoning(content: impl Into<String>) -> Self {
        ContentBlock::Reasoning(TextContent { content: content.into() })
    }

    /// The text kind of this block, if it is a text block.
    pub fn text_kind(&self) -> Option<TextKind> {
        match self {
            ContentBlock::Message(_) => Some(TextKind::Message),
            ContentBlock::Reasoning(_) => Some(TextKind::Reasoning),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ContentBlock::Message(_) => "message",
            ContentBlock::Reasoning(_) => "reasoning",
            ContentBlock::FunctionCall(_) => "function_call",
            ContentBlock::GoogleGroundingData(_) => "google_grounding_data",
        }
    }
}

/// Serializes a block list into the transcript column format.
pub fn to_transcript(blocks: &[ContentBlock]) -> Result<String> {
    serde_json::to_string(blocks).context("Failed to serialize content blocks")
}

/// Parses a transcript column back into blocks.
///
/// Blocks whose `type` this build does not know are logged and skipped; a known
/// type with a malformed payload is an error.
pub fn parse_transcript(raw: &str) -> Result<Vec<ContentBlock>> {
    let values: Vec<Value> =
        serde_json::from_str(raw).context("Transcript content is not a JSON array")?;

    let mut blocks = Vec::with_capacity(values.len());
    for value in values {
        let block_type = value.get("type").and_then(Value::as_str).unwrap_or_default();
        if !KNOWN_BLOCK_TYPES.contains(&block_type) {
            log::warn!("Skipping transcript block of unknown type '{}'", block_type);
            continue;
        }
        let block_type = block_type.to_string();
        let block = serde_json::from_value(value)
            .with_context(|| format!("Malformed '{}' block in transcript", block_type))?;
        blocks.push(block);
    }
    Ok(blocks)
}

/// Texts of the `message` blocks, in order. Only these are replayed to vendors.
pub fn message_texts(blocks: &[ContentBlock]) -> impl Iterator<Item = &str> {
    blocks.iter().filter_map(|block| match block {
        ContentBlock::Message(text) => Some(text.content.as_str()),
        _ => None,
    })
}

/// Per-turn accounting attached to every assistant turn.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct UsageMetadata {
    pub provider_name: String,
    pub model_name: String,
    #[serde(default)]
    pub prompt_token_count: u32,
    #[serde(default)]
    pub reasoning_token_count: u32,
    #[serde(default)]
    pub response_token_count: u32,
    #[serde(default)]
    pub tool_use_token_count: u32,
    #[serde(default)]
    pub cached_token_count: u32,
    // Opaque vendor continuation blob (base64), passed back untouched
    #[serde(default)]
    pub thought_signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub google_grounding_data: Option<Value>,
}

/// A partial usage report from a vendor. Absent fields leave the running value alone.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UsageUpdate {
    pub prompt_token_count: Option<u32>,
    pub reasoning_token_count: Option<u32>,
    pub response_token_count: Option<u32>,
    pub tool_use_token_count: Option<u32>,
    pub cached_token_count: Option<u32>,
    pub thought_signature: Option<String>,
    pub google_grounding_data: Option<Value>,
}

impl UsageMetadata {
    pub fn new(provider_name: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            provider_name: provider_name.into(),
            model_name: model_name.into(),
            ..Default::default()
        }
    }

    /// Last write wins, field by field.
    pub fn apply(&mut self, update: UsageUpdate) {
        if let Some(v) = update.prompt_token_count {
            self.prompt_token_count = v;
        }
        if let Some(v) = update.reasoning_token_count {
            self.reasoning_token_count = v;
        }
        if let Some(v) = update.response_token_count {
            self.response_token_count = v;
        }
        if let Some(v) = update.tool_use_token_count {
            self.tool_use_token_count = v;
        }
        if let Some(v) = update.cached_token_count {
            self.cached_token_count = v;
        }
        if let Some(v) = update.thought_signature {
            self.thought_signature = v;
        }
        if let Some(v) = update.google_grounding_data {
            self.google_grounding_data = Some(v);
        }
    }
}
