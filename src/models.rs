use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::content::{ContentBlock, UsageMetadata};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

// A single node in a conversation's message tree
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Turn {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub role: Role,
    pub content: Vec<ContentBlock>,
    // Stored as a JSON blob; absent for user turns
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta_info: Option<UsageMetadata>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Turn {
    /// A user prompt: always exactly one `message` block.
    pub fn user_prompt(id: Uuid, conversation_id: Uuid, parent_id: Option<Uuid>, prompt: &str) -> Self {
        Self {
            id,
            conversation_id,
            parent_id,
            role: Role::User,
            content: vec![ContentBlock::message(prompt)],
            meta_info: None,
            created_at: Utc::now(),
            deleted_at: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Conversation {
    pub id: Uuid,
    pub title: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    OpenAI,
    Gemini,
}

impl ProviderType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "openai" => Some(ProviderType::OpenAI),
            "gemini" => Some(ProviderType::Gemini),
            _ => None,
        }
    }
}

/// Capability and pricing descriptor for one model. Display-only apart from `id`/`name`.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ModelConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub attachment: bool,
    #[serde(default)]
    pub reasoning: bool,
    #[serde(default)]
    pub tool_call: bool,
    #[serde(default)]
    pub structured_output: bool,
    #[serde(default)]
    pub temperature: bool,
    #[serde(default)]
    pub knowledge: String,
    #[serde(default)]
    pub release_date: String,
    #[serde(default)]
    pub last_updated: String,
    #[serde(default)]
    pub modalities: Modalities,
    #[serde(default)]
    pub open_weights: bool,
    #[serde(default)]
    pub cost: Cost,
    #[serde(default)]
    pub limit: Limit,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Cost {
    #[serde(default)]
    pub input: f64,
    #[serde(default)]
    pub output: f64,
    #[serde(default)]
    pub cache_read: f64,
    #[serde(default)]
    pub cache_write: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_over_200k: Option<Box<Cost>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Limit {
    #[serde(default)]
    pub context: i64,
    #[serde(default)]
    pub output: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Modalities {
    #[serde(default)]
    pub input: Vec<String>,
    #[serde(default)]
    pub output: Vec<String>,
}

// Raw provider table row; `model` is a JSON array of ModelConfig
#[derive(Clone, Debug)]
pub struct ProviderRow {
    pub id: String,
    pub name: String,
    pub api_key: String,
    pub provider_type: String,
    pub base_url: String,
    pub model: String,
    pub is_active: bool,
}

/// Settings for the conversation title generator, stored under the
/// `title_generation` system config key.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TitleGenerationConfig {
    pub provider_id: String,
    pub model_name: String,
    pub prompt: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TitleResult {
    pub title: String,
    pub icon: String,
}
