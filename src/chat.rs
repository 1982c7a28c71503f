use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::aggregator::{LiveEvent, StreamAggregator, StreamOutcome};
use crate::api::{ChatRequest, Tool};
use crate::content::UsageMetadata;
use crate::error::ChatError;
use crate::models::Turn;
use crate::state::AppState;
use crate::storage::{InsertOutcome, TranscriptStore};

/// Body of `POST /api/messages`.
#[derive(Deserialize, Debug, Clone)]
pub struct CreateMessageRequest {
    /// Client-chosen id of the user turn; resubmitting it is idempotent.
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub provider_id: String,
    pub model_name: String,
    /// Ancestor turn ids, root first.
    #[serde(default)]
    pub message_path: Vec<Uuid>,
    pub prompt: String,
    #[serde(default)]
    pub tools: Vec<String>,
}

/// A started assistant turn: its id and the live events for the client.
pub struct TurnStream {
    pub assistant_turn_id: Uuid,
    pub events: mpsc::Receiver<LiveEvent>,
}

fn parse_tools(ids: &[String]) -> Vec<Tool> {
    ids.iter()
        .filter_map(|id| {
            let tool = Tool::parse(id);
            if tool.is_none() {
                log::warn!("Ignoring unsupported tool '{}'", id);
            }
            tool
        })
        .collect()
}

/// Validates and stores the user turn, opens the vendor stream, and hands the
/// aggregation to a background task.
///
/// Everything that can reject the request happens before the user turn is
/// written.
pub async fn submit_turn(state: &AppState, request: CreateMessageRequest) -> Result<TurnStream, ChatError> {
    log::info!(
        "Received message {} for conversation {} ({}/{})",
        request.id,
        request.conversation_id,
        request.provider_id,
        request.model_name
    );

    let prompt = request.prompt.trim();
    if prompt.is_empty() {
        return Err(ChatError::InvalidInput("Prompt cannot be empty".to_string()));
    }

    state
        .storage
        .get_conversation(request.conversation_id)
        .await
        .map_err(ChatError::Persistence)?
        .ok_or_else(|| ChatError::NotFound(format!("Conversation {} not found", request.conversation_id)))?;

    let resolved = state.registry.resolve(&request.provider_id, &request.model_name)?;

    let history = state
        .storage
        .fetch_ancestors(request.conversation_id, &request.message_path)
        .await
        .map_err(ChatError::Persistence)?;
    if history.len() != request.message_path.len() {
        return Err(ChatError::InvalidInput(format!(
            "Invalid message path: {} of {} ancestors found",
            history.len(),
            request.message_path.len()
        )));
    }

    let user_turn = Turn::user_prompt(
        request.id,
        request.conversation_id,
        history.last().map(|turn| turn.id),
        prompt,
    );
    match state.storage.insert_turn(&user_turn).await.map_err(ChatError::Persistence)? {
        InsertOutcome::Inserted => log::info!("User turn {} saved.", user_turn.id),
        InsertOutcome::Duplicate => log::info!("User turn {} already stored, reusing it.", user_turn.id),
    }

    let tools = parse_tools(&request.tools);
    let adapter = state.adapters.for_type(resolved.provider.provider_type);
    let events = adapter
        .stream_chat(ChatRequest {
            provider: &resolved.provider,
            model: &resolved.model,
            history: &history,
            prompt: &user_turn,
            tools: &tools,
        })
        .await
        .map_err(ChatError::VendorTransport)?;

    let model_name = if resolved.model.name.is_empty() {
        resolved.model.id.clone()
    } else {
        resolved.model.name.clone()
    };
    let usage = UsageMetadata::new(resolved.provider.name.clone(), model_name);
    let assistant_turn_id = Uuid::new_v4();
    let aggregator = StreamAggregator::new(assistant_turn_id, &user_turn, usage);

    let cancel = CancellationToken::new();
    state.in_flight.insert(assistant_turn_id, cancel.clone());
    let (tx, rx) = mpsc::channel(state.sse_buffer);

    let store: Arc<dyn TranscriptStore> = state.storage.clone();
    let in_flight = state.in_flight.clone();
    tokio::spawn(async move {
        log::info!("BG Task [{}]: aggregation started", assistant_turn_id);
        match aggregator.run(events, tx, store, cancel).await {
            Ok(StreamOutcome::Completed { persisted }) => {
                log::info!("BG Task [{}]: completed (saved: {})", assistant_turn_id, persisted)
            }
            Ok(StreamOutcome::Cancelled { persisted }) => {
                log::warn!("BG Task [{}]: cancelled (saved: {})", assistant_turn_id, persisted)
            }
            Err(e) => log::error!("BG Task [{}]: failed: {}", assistant_turn_id, e),
        }
        in_flight.remove(&assistant_turn_id);
    });

    Ok(TurnStream {
        assistant_turn_id,
        events: rx,
    })
}

/// Cancels an in-flight assistant turn. Partial content is still saved.
pub fn stop_turn(state: &AppState, assistant_turn_id: Uuid) -> Result<(), ChatError> {
    log::warn!("Stop requested for message ID: {}", assistant_turn_id);
    let cancel = state
        .in_flight
        .get(&assistant_turn_id)
        .map(|entry| entry.value().clone())
        .ok_or_else(|| ChatError::NotFound(format!("No generation in progress for {}", assistant_turn_id)))?;
    cancel.cancel();
    log::info!("Cancellation signal set for message ID: {}", assistant_turn_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Adapters, LLMApiProvider, RawEvent, RawEventStream};
    use crate::content::{ContentBlock, TextKind};
    use crate::models::{ModelConfig, ProviderType, Role, TitleResult};
    use crate::registry::{ProviderInfo, ProviderRegistry, RegistrySnapshot};
    use crate::storage::StorageManager;
    use async_trait::async_trait;
    use futures::stream;
    use std::collections::HashMap;

    struct ScriptedAdapter {
        reply: Vec<RawEvent>,
    }

    #[async_trait]
    impl LLMApiProvider for ScriptedAdapter {
        async fn stream_chat(&self, _request: ChatRequest<'_>) -> anyhow::Result<RawEventStream> {
            Ok(Box::pin(stream::iter(self.reply.clone().into_iter().map(Ok))))
        }

        async fn generate_title(
            &self,
            _provider: &ProviderInfo,
            _model: &ModelConfig,
            _system_instruction: &str,
            _content: &str,
        ) -> Result<TitleResult, ChatError> {
            Err(ChatError::Schema("not scripted".into()))
        }
    }

    async fn state_with(reply: Vec<RawEvent>) -> (AppState, Uuid) {
        let storage = StorageManager::in_memory().await.unwrap();
        let conversation = storage.create_conversation("New Chat").await.unwrap();
        let provider = ProviderInfo::new("openai", "OpenAI", ProviderType::OpenAI, "", "sk-test").with_model(ModelConfig {
            id: "gpt-5".into(),
            name: "GPT-5".into(),
            ..Default::default()
        });
        let mut providers = HashMap::new();
        providers.insert(provider.id.clone(), Arc::new(provider));
        let registry = ProviderRegistry::new(RegistrySnapshot {
            providers,
            title_generation: None,
        });
        let adapter: Arc<dyn LLMApiProvider> = Arc::new(ScriptedAdapter { reply });
        let state = AppState::new(storage, registry, Adapters::new(adapter.clone(), adapter), 8);
        (state, conversation.id)
    }

    fn request(conversation_id: Uuid, path: Vec<Uuid>, prompt: &str) -> CreateMessageRequest {
        CreateMessageRequest {
            id: Uuid::new_v4(),
            conversation_id,
            provider_id: "openai".into(),
            model_name: "gpt-5".into(),
            message_path: path,
            prompt: prompt.into(),
            tools: vec!["internal_web_search".into()],
        }
    }

    async fn finish(mut stream: TurnStream) -> Vec<LiveEvent> {
        let mut events = Vec::new();
        while let Some(event) = stream.events.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn answers_and_links_the_assistant_turn() {
        let (state, conversation_id) = state_with(vec![RawEvent::text(TextKind::Message, "4")]).await;
        let req = request(conversation_id, Vec::new(), "  2+2?  ");
        let user_id = req.id;

        let stream = submit_turn(&state, req).await.unwrap();
        let assistant_id = stream.assistant_turn_id;
        let events = finish(stream).await;
        assert_eq!(events.last(), Some(&LiveEvent::Done));

        // The receiver closes only after persistence finished
        let turns = state.storage.list_turns(conversation_id).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].id, user_id);
        assert_eq!(turns[0].content, vec![ContentBlock::message("2+2?")]);
        assert_eq!(turns[1].id, assistant_id);
        assert_eq!(turns[1].role, Role::Assistant);
        assert_eq!(turns[1].parent_id, Some(user_id));
        assert_eq!(turns[1].meta_info.as_ref().unwrap().model_name, "GPT-5");
    }

    #[tokio::test]
    async fn resubmitting_stores_one_user_turn() {
        let (state, conversation_id) = state_with(vec![RawEvent::text(TextKind::Message, "4")]).await;
        let req = request(conversation_id, Vec::new(), "2+2?");

        finish(submit_turn(&state, req.clone()).await.unwrap()).await;
        finish(submit_turn(&state, req.clone()).await.unwrap()).await;

        let turns = state.storage.list_turns(conversation_id).await.unwrap();
        assert_eq!(turns.iter().filter(|t| t.role == Role::User).count(), 1);
    }

    #[tokio::test]
    async fn missing_ancestor_rejects_without_writing() {
        let (state, conversation_id) = state_with(vec![RawEvent::text(TextKind::Message, "4")]).await;
        let first = request(conversation_id, Vec::new(), "Hi");
        let first_id = first.id;
        finish(submit_turn(&state, first).await.unwrap()).await;
        let before = state.storage.list_turns(conversation_id).await.unwrap().len();

        let req = request(conversation_id, vec![first_id, Uuid::new_v4()], "2+2?");
        let result = submit_turn(&state, req).await;
        assert!(matches!(result, Err(ChatError::InvalidInput(_))));
        assert_eq!(state.storage.list_turns(conversation_id).await.unwrap().len(), before);
    }

    #[tokio::test]
    async fn rejects_bad_input_before_storing() {
        let (state, conversation_id) = state_with(Vec::new()).await;

        let empty = submit_turn(&state, request(conversation_id, Vec::new(), "   ")).await;
        assert!(matches!(empty, Err(ChatError::InvalidInput(_))));

        let mut unknown_model = request(conversation_id, Vec::new(), "hi");
        unknown_model.model_name = "gpt-0".into();
        assert!(matches!(submit_turn(&state, unknown_model).await, Err(ChatError::InvalidInput(_))));

        let missing = submit_turn(&state, request(Uuid::new_v4(), Vec::new(), "hi")).await;
        assert!(matches!(missing, Err(ChatError::NotFound(_))));

        assert!(state.storage.list_turns(conversation_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stop_of_unknown_turn_is_not_found() {
        let (state, _) = state_with(Vec::new()).await;
        assert!(matches!(stop_turn(&state, Uuid::new_v4()), Err(ChatError::NotFound(_))));
    }

    #[test]
    fn unknown_tools_are_dropped() {
        let tools = parse_tools(&["internal_web_search".to_string(), "shell".to_string()]);
        assert_eq!(tools, vec![Tool::WebSearch]);
    }
}
