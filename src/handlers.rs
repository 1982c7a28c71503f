use axum::{
    extract::{Path, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive, Sse},
        Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use std::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::aggregator::LiveEvent;
use crate::chat::{self, CreateMessageRequest};
use crate::error::ChatError;
use crate::models::{Conversation, TitleResult, Turn};
use crate::registry::ProviderInfo;
use crate::state::AppState;
use crate::title;

const DONE_SENTINEL: &str = "[DONE]";
const NEW_CONVERSATION_TITLE: &str = "New Chat";

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();
    let response = next.run(request).await;
    log::info!(
        "{} {} -> {} ({} ms)",
        method,
        path,
        response.status().as_u16(),
        started.elapsed().as_millis()
    );
    response
}

fn live_event(event: LiveEvent) -> Result<Event, axum::Error> {
    match event {
        LiveEvent::Data(response) => Event::default().json_data(response),
        LiveEvent::Done => Ok(Event::default().data(DONE_SENTINEL)),
    }
}

/// Starts an assistant turn and streams it back as server-sent events.
async fn create_message(
    State(state): State<AppState>,
    Json(request): Json<CreateMessageRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ChatError> {
    let turn = chat::submit_turn(&state, request).await?;
    log::debug!("Streaming assistant turn {}", turn.assistant_turn_id);
    let stream = ReceiverStream::new(turn.events).map(live_event);
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn stop_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
) -> Result<StatusCode, ChatError> {
    chat::stop_turn(&state, message_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_conversation(State(state): State<AppState>) -> Result<Json<Conversation>, ChatError> {
    let conversation = state
        .storage
        .create_conversation(NEW_CONVERSATION_TITLE)
        .await
        .map_err(ChatError::Persistence)?;
    Ok(Json(conversation))
}

async fn get_conversation_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
) -> Result<Json<Vec<Turn>>, ChatError> {
    log::info!("Requested messages for conversation ID: {}", conversation_id);
    state
        .storage
        .get_conversation(conversation_id)
        .await
        .map_err(ChatError::Persistence)?
        .ok_or_else(|| ChatError::NotFound(format!("Conversation {} not found", conversation_id)))?;
    let turns = state
        .storage
        .list_turns(conversation_id)
        .await
        .map_err(ChatError::Persistence)?;
    Ok(Json(turns))
}

async fn generate_conversation_title(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
) -> Result<Json<TitleResult>, ChatError> {
    let title = title::generate_title(&state, conversation_id).await?;
    Ok(Json(title))
}

/// Providers and their models; api keys are never serialized.
async fn list_providers(State(state): State<AppState>) -> Json<Vec<ProviderInfo>> {
    let providers = state
        .registry
        .snapshot()
        .sorted_providers()
        .iter()
        .map(|provider| provider.as_ref().clone())
        .collect();
    Json(providers)
}

async fn reload_providers(State(state): State<AppState>) -> Result<Json<Value>, ChatError> {
    let count = state
        .registry
        .refresh(&state.storage)
        .await
        .map_err(ChatError::Persistence)?;
    Ok(Json(json!({ "providers": count })))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/conversations", post(create_conversation))
        .route("/api/conversations/:id/messages", get(get_conversation_messages))
        .route("/api/conversations/:id/title", post(generate_conversation_title))
        .route("/api/messages", post(create_message))
        .route("/api/messages/:id/stop", post(stop_message))
        .route("/api/providers", get(list_providers))
        .route("/admin/providers/reload", post(reload_providers))
        .layer(middleware::from_fn(log_request))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

