use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use flai_lib::api::{Adapters, ChatRequest, LLMApiProvider, RawEvent, RawEventStream};
use flai_lib::content::TextKind;
use flai_lib::error::ChatError;
use flai_lib::handlers::router;
use flai_lib::models::{ModelConfig, ProviderRow, TitleResult};
use flai_lib::registry::{ProviderInfo, ProviderRegistry};
use flai_lib::state::AppState;
use flai_lib::storage::StorageManager;
use futures::{stream, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

/// Replies with a fixed script; `stall` keeps the stream open afterwards.
struct FakeAdapter {
    reply: Vec<RawEvent>,
    stall: bool,
}

#[async_trait]
impl LLMApiProvider for FakeAdapter {
    async fn stream_chat(&self, _request: ChatRequest<'_>) -> anyhow::Result<RawEventStream> {
        let scripted = stream::iter(self.reply.clone().into_iter().map(Ok));
        if self.stall {
            Ok(Box::pin(scripted.chain(stream::pending())))
        } else {
            Ok(Box::pin(scripted))
        }
    }

    async fn generate_title(
        &self,
        _provider: &ProviderInfo,
        _model: &ModelConfig,
        system_instruction: &str,
        content: &str,
    ) -> Result<TitleResult, ChatError> {
        assert_eq!(system_instruction, "Name this chat");
        assert!(content.starts_with("<chat_history>"));
        Ok(TitleResult {
            title: "Arithmetic".into(),
            icon: "🧮".into(),
        })
    }
}

async fn app(reply: Vec<RawEvent>, stall: bool) -> (Router, StorageManager) {
    let storage = StorageManager::in_memory().await.unwrap();
    storage
        .add_provider(&ProviderRow {
            id: "openai".into(),
            name: "OpenAI".into(),
            api_key: "sk-test".into(),
            provider_type: "openai".into(),
            base_url: String::new(),
            model: r#"[{"id":"gpt-5","name":"GPT-5","reasoning":true}]"#.into(),
            is_active: true,
        })
        .await
        .unwrap();
    storage
        .set_system_config(
            "title_generation",
            r#"{"provider_id":"openai","model_name":"gpt-5","prompt":"Name this chat"}"#,
        )
        .await
        .unwrap();

    let registry = ProviderRegistry::load(&storage).await.unwrap();
    let adapter: Arc<dyn LLMApiProvider> = Arc::new(FakeAdapter { reply, stall });
    let state = AppState::new(storage.clone(), registry, Adapters::new(adapter.clone(), adapter), 8);
    (router(state), storage)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn post_empty(uri: &str) -> Request<Body> {
    Request::builder().method("POST").uri(uri).body(Body::empty()).unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// The `data:` payloads of an SSE body, in order.
fn sse_data(raw: &str) -> Vec<String> {
    raw.split("\n\n")
        .filter_map(|frame| {
            frame
                .lines()
                .find_map(|line| line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")))
                .map(str::to_string)
        })
        .collect()
}

async fn new_conversation(app: &Router) -> Uuid {
    let response = app.clone().oneshot(post_empty("/api/conversations")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    Uuid::parse_str(body["id"].as_str().unwrap()).unwrap()
}

fn message_request(conversation_id: Uuid, path: &[Uuid], prompt: &str) -> Value {
    json!({
        "id": Uuid::new_v4(),
        "conversation_id": conversation_id,
        "provider_id": "openai",
        "model_name": "gpt-5",
        "message_path": path,
        "prompt": prompt,
        "tools": ["internal_web_search"]
    })
}

#[tokio::test]
async fn streams_reasoning_then_answer_and_stores_the_turn() {
    let (app, _) = app(
        vec![
            RawEvent::text(TextKind::Reasoning, "Two plus two."),
            RawEvent::text(TextKind::Message, "4"),
            RawEvent::TerminalSignal { reason: "completed".into() },
        ],
        false,
    )
    .await;
    let conversation_id = new_conversation(&app).await;

    let response = app
        .clone()
        .oneshot(post_json("/api/messages", message_request(conversation_id, &[], "2+2?")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let frames = sse_data(&String::from_utf8(bytes.to_vec()).unwrap());

    assert_eq!(frames.len(), 4);
    let kinds: Vec<Value> = frames[..3]
        .iter()
        .map(|frame| serde_json::from_str::<Value>(frame).unwrap()["type"].clone())
        .collect();
    assert_eq!(kinds, vec![json!("reasoning"), json!("message"), json!("meta_info")]);
    assert_eq!(frames[3], "[DONE]");

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/conversations/{}/messages", conversation_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let turns = json_body(response).await;
    let turns = turns.as_array().unwrap();
    assert_eq!(turns.len(), 2);
    assert_eq!(
        turns[1]["content"],
        json!([
            {"type": "reasoning", "data": {"content": "Two plus two."}},
            {"type": "message", "data": {"content": "4"}}
        ])
    );
    assert_eq!(turns[1]["meta_info"]["provider_name"], "OpenAI");
}

#[tokio::test]
async fn invalid_message_path_is_rejected() {
    let (app, storage) = app(vec![RawEvent::text(TextKind::Message, "4")], false).await;
    let conversation_id = new_conversation(&app).await;

    let body = message_request(conversation_id, &[Uuid::new_v4()], "2+2?");
    let response = app.clone().oneshot(post_json("/api/messages", body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["code"], "invalid_input");
    assert!(storage.list_turns(conversation_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_model_is_rejected() {
    let (app, _) = app(Vec::new(), false).await;
    let conversation_id = new_conversation(&app).await;

    let mut body = message_request(conversation_id, &[], "hi");
    body["model_name"] = json!("gpt-0");
    let response = app.clone().oneshot(post_json("/api/messages", body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn stop_keeps_partial_content() {
    let (app, storage) = app(vec![RawEvent::text(TextKind::Message, "Partial ans")], true).await;
    let conversation_id = new_conversation(&app).await;

    let response = app
        .clone()
        .oneshot(post_json("/api/messages", message_request(conversation_id, &[], "Tell me")))
        .await
        .unwrap();
    let mut body = response.into_body().into_data_stream();
    let first = body.next().await.unwrap().unwrap();
    let first = sse_data(&String::from_utf8(first.to_vec()).unwrap());
    let event: Value = serde_json::from_str(&first[0]).unwrap();
    let message_id = event["message_id"].as_str().unwrap().to_string();

    let stop = app
        .clone()
        .oneshot(post_empty(&format!("/api/messages/{}/stop", message_id)))
        .await
        .unwrap();
    assert_eq!(stop.status(), StatusCode::NO_CONTENT);

    // Body ends once the aggregator has finished
    while body.next().await.is_some() {}

    let turns = storage.list_turns(conversation_id).await.unwrap();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[1].id.to_string(), message_id);
    assert_eq!(
        serde_json::to_value(&turns[1].content).unwrap(),
        json!([{"type": "message", "data": {"content": "Partial ans"}}])
    );
}

#[tokio::test]
async fn title_is_generated_and_stored() {
    let (app, storage) = app(vec![RawEvent::text(TextKind::Message, "4")], false).await;
    let conversation_id = new_conversation(&app).await;

    let response = app
        .clone()
        .oneshot(post_json("/api/messages", message_request(conversation_id, &[], "2+2?")))
        .await
        .unwrap();
    to_bytes(response.into_body(), usize::MAX).await.unwrap();

    let response = app
        .clone()
        .oneshot(post_empty(&format!("/api/conversations/{}/title", conversation_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, json!({"title": "Arithmetic", "icon": "🧮"}));

    let conversation = storage.get_conversation(conversation_id).await.unwrap().unwrap();
    assert_eq!(conversation.title, "Arithmetic");
}

#[tokio::test]
async fn providers_are_listed_without_keys() {
    let (app, _) = app(Vec::new(), false).await;
    let response = app
        .clone()
        .oneshot(Request::builder().uri("/api/providers").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body[0]["id"], "openai");
    assert!(body[0]["models"]["gpt-5"]["reasoning"].as_bool().unwrap());
    assert!(body[0].get("api_key").is_none());

    let reload = app
        .clone()
        .oneshot(post_empty("/admin/providers/reload"))
        .await
        .unwrap();
    assert_eq!(json_body(reload).await, json!({"providers": 1}));
}

#[tokio::test]
async fn stopping_an_unknown_message_is_not_found() {
    let (app, _) = app(Vec::new(), false).await;
    let response = app
        .clone()
        .oneshot(post_empty(&format!("/api/messages/{}/stop", Uuid::new_v4())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
