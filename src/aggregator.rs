//! Turns an adapter's event stream into live client events and one stored
//! assistant turn.

use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::api::{RawEvent, RawEventStream};
use crate::content::{ContentBlock, TextKind, UsageMetadata};
use crate::error::ChatError;
use crate::models::{Role, Turn};
use crate::storage::TranscriptStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorState {
    Idle,
    Streaming,
    Finalizing,
    Cancelled,
    Failed,
    Closed,
}

/// The `type` of a live event.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    Reasoning,
    FunctionCall,
    GoogleGroundingData,
    MetaInfo,
    Error,
}

impl From<TextKind> for EventKind {
    fn from(kind: TextKind) -> Self {
        match kind {
            TextKind::Message => EventKind::Message,
            TextKind::Reasoning => EventKind::Reasoning,
        }
    }
}

/// One frame sent to the client.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct StreamResponse {
    pub message_id: Uuid,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    Data(StreamResponse),
    /// End-of-stream sentinel.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed { persisted: bool },
    Cancelled { persisted: bool },
}

enum PumpEnd {
    Finished,
    Cancelled,
}

/// Builds one assistant turn from a stream of raw events.
pub struct StreamAggregator {
    state: AggregatorState,
    turn_id: Uuid,
    conversation_id: Uuid,
    parent_id: Uuid,
    open: Option<(TextKind, String)>,
    blocks: Vec<ContentBlock>,
    usage: UsageMetadata,
    grounding_attached: bool,
}

impl StreamAggregator {
    pub fn new(turn_id: Uuid, user_turn: &Turn, usage: UsageMetadata) -> Self {
        Self {
            state: AggregatorState::Idle,
            turn_id,
            conversation_id: user_turn.conversation_id,
            parent_id: user_turn.id,
            open: None,
            blocks: Vec::new(),
            usage,
            grounding_attached: false,
        }
    }

    pub fn turn_id(&self) -> Uuid {
        self.turn_id
    }

    pub fn state(&self) -> AggregatorState {
        self.state
    }

    fn transition(&mut self, next: AggregatorState) {
        log::debug!("Aggregator [{}]: {:?} -> {:?}", self.turn_id, self.state, next);
        self.state = next;
    }

    fn response(&self, kind: EventKind, data: Value) -> StreamResponse {
        StreamResponse {
            message_id: self.turn_id,
            kind,
            data,
        }
    }

    /// Folds one event into the turn, returning the live increment to send, if any.
    pub fn apply(&mut self, event: RawEvent) -> Option<StreamResponse> {
        match event {
            RawEvent::TextDelta { kind, text } => {
                if text.is_empty() {
                    return None;
                }
                match self.open.as_mut() {
                    Some((open_kind, buffer)) if *open_kind == kind => buffer.push_str(&text),
                    _ => {
                        self.close_open_block();
                        self.open = Some((kind, text.clone()));
                    }
                }
                Some(self.response(kind.into(), json!({ "content": text })))
            }
            RawEvent::BlockBoundary => {
                self.close_open_block();
                None
            }
            RawEvent::Block(block) => {
                self.close_open_block();
                log::debug!("Aggregator [{}]: {} block", self.turn_id, block.type_name());
                let response = match &block {
                    ContentBlock::FunctionCall(call) => self.response(EventKind::FunctionCall, json!(call)),
                    ContentBlock::GoogleGroundingData(data) => {
                        self.response(EventKind::GoogleGroundingData, data.clone())
                    }
                    ContentBlock::Message(text) => self.response(EventKind::Message, json!(text)),
                    ContentBlock::Reasoning(text) => self.response(EventKind::Reasoning, json!(text)),
                };
                self.blocks.push(block);
                Some(response)
            }
            RawEvent::UsageUpdate(update) => {
                self.usage.apply(update);
                None
            }
            RawEvent::TerminalSignal { .. } => {
                self.close_open_block();
                None
            }
        }
    }

    pub fn close_open_block(&mut self) {
        if let Some((kind, buffer)) = self.open.take() {
            self.blocks.push(kind.into_block(buffer));
        }
    }

    /// Appends the grounding data collected in usage as one trailing block.
    fn attach_grounding(&mut self) -> Option<StreamResponse> {
        if self.grounding_attached {
            return None;
        }
        let grounding = self.usage.google_grounding_data.clone()?;
        self.grounding_attached = true;
        self.blocks.push(ContentBlock::GoogleGroundingData(grounding.clone()));
        Some(self.response(EventKind::GoogleGroundingData, grounding))
    }

    pub fn meta_info(&self) -> StreamResponse {
        self.response(EventKind::MetaInfo, json!(self.usage))
    }

    /// Closes the buffer and yields the assistant turn, or `None` if nothing was produced.
    pub fn finalize(&mut self) -> Option<Turn> {
        self.close_open_block();
        self.attach_grounding();
        if self.blocks.is_empty() {
            return None;
        }
        Some(Turn {
            id: self.turn_id,
            conversation_id: self.conversation_id,
            parent_id: Some(self.parent_id),
            role: Role::Assistant,
            content: std::mem::take(&mut self.blocks),
            meta_info: Some(self.usage.clone()),
            created_at: Utc::now(),
            deleted_at: None,
        })
    }

    /// Drives the stream to its end, then persists the turn.
    ///
    /// Cancellation is observed while waiting for the next event and while
    /// writing to `sink`; a closed receiver counts as a disconnect.
    pub async fn run(
        mut self,
        mut events: RawEventStream,
        sink: mpsc::Sender<LiveEvent>,
        store: Arc<dyn TranscriptStore>,
        cancel: CancellationToken,
    ) -> Result<StreamOutcome, ChatError> {
        self.transition(AggregatorState::Streaming);
        log::info!("Aggregator [{}]: streaming started", self.turn_id);

        match self.pump(&mut events, &sink, &cancel).await {
            Ok(PumpEnd::Finished) => {
                self.transition(AggregatorState::Finalizing);
                self.close_open_block();
                let mut trailer = Vec::new();
                if let Some(grounding) = self.attach_grounding() {
                    trailer.push(LiveEvent::Data(grounding));
                }
                trailer.push(LiveEvent::Data(self.meta_info()));
                trailer.push(LiveEvent::Done);
                let mut delivered = true;
                for event in trailer {
                    if !deliver(&sink, &cancel, event).await {
                        delivered = false;
                        break;
                    }
                }
                if !delivered {
                    self.transition(AggregatorState::Cancelled);
                }
                let persisted = self.persist(store).await;
                Ok(if delivered {
                    StreamOutcome::Completed { persisted }
                } else {
                    StreamOutcome::Cancelled { persisted }
                })
            }
            Ok(PumpEnd::Cancelled) => {
                log::warn!("Aggregator [{}]: cancelled, keeping partial content", self.turn_id);
                self.transition(AggregatorState::Cancelled);
                let persisted = self.persist(store).await;
                Ok(StreamOutcome::Cancelled { persisted })
            }
            Err(e) => {
                log::error!("Aggregator [{}]: stream failed: {:#}", self.turn_id, e);
                self.transition(AggregatorState::Failed);
                let error = LiveEvent::Data(self.response(EventKind::Error, json!({ "message": format!("{:#}", e) })));
                if deliver(&sink, &cancel, error).await {
                    deliver(&sink, &cancel, LiveEvent::Done).await;
                }
                self.persist(store).await;
                Err(ChatError::VendorTransport(e))
            }
        }
    }

    async fn pump(
        &mut self,
        events: &mut RawEventStream,
        sink: &mpsc::Sender<LiveEvent>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<PumpEnd> {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(PumpEnd::Cancelled),
                _ = sink.closed() => return Ok(PumpEnd::Cancelled),
                next = events.next() => next,
            };
            match next {
                None => return Ok(PumpEnd::Finished),
                Some(Err(e)) => return Err(e),
                Some(Ok(RawEvent::TerminalSignal { reason })) => {
                    log::info!("Aggregator [{}]: vendor finished ({})", self.turn_id, reason);
                    return Ok(PumpEnd::Finished);
                }
                Some(Ok(event)) => {
                    if let Some(response) = self.apply(event) {
                        if !deliver(sink, cancel, LiveEvent::Data(response)).await {
                            return Ok(PumpEnd::Cancelled);
                        }
                    }
                }
            }
        }
    }

    /// Writes the turn from a detached task so a dropped request cannot abort it.
    /// Failures are logged only.
    async fn persist(&mut self, store: Arc<dyn TranscriptStore>) -> bool {
        let Some(turn) = self.finalize() else {
            log::info!("Aggregator [{}]: no content produced, nothing to save", self.turn_id);
            self.transition(AggregatorState::Closed);
            return false;
        };

        let block_count = turn.content.len();
        let saved = tokio::spawn(async move { store.insert_turn(&turn).await }).await;
        let persisted = match saved {
            Ok(Ok(_)) => {
                log::info!("Aggregator [{}]: saved assistant turn ({} blocks)", self.turn_id, block_count);
                true
            }
            Ok(Err(e)) => {
                log::error!("Aggregator [{}]: failed to save assistant turn: {:#}", self.turn_id, e);
                false
            }
            Err(e) => {
                log::error!("Aggregator [{}]: save task failed: {}", self.turn_id, e);
                false
            }
        };
        self.transition(AggregatorState::Closed);
        persisted
    }
}

async fn deliver(sink: &mpsc::Sender<LiveEvent>, cancel: &CancellationToken, event: LiveEvent) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = sink.send(event) => sent.is_ok(),
    }
}
