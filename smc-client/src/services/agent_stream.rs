//! Conversational action stream
//!
//! One push channel per user query. Frames are dispatched into the chat
//! transcript and the event bus; the terminal `final` snapshot refreshes
//! candidates and history and hands any embedded job ids to the coordinator.
//!
//! A new query supersedes the previous stream: its channel is closed, its
//! turn keeps the partial output but receives no further updates.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use smc_common::events::{EventBus, NotificationLevel, SmcEvent};
use smc_common::JobKind;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::job_coordinator::JobCoordinator;
use crate::api::{AgentQuery, MatchingApi, SseFrame, SseStream};
use crate::error::{ClientError, ClientResult};

/// Node name used when a delta payload could not be decoded
pub const RAW_TEXT_NODE: &str = "raw";

/// Lifecycle of one chat turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Streaming,
    Completed,
    /// A newer query took over before this one finished
    Superseded,
    Failed,
    Cancelled,
}

impl TurnState {
    pub fn is_open(&self) -> bool {
        matches!(self, TurnState::Streaming)
    }
}

/// Consecutive assistant text from one processing node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSegment {
    pub node: String,
    pub text: String,
}

/// One query and everything its stream produced
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub stream_id: String,
    pub query: AgentQuery,
    pub started_at: DateTime<Utc>,
    pub segments: Vec<TextSegment>,
    pub tools: Vec<Value>,
    pub snapshot: Option<Value>,
    pub state: TurnState,
    pub error: Option<String>,
}

impl ChatTurn {
    fn new(stream_id: String, query: AgentQuery) -> Self {
        Self {
            stream_id,
            query,
            started_at: Utc::now(),
            segments: Vec::new(),
            tools: Vec::new(),
            snapshot: None,
            state: TurnState::Streaming,
            error: None,
        }
    }

    /// All assistant text of the turn
    pub fn text(&self) -> String {
        self.segments.iter().map(|s| s.text.as_str()).collect()
    }

    fn push_delta(&mut self, node: &str, text: &str) {
        match self.segments.last_mut() {
            Some(segment) if segment.node == node => segment.text.push_str(text),
            _ => self.segments.push(TextSegment {
                node: node.to_string(),
                text: text.to_string(),
            }),
        }
    }
}

/// Ordered history of chat turns
#[derive(Debug, Clone, Default)]
pub struct ChatTranscript {
    turns: Vec<ChatTurn>,
}

impl ChatTranscript {
    pub fn turns(&self) -> &[ChatTurn] {
        &self.turns
    }

    pub fn turn(&self, stream_id: &str) -> Option<&ChatTurn> {
        self.turns.iter().find(|t| t.stream_id == stream_id)
    }

    pub fn last(&self) -> Option<&ChatTurn> {
        self.turns.last()
    }

    /// Mutable access to a turn that is still accepting updates
    fn open_turn(&mut self, stream_id: &str) -> Option<&mut ChatTurn> {
        self.turns
            .iter_mut()
            .find(|t| t.stream_id == stream_id && t.state.is_open())
    }

    fn is_open(&self, stream_id: &str) -> bool {
        self.turn(stream_id).is_some_and(|t| t.state.is_open())
    }

    /// Close an open turn; returns false if it was already closed
    fn close(&mut self, stream_id: &str, state: TurnState, error: Option<String>) -> bool {
        match self.open_turn(stream_id) {
            Some(turn) => {
                turn.state = state;
                turn.error = error;
                true
            }
            None => false,
        }
    }
}

/// Job ids embedded in a final snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotJobs {
    pub matching_task_id: Option<String>,
    pub matcher_task_id: Option<String>,
}

impl SnapshotJobs {
    /// Depth-first scan; the first id found for each kind wins
    pub fn scan(snapshot: &Value) -> Self {
        let mut jobs = SnapshotJobs::default();
        jobs.visit(snapshot);
        jobs
    }

    fn visit(&mut self, value: &Value) {
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    match (key.as_str(), child.as_str()) {
                        ("matcher_task_id", Some(id)) if self.matcher_task_id.is_none() => {
                            self.matcher_task_id = Some(id.to_string());
                        }
                        ("task_id" | "matching_task_id", Some(id)) if self.matching_task_id.is_none() => {
                            self.matching_task_id = Some(id.to_string());
                        }
                        _ => self.visit(child),
                    }
                }
            }
            Value::Array(items) => items.iter().for_each(|item| self.visit(item)),
            _ => {}
        }
    }
}

#[derive(Debug, Deserialize)]
struct DeltaPayload {
    #[serde(default)]
    node: Option<String>,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    message: String,
}

/// Handle to one open stream
#[derive(Debug)]
pub struct StreamHandle {
    stream_id: String,
    join: JoinHandle<TurnState>,
}

impl StreamHandle {
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Wait for the dispatch loop to finish
    pub async fn wait(self) -> TurnState {
        self.join.await.unwrap_or(TurnState::Failed)
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

struct ActiveStream {
    stream_id: String,
    cancel: CancellationToken,
}

/// Conversational client for one session
pub struct AgentStream {
    api: Arc<dyn MatchingApi>,
    coordinator: JobCoordinator,
    events: EventBus,
    transcript: Arc<RwLock<ChatTranscript>>,
    active: Mutex<Option<ActiveStream>>,
}

impl AgentStream {
    pub fn new(api: Arc<dyn MatchingApi>, coordinator: JobCoordinator, events: EventBus) -> Self {
        Self {
            api,
            coordinator,
            events,
            transcript: Arc::new(RwLock::new(ChatTranscript::default())),
            active: Mutex::new(None),
        }
    }

    pub async fn transcript(&self) -> ChatTranscript {
        self.transcript.read().await.clone()
    }

    /// Ask a question, superseding any stream still open
    ///
    /// The turn is recorded even when the channel cannot be opened; it is
    /// then closed as failed and the error is returned.
    ///
    /// The new stream is registered before connecting, so `cancel` or a later
    /// `ask` can close it while the connection is still being opened; `ask`
    /// then returns `ClientError::Cancelled`.
    pub async fn ask(&self, query: AgentQuery) -> ClientResult<StreamHandle> {
        let stream_id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        {
            let mut active = self.active.lock().await;
            if let Some(previous) = active.take() {
                self.close_turn(&previous, TurnState::Superseded).await;
            }
            self.transcript
                .write()
                .await
                .turns
                .push(ChatTurn::new(stream_id.clone(), query.clone()));
            *active = Some(ActiveStream {
                stream_id: stream_id.clone(),
                cancel: cancel.clone(),
            });
        }
        tracing::info!(stream_id = %stream_id, query = %query.query, "Opening agent stream");

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!(stream_id = %stream_id, "Agent stream closed while connecting");
                return Err(ClientError::Cancelled);
            }
            opened = self.api.open_agent_stream(&query) => opened,
        };

        let frames = match opened {
            Ok(frames) => frames,
            Err(e) => {
                self.release(&stream_id).await;
                let message = e.user_message();
                let closed = self
                    .transcript
                    .write()
                    .await
                    .close(&stream_id, TurnState::Failed, Some(message.clone()));
                if closed {
                    self.events.emit_lossy(SmcEvent::AgentFailed {
                        stream_id,
                        message,
                    });
                }
                return Err(e);
            }
        };

        let dispatcher = Dispatcher {
            stream_id: stream_id.clone(),
            coordinator: self.coordinator.clone(),
            events: self.events.clone(),
            transcript: Arc::clone(&self.transcript),
        };
        // A cancel racing the connect is seen by the dispatcher's first select
        let join = tokio::spawn(dispatcher.run(frames, cancel));

        Ok(StreamHandle { stream_id, join })
    }

    /// Forget `stream_id` as the active stream if nothing replaced it yet
    async fn release(&self, stream_id: &str) {
        let mut active = self.active.lock().await;
        if active.as_ref().is_some_and(|a| a.stream_id == stream_id) {
            *active = None;
        }
    }

    /// Close the current stream; nothing more is dispatched from it
    pub async fn cancel(&self) -> bool {
        match self.active.lock().await.take() {
            Some(previous) => {
                self.close_turn(&previous, TurnState::Cancelled).await;
                true
            }
            None => false,
        }
    }

    async fn close_turn(&self, stream: &ActiveStream, state: TurnState) {
        // Closing the turn first makes any frame already in hand a no-op
        let closed = self.transcript.write().await.close(&stream.stream_id, state, None);
        stream.cancel.cancel();
        if closed {
            tracing::info!(stream_id = %stream.stream_id, state = ?state, "Agent stream closed");
        }
    }
}

/// Per-stream dispatch loop
struct Dispatcher {
    stream_id: String,
    coordinator: JobCoordinator,
    events: EventBus,
    transcript: Arc<RwLock<ChatTranscript>>,
}

enum Step {
    Continue,
    Finished(TurnState),
    /// The turn was closed from outside (superseded or cancelled)
    Closed,
}

impl Dispatcher {
    async fn run(self, mut frames: SseStream, cancel: CancellationToken) -> TurnState {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.current_state().await,
                next = frames.next() => next,
            };

            let step = match next {
                Some(Ok(frame)) => self.dispatch(frame).await,
                Some(Err(e)) => {
                    tracing::warn!(stream_id = %self.stream_id, error = %e, "Agent stream transport error");
                    self.fail(e.user_message()).await
                }
                None => self.end_of_stream().await,
            };

            // Returning drops `frames`, which closes the channel
            match step {
                Step::Continue => {}
                Step::Finished(state) => return state,
                Step::Closed => return self.current_state().await,
            }
        }
    }

    async fn current_state(&self) -> TurnState {
        self.transcript
            .read()
            .await
            .turn(&self.stream_id)
            .map(|t| t.state)
            .unwrap_or(TurnState::Cancelled)
    }

    async fn dispatch(&self, frame: SseFrame) -> Step {
        match frame.event.as_str() {
            "delta" => self.on_delta(&frame.data).await,
            "tool" => self.on_tool(&frame.data).await,
            "final" => self.on_final(&frame.data).await,
            "error" => {
                let message = serde_json::from_str::<ErrorPayload>(&frame.data)
                    .map(|p| p.message)
                    .unwrap_or(frame.data);
                self.fail(message).await
            }
            "done" => self.finish().await,
            other => {
                tracing::debug!(stream_id = %self.stream_id, event = other, "Ignoring agent event");
                Step::Continue
            }
        }
    }

    async fn on_delta(&self, data: &str) -> Step {
        let (node, text) = match serde_json::from_str::<DeltaPayload>(data) {
            Ok(payload) => (
                payload.node.unwrap_or_else(|| RAW_TEXT_NODE.to_string()),
                payload.content,
            ),
            Err(_) => (RAW_TEXT_NODE.to_string(), data.to_string()),
        };

        let mut transcript = self.transcript.write().await;
        let Some(turn) = transcript.open_turn(&self.stream_id) else {
            return Step::Closed;
        };
        turn.push_delta(&node, &text);
        drop(transcript);

        self.events.emit_lossy(SmcEvent::AgentDelta {
            stream_id: self.stream_id.clone(),
            node,
            text,
        });
        Step::Continue
    }

    async fn on_tool(&self, data: &str) -> Step {
        let payload = parse_or_raw(data);

        let mut transcript = self.transcript.write().await;
        let Some(turn) = transcript.open_turn(&self.stream_id) else {
            return Step::Closed;
        };
        turn.tools.push(payload.clone());
        drop(transcript);

        self.events.emit_lossy(SmcEvent::AgentTool {
            stream_id: self.stream_id.clone(),
            payload,
        });
        Step::Continue
    }

    async fn on_final(&self, data: &str) -> Step {
        let snapshot = parse_or_raw(data);

        let mut transcript = self.transcript.write().await;
        let Some(turn) = transcript.open_turn(&self.stream_id) else {
            return Step::Closed;
        };
        turn.snapshot = Some(snapshot.clone());
        drop(transcript);

        self.events.emit_lossy(SmcEvent::AgentFinished {
            stream_id: self.stream_id.clone(),
            snapshot: snapshot.clone(),
        });

        self.coordinator.refresh_candidates_and_history().await;

        // Held across the handoff: a cancel either closed the turn already or
        // waits until the jobs below are tracked
        let transcript = self.transcript.write().await;
        if !transcript.is_open(&self.stream_id) {
            tracing::info!(stream_id = %self.stream_id, "Agent stream closed, not starting snapshot jobs");
            return Step::Closed;
        }

        let jobs = SnapshotJobs::scan(&snapshot);
        if let Some(task_id) = jobs.matching_task_id {
            tracing::info!(stream_id = %self.stream_id, task_id = %task_id, "Agent started matching job");
            self.coordinator
                .track_matching(JobKind::Matching, &task_id, None)
                .await;
        }
        if let Some(task_id) = jobs.matcher_task_id {
            tracing::info!(stream_id = %self.stream_id, task_id = %task_id, "Agent started matcher compilation");
            self.coordinator.track_matcher_compile(&task_id, None).await;
        }
        drop(transcript);
        Step::Continue
    }

    async fn finish(&self) -> Step {
        self.transcript
            .write()
            .await
            .close(&self.stream_id, TurnState::Completed, None);
        tracing::info!(stream_id = %self.stream_id, "Agent stream done");
        Step::Finished(self.current_state().await)
    }

    async fn fail(&self, message: String) -> Step {
        let closed = self
            .transcript
            .write()
            .await
            .close(&self.stream_id, TurnState::Failed, Some(message.clone()));
        if closed {
            self.events.emit_lossy(SmcEvent::AgentFailed {
                stream_id: self.stream_id.clone(),
                message: message.clone(),
            });
            self.events
                .emit_lossy(SmcEvent::notify(NotificationLevel::Error, message));
        }
        Step::Finished(self.current_state().await)
    }

    /// Channel closed without `done`: fine after a final snapshot, a failure otherwise
    async fn end_of_stream(&self) -> Step {
        let has_snapshot = self
            .transcript
            .read()
            .await
            .turn(&self.stream_id)
            .is_some_and(|t| t.snapshot.is_some());
        if has_snapshot {
            self.finish().await
        } else {
            self.fail("Agent stream closed before completion".to_string())
                .await
        }
    }
}

/// Decode a JSON payload, keeping undecodable text as a JSON string
fn parse_or_raw(data: &str) -> Value {
    serde_json::from_str(data).unwrap_or_else(|_| Value::String(data.to_string()))
}
