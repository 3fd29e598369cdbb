//! Event types for the SMC event system
//!
//! Job pollers, the agent stream and the evaluation engine publish here;
//! display collaborators (progress tabs, analytics panels, toasts) subscribe.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::task::{JobKind, TaskState};

/// Which auxiliary dataset a completion handler re-fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuxiliaryData {
    OperationHistory,
    SourceOntology,
    TargetOntology,
    ValueBins,
    ValueMatches,
}

/// Evaluation cycle phase that produced an `AnalysisUpdated` event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisPhase {
    /// Ranking metrics published
    Metrics,
    /// Explanation breakdown patched in
    Explanations,
}

/// Severity of a transient user notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// SMC event types
///
/// Events are broadcast via EventBus and serialize with a `type` tag so they
/// can be forwarded verbatim to a browser or log sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SmcEvent {
    /// A poll tick delivered a fresh progress snapshot
    TaskProgress {
        kind: JobKind,
        task_id: String,
        state: TaskState,
    },

    /// Job reached `completed` and its refresh actions ran
    TaskCompleted { kind: JobKind, task_id: String },

    /// Job failed (server-reported or transport); the slot stops updating
    TaskFailed {
        kind: JobKind,
        task_id: String,
        message: String,
    },

    /// Authoritative candidate set re-fetched from the server
    CandidatesRefreshed { count: usize },

    /// Matcher roster replaced
    MatchersRefreshed { count: usize },

    /// History / ontology / value data re-fetched
    AuxiliaryRefreshed { data: AuxiliaryData },

    /// Matcher analyses replaced by an evaluation cycle
    AnalysisUpdated { sequence: u64, phase: AnalysisPhase },

    /// Incremental assistant text
    AgentDelta {
        stream_id: String,
        node: String,
        text: String,
    },

    /// Tool invocation or result from the assistant
    AgentTool {
        stream_id: String,
        payload: serde_json::Value,
    },

    /// Assistant produced its final snapshot
    AgentFinished {
        stream_id: String,
        snapshot: serde_json::Value,
    },

    /// Stream ended with an error
    AgentFailed { stream_id: String, message: String },

    /// Transient user-visible message
    Notification {
        level: NotificationLevel,
        message: String,
    },
}

impl SmcEvent {
    pub fn notify(level: NotificationLevel, message: impl Into<String>) -> Self {
        SmcEvent::Notification {
            level,
            message: message.into(),
        }
    }
}

/// Broadcast bus for `SmcEvent`
///
/// Cloning shares the underlying channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SmcEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// Slow subscribers lose the oldest events once `capacity` is exceeded.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<SmcEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(&self, event: SmcEvent) -> Result<usize, broadcast::error::SendError<SmcEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: SmcEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
