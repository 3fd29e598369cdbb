//! Background job progress types
//!
//! A `TaskState` is the structured progress snapshot the server reports for one
//! asynchronous job. The client keeps one snapshot per `JobKind`; every poll
//! tick overwrites it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Server-reported job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Queued, not yet picked up
    #[default]
    Pending,
    /// Executing (the server reports both "running" and "started")
    #[serde(alias = "started")]
    Running,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Any status string this client does not know about
    #[serde(other)]
    Unknown,
}

impl TaskStatus {
    /// `completed` and `failed` end a poll loop; everything else keeps it going
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// One line of a job's progress log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLog {
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub step: String,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub message: String,
}

/// Progress snapshot for one background job
///
/// Every field defaults so that a partially populated snapshot (early in a
/// job's life the server often sends only `status`) still deserializes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TaskState {
    #[serde(default)]
    pub status: TaskStatus,
    /// Percentage complete (0.0 - 100.0)
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub current_step: String,
    #[serde(default)]
    pub completed_steps: u32,
    #[serde(default)]
    pub total_steps: u32,
    #[serde(default)]
    pub logs: Vec<TaskLog>,
}

impl TaskState {
    /// Snapshot for a job that has been started but not yet polled
    pub fn pending() -> Self {
        Self::default()
    }

    /// Progress clamped into 0-100; servers occasionally overshoot on the last step
    pub fn clamped_progress(&self) -> f64 {
        self.progress.clamp(0.0, 100.0)
    }

    /// Most recent log entry, if any
    pub fn last_log(&self) -> Option<&TaskLog> {
        self.logs.last()
    }
}

/// Named progress slot owned by the job coordinator
///
/// Each kind has exactly one writer (its own poller), so slots never need to be
/// merged or ordered against each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Primary dataset matching
    Matching,
    /// Source ontology inference started alongside matching
    SourceOntology,
    /// Target ontology inference started alongside matching
    TargetOntology,
    /// Custom matcher compilation
    MatcherCompile,
    /// Re-matching a subset of target nodes
    Rematch,
}

impl JobKind {
    pub const ALL: [JobKind; 5] = [
        JobKind::Matching,
        JobKind::SourceOntology,
        JobKind::TargetOntology,
        JobKind::MatcherCompile,
        JobKind::Rematch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Matching => "matching",
            JobKind::SourceOntology => "source_ontology",
            JobKind::TargetOntology => "target_ontology",
            JobKind::MatcherCompile => "matcher_compile",
            JobKind::Rematch => "rematch",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
