//! # SMC Common Library
//!
//! Shared code for the schema-matching curator client including:
//! - Candidate / matcher / ground-truth data model
//! - Job progress snapshots (TaskState) and job kinds
//! - Event types (SmcEvent enum) and the EventBus
//! - Configuration loading

pub mod config;
pub mod error;
pub mod events;
pub mod model;
pub mod task;

pub use error::{Error, Result};
pub use model::{
    AggregatedCandidate, Candidate, CandidateStatus, Explanation, ExplanationBreakdown,
    ExplanationSummary, ExplanationType, GroundTruth, Matcher, MatcherAnalysis,
};
pub use task::{JobKind, TaskLog, TaskState, TaskStatus};
