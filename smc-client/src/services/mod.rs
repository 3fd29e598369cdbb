//! Client services
//!
//! - `poller`: fixed-interval job status loop with a stop handle
//! - `job_coordinator`: per-kind progress slots and completion refreshes
//! - `agent_stream`: conversational push channel and chat transcript
//! - `evaluation`: matcher ranking metrics and explanation attribution

pub mod agent_stream;
pub mod evaluation;
pub mod job_coordinator;
pub mod poller;

pub use agent_stream::{
    AgentStream, ChatTranscript, ChatTurn, SnapshotJobs, StreamHandle, TextSegment, TurnState, RAW_TEXT_NODE,
};
pub use evaluation::{compute_ranking_metrics, EvaluationEngine, EvaluationOutcome, EXACT_MATCH_MATCHER};
pub use job_coordinator::{JobCallback, JobCoordinator, MatchingHooks, StartedMatching};
pub use poller::{JobPoller, JobStatus, PollHandle, PollObserver, PollOutcome, StatusEndpoint};
