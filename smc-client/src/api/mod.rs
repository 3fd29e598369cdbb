//! Matching server API
//!
//! The server is the source of truth for candidates, matchers and job state.
//! `MatchingApi` is the seam the coordinator and agent stream talk through;
//! `HttpMatchingApi` is the production implementation.

pub mod http;
pub mod sse;
pub mod types;

pub use http::HttpMatchingApi;
pub use sse::{SseDecoder, SseFrame, SseStream};
pub use types::*;

use async_trait::async_trait;
use smc_common::{Candidate, ExplanationSummary, Matcher};

use crate::error::ClientResult;

/// Endpoints consumed by the job coordinator and the agent stream
///
/// Every call is scoped to the session the implementation was built for.
#[async_trait]
pub trait MatchingApi: Send + Sync {
    /// Upload datasets and start the composite matching job
    async fn start_matching(&self, upload: MatchingUpload) -> ClientResult<StartMatchingResponse>;

    async fn matching_status(&self, task_id: &str) -> ClientResult<MatchingStatusResponse>;

    async fn ontology_status(
        &self,
        side: OntologySide,
        task_id: &str,
    ) -> ClientResult<OntologyStatusResponse>;

    async fn start_matcher_compile(&self, request: NewMatcherRequest) -> ClientResult<TaskStarted>;

    async fn matcher_status(&self, task_id: &str) -> ClientResult<MatcherStatusResponse>;

    /// Re-run matching for a subset of target nodes
    async fn start_rematch(&self, nodes: &[String]) -> ClientResult<TaskStarted>;

    /// Authoritative candidate set for the session
    async fn cached_results(&self) -> ClientResult<Vec<Candidate>>;

    async fn matchers(&self) -> ClientResult<Vec<Matcher>>;

    async fn operation_history(&self) -> ClientResult<Vec<serde_json::Value>>;

    async fn ontology(&self, side: OntologySide) -> ClientResult<serde_json::Value>;

    async fn value_bins(&self) -> ClientResult<serde_json::Value>;

    async fn value_matches(&self) -> ClientResult<serde_json::Value>;

    async fn apply_operation(&self, operation: &UserOperation) -> ClientResult<()>;

    async fn undo(&self) -> ClientResult<()>;

    async fn redo(&self) -> ClientResult<()>;

    /// Open the conversational push channel for one query
    async fn open_agent_stream(&self, query: &AgentQuery) -> ClientResult<SseStream>;
}

/// Batched lookup into the server's explanation cache
///
/// Split out from `MatchingApi` because it is the only endpoint the evaluation
/// engine needs.
#[async_trait]
pub trait ExplanationSource: Send + Sync {
    /// An empty `pairs` slice resolves to an empty list without any request
    async fn cached_explanation_summaries(
        &self,
        pairs: &[ColumnPair],
    ) -> ClientResult<Vec<ExplanationSummary>>;
}
