//! Request / response shapes for the matching server
//!
//! Response structs mark the fields a caller depends on as required, so a
//! payload missing them fails to decode and surfaces as `ClientError::Malformed`
//! instead of silently turning into empty data.

use serde::{Deserialize, Serialize};
use smc_common::{Candidate, ExplanationSummary, Matcher, TaskState, TaskStatus};

/// Which side of the matching an ontology job / fetch refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OntologySide {
    Source,
    Target,
}

impl OntologySide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OntologySide::Source => "source",
            OntologySide::Target => "target",
        }
    }
}

/// File content sent with a matching request
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl UploadFile {
    pub fn new(file_name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            file_name: file_name.into(),
            bytes: bytes.into(),
        }
    }
}

/// Payload of a start-matching request
#[derive(Debug, Clone)]
pub struct MatchingUpload {
    /// Task type understood by the server (e.g. "matching")
    pub task_type: String,
    pub source: UploadFile,
    /// Omitted when matching against the server's built-in target schema
    pub target: Option<UploadFile>,
    pub params: serde_json::Value,
}

impl MatchingUpload {
    pub fn new(source: UploadFile, target: Option<UploadFile>) -> Self {
        Self {
            task_type: "matching".to_string(),
            source,
            target,
            params: serde_json::Value::Object(Default::default()),
        }
    }
}

/// start-matching response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartMatchingResponse {
    pub task_id: String,
    #[serde(default)]
    pub source_ontology_task_id: Option<String>,
    #[serde(default)]
    pub target_ontology_task_id: Option<String>,
}

/// Response of any single-job start call (matcher compile, rematch)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStarted {
    pub task_id: String,
}

/// poll-matching-status response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingStatusResponse {
    pub status: TaskStatus,
    #[serde(rename = "taskState", default)]
    pub task_state: TaskState,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub message: Option<String>,
}

/// poll-ontology-status response (source and target variants)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OntologyStatusResponse {
    pub status: TaskStatus,
    #[serde(rename = "taskState", default)]
    pub task_state: TaskState,
    #[serde(default)]
    pub message: Option<String>,
}

/// start-matcher-compile request body
#[derive(Debug, Clone, Serialize)]
pub struct NewMatcherRequest {
    pub name: String,
    pub code: String,
    pub params: serde_json::Value,
}

/// poll-matcher-status response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatcherStatusResponse {
    pub status: TaskStatus,
    #[serde(rename = "taskState", default)]
    pub task_state: TaskState,
    #[serde(default)]
    pub matchers: Option<Vec<Matcher>>,
    #[serde(default)]
    pub error: Option<String>,
}

/// cached-results response
#[derive(Debug, Clone, Deserialize)]
pub struct CachedResultsResponse {
    pub results: CachedResults,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CachedResults {
    pub candidates: Vec<Candidate>,
}

/// matchers() response
#[derive(Debug, Clone, Deserialize)]
pub struct MatchersResponse {
    pub matchers: Vec<Matcher>,
}

/// Ground-truth pair sent to the explanation cache
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnPair {
    pub source_column: String,
    pub target_column: String,
}

impl ColumnPair {
    pub fn new(source_column: impl Into<String>, target_column: impl Into<String>) -> Self {
        Self {
            source_column: source_column.into(),
            target_column: target_column.into(),
        }
    }
}

/// cached-explanation-summaries response
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedExplanationsResponse {
    pub cached_explanation_types: Vec<ExplanationSummary>,
}

/// user-operation-history response
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryResponse {
    pub history: Vec<serde_json::Value>,
}

/// Envelope shared by the ontology / value-bin / value-match endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct ResultsEnvelope {
    pub results: serde_json::Value,
}

/// Kind of curator decision sent to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Accept,
    Reject,
    Discard,
    Append,
    Prune,
}

/// A curator decision; the server applies it and the client re-fetches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserOperation {
    pub operation: OperationKind,
    pub candidate: Candidate,
    /// Other candidates touched by the operation (e.g. siblings pruned on accept)
    #[serde(default)]
    pub references: Vec<Candidate>,
}

/// One conversational query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentQuery {
    pub query: String,
    /// Optional (source column, target column) the question is about
    pub focus: Option<(String, String)>,
}

impl AgentQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            focus: None,
        }
    }

    pub fn with_focus(mut self, source_column: impl Into<String>, target_column: impl Into<String>) -> Self {
        self.focus = Some((source_column.into(), target_column.into()));
        self
    }
}
