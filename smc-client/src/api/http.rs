//! HTTP implementation of the matching server API

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use serde::Serialize;
use smc_common::config::ClientConfig;
use smc_common::{Candidate, ExplanationSummary, Matcher};
use std::time::Duration;

use super::sse::{frame_stream, SseStream};
use super::types::*;
use super::{ExplanationSource, MatchingApi};
use crate::error::{ClientError, ClientResult};

const USER_AGENT: &str = concat!("smc-client/", env!("CARGO_PKG_VERSION"));
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// POST body carrying the session name next to the request fields
#[derive(Serialize)]
struct SessionScoped<'a, B: Serialize> {
    session_name: &'a str,
    #[serde(flatten)]
    body: &'a B,
}

#[derive(Serialize)]
struct RematchBody<'a> {
    nodes: &'a [String],
}

#[derive(Serialize)]
struct ExplanationPairsBody<'a> {
    pairs: &'a [ColumnPair],
}

#[derive(Serialize)]
struct EmptyBody {}

/// Matching server client bound to one session
#[derive(Clone)]
pub struct HttpMatchingApi {
    http_client: reqwest::Client,
    /// No overall timeout: push channels stay open as long as the agent works
    stream_client: reqwest::Client,
    base_url: String,
    session_name: String,
}

impl HttpMatchingApi {
    pub fn new(config: &ClientConfig) -> ClientResult<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let stream_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        Ok(Self {
            http_client,
            stream_client,
            base_url: config.server_url.trim_end_matches('/').to_string(),
            session_name: config.session_name.clone(),
        })
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> ClientResult<T> {
        tracing::debug!(path = path, "GET");
        let response = self
            .http_client
            .get(self.url(path))
            .query(&[("session_name", self.session_name.as_str())])
            .query(query)
            .send()
            .await?;
        decode_response(path, response).await
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> ClientResult<T> {
        tracing::debug!(path = path, "POST");
        let response = self
            .http_client
            .post(self.url(path))
            .json(&SessionScoped {
                session_name: &self.session_name,
                body,
            })
            .send()
            .await?;
        decode_response(path, response).await
    }

    async fn post_expect_ok<B: Serialize>(&self, path: &str, body: &B) -> ClientResult<()> {
        tracing::debug!(path = path, "POST");
        let response = self
            .http_client
            .post(self.url(path))
            .json(&SessionScoped {
                session_name: &self.session_name,
                body,
            })
            .send()
            .await?;
        check_status(path, response).await.map(|_| ())
    }
}

/// Reject non-2xx responses with their body text
async fn check_status(path: &str, response: reqwest::Response) -> ClientResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    tracing::warn!(path = path, status = status.as_u16(), "Server returned error status");
    Err(ClientError::Api {
        status: status.as_u16(),
        body,
    })
}

/// Decode a JSON body, treating a shape mismatch as a hard error
async fn decode_response<T: DeserializeOwned>(
    path: &str,
    response: reqwest::Response,
) -> ClientResult<T> {
    let response = check_status(path, response).await?;
    let text = response.text().await?;
    serde_json::from_str(&text).map_err(|e| {
        tracing::error!(path = path, error = %e, "Malformed response payload");
        ClientError::Malformed(format!("{}: {}", path, e))
    })
}

#[async_trait]
impl MatchingApi for HttpMatchingApi {
    async fn start_matching(&self, upload: MatchingUpload) -> ClientResult<StartMatchingResponse> {
        if upload.source.bytes.is_empty() {
            return Err(ClientError::InvalidRequest("source file is empty".to_string()));
        }

        let mut form = Form::new()
            .text("session_name", self.session_name.clone())
            .text("type", upload.task_type.clone())
            .text("params", upload.params.to_string())
            .part(
                "source_csv",
                Part::bytes(upload.source.bytes).file_name(upload.source.file_name),
            );
        if let Some(target) = upload.target {
            form = form.part("target_csv", Part::bytes(target.bytes).file_name(target.file_name));
        }

        let path = "/api/matching/start";
        let response = self
            .http_client
            .post(self.url(path))
            .multipart(form)
            .send()
            .await?;
        let started: StartMatchingResponse = decode_response(path, response).await?;

        tracing::info!(
            task_id = %started.task_id,
            source_ontology = started.source_ontology_task_id.is_some(),
            target_ontology = started.target_ontology_task_id.is_some(),
            "Matching job started"
        );
        Ok(started)
    }

    async fn matching_status(&self, task_id: &str) -> ClientResult<MatchingStatusResponse> {
        self.get_json("/api/matching/status", &[("task_id", task_id)])
            .await
    }

    async fn ontology_status(
        &self,
        side: OntologySide,
        task_id: &str,
    ) -> ClientResult<OntologyStatusResponse> {
        let path = match side {
            OntologySide::Source => "/api/ontology/source/status",
            OntologySide::Target => "/api/ontology/target/status",
        };
        self.get_json(path, &[("task_id", task_id)]).await
    }

    async fn start_matcher_compile(&self, request: NewMatcherRequest) -> ClientResult<TaskStarted> {
        if request.name.trim().is_empty() {
            return Err(ClientError::InvalidRequest("matcher name is empty".to_string()));
        }
        self.post_json("/api/matchers/new", &request).await
    }

    async fn matcher_status(&self, task_id: &str) -> ClientResult<MatcherStatusResponse> {
        self.get_json("/api/matchers/status", &[("task_id", task_id)])
            .await
    }

    async fn start_rematch(&self, nodes: &[String]) -> ClientResult<TaskStarted> {
        self.post_json("/api/matching/rematch", &RematchBody { nodes })
            .await
    }

    async fn cached_results(&self) -> ClientResult<Vec<Candidate>> {
        let response: CachedResultsResponse = self.get_json("/api/results", &[]).await?;
        Ok(response.results.candidates)
    }

    async fn matchers(&self) -> ClientResult<Vec<Matcher>> {
        let response: MatchersResponse = self.get_json("/api/matchers", &[]).await?;
        Ok(response.matchers)
    }

    async fn operation_history(&self) -> ClientResult<Vec<serde_json::Value>> {
        let response: HistoryResponse = self.get_json("/api/history", &[]).await?;
        Ok(response.history)
    }

    async fn ontology(&self, side: OntologySide) -> ClientResult<serde_json::Value> {
        let path = match side {
            OntologySide::Source => "/api/ontology/source",
            OntologySide::Target => "/api/ontology/target",
        };
        let response: ResultsEnvelope = self.get_json(path, &[]).await?;
        Ok(response.results)
    }

    async fn value_bins(&self) -> ClientResult<serde_json::Value> {
        let response: ResultsEnvelope = self.get_json("/api/value/bins", &[]).await?;
        Ok(response.results)
    }

    async fn value_matches(&self) -> ClientResult<serde_json::Value> {
        let response: ResultsEnvelope = self.get_json("/api/value/matches", &[]).await?;
        Ok(response.results)
    }

    async fn apply_operation(&self, operation: &UserOperation) -> ClientResult<()> {
        self.post_expect_ok("/api/user-operation/apply", operation)
            .await
    }

    async fn undo(&self) -> ClientResult<()> {
        self.post_expect_ok("/api/user-operation/undo", &EmptyBody {})
            .await
    }

    async fn redo(&self) -> ClientResult<()> {
        self.post_expect_ok("/api/user-operation/redo", &EmptyBody {})
            .await
    }

    async fn open_agent_stream(&self, query: &AgentQuery) -> ClientResult<SseStream> {
        let path = "/api/agent/stream";
        let mut params: Vec<(&str, &str)> = vec![
            ("session_name", self.session_name.as_str()),
            ("query", query.query.as_str()),
        ];
        if let Some((source, target)) = &query.focus {
            params.push(("source_column", source.as_str()));
            params.push(("target_column", target.as_str()));
        }

        let response = self
            .stream_client
            .get(self.url(path))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .query(&params)
            .send()
            .await?;
        let response = check_status(path, response).await?;
        Ok(frame_stream(response))
    }
}

#[async_trait]
impl ExplanationSource for HttpMatchingApi {
    async fn cached_explanation_summaries(
        &self,
        pairs: &[ColumnPair],
    ) -> ClientResult<Vec<ExplanationSummary>> {
        if pairs.is_empty() {
            return Ok(Vec::new());
        }
        let response: CachedExplanationsResponse = self
            .post_json("/api/explanations/cached-summaries", &ExplanationPairsBody { pairs })
            .await?;
        Ok(response.cached_explanation_types)
    }
}
