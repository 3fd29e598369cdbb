//! In-process fake matching server
//!
//! Serves the JSON endpoints and the agent event stream from scripted
//! responses on an ephemeral port, counting hits per route so tests can
//! assert which calls were (not) made.

#![allow(dead_code)]

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde_json::{json, Value};
use smc_client::SmcClient;
use smc_common::config::ClientConfig;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

pub const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Scripted agent stream for one query string
#[derive(Debug, Clone, Default)]
pub struct ScriptedStream {
    pub frames: Vec<String>,
    /// Keep the channel open after the last frame
    pub hold_open: bool,
    /// Reject the stream request with this status
    pub fail_status: Option<u16>,
}

#[derive(Debug, Default)]
struct FakeData {
    hits: HashMap<String, usize>,
    start_matching: Value,
    start_single: Value,
    statuses: HashMap<String, VecDeque<(u16, Value)>>,
    candidates: Value,
    matchers: Value,
    explanations: Value,
    explanation_requests: Vec<Value>,
    operations: Vec<Value>,
    streams: HashMap<String, ScriptedStream>,
    /// Held routes wait for a permit before answering
    gates: HashMap<String, Arc<Semaphore>>,
}

/// Handle to a running fake server
#[derive(Clone)]
pub struct FakeServer {
    addr: SocketAddr,
    data: Arc<Mutex<FakeData>>,
}

impl FakeServer {
    pub async fn start() -> Self {
        let data = Arc::new(Mutex::new(FakeData {
            start_matching: json!({"task_id": "t1"}),
            start_single: json!({"task_id": "single-1"}),
            candidates: json!([]),
            matchers: json!([]),
            explanations: json!([]),
            ..FakeData::default()
        }));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = FakeServer { addr, data };

        let app = router(server.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        server
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn client(&self) -> SmcClient {
        let config = ClientConfig::new(self.url(), "test-session").with_poll_interval(POLL_INTERVAL);
        SmcClient::connect(config).unwrap()
    }

    pub fn hits(&self, route: &str) -> usize {
        self.data.lock().unwrap().hits.get(route).copied().unwrap_or(0)
    }

    pub fn set_start_matching(&self, response: Value) {
        self.data.lock().unwrap().start_matching = response;
    }

    pub fn set_start_single(&self, task_id: &str) {
        self.data.lock().unwrap().start_single = json!({ "task_id": task_id });
    }

    /// Script status responses for `route` + `task_id`; the last one repeats
    pub fn script_status(&self, route: &str, task_id: &str, responses: Vec<Value>) {
        let script = responses.into_iter().map(|r| (200, r)).collect();
        self.data
            .lock()
            .unwrap()
            .statuses
            .insert(format!("{}:{}", route, task_id), script);
    }

    pub fn script_status_error(&self, route: &str, task_id: &str, status: u16) {
        self.data
            .lock()
            .unwrap()
            .statuses
            .insert(format!("{}:{}", route, task_id), VecDeque::from(vec![(status, json!({"detail": "server error"}))]));
    }

    pub fn set_candidates(&self, candidates: Value) {
        self.data.lock().unwrap().candidates = candidates;
    }

    pub fn set_matchers(&self, matchers: Value) {
        self.data.lock().unwrap().matchers = matchers;
    }

    pub fn set_explanations(&self, explanations: Value) {
        self.data.lock().unwrap().explanations = explanations;
    }

    pub fn explanation_requests(&self) -> Vec<Value> {
        self.data.lock().unwrap().explanation_requests.clone()
    }

    pub fn operations(&self) -> Vec<Value> {
        self.data.lock().unwrap().operations.clone()
    }

    /// Hold every response of `route` until [`FakeServer::release`]
    pub fn hold(&self, route: &str) {
        self.data
            .lock()
            .unwrap()
            .gates
            .insert(route.to_string(), Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self, route: &str) {
        if let Some(gate) = self.data.lock().unwrap().gates.remove(route) {
            gate.add_permits(1024);
        }
    }

    async fn pass_gate(&self, route: &str) {
        let gate = self.data.lock().unwrap().gates.get(route).cloned();
        if let Some(gate) = gate {
            let _ = gate.acquire().await;
        }
    }

    pub fn script_stream(&self, query: &str, stream: ScriptedStream) {
        self.data
            .lock()
            .unwrap()
            .streams
            .insert(query.to_string(), stream);
    }

    fn hit(&self, route: &str) {
        *self
            .data
            .lock()
            .unwrap()
            .hits
            .entry(route.to_string())
            .or_insert(0) += 1;
    }

    fn next_status(&self, route: &str, task_id: &str) -> (u16, Value) {
        self.hit(route);
        let mut data = self.data.lock().unwrap();
        match data.statuses.get_mut(&format!("{}:{}", route, task_id)) {
            Some(script) if script.len() > 1 => script.pop_front().unwrap(),
            Some(script) => script.front().cloned().unwrap(),
            None => (404, json!({"detail": "unknown task"})),
        }
    }
}

// ============================================================================
// Response builders
// ============================================================================

pub fn task_state(status: &str, progress: f64, step: &str) -> Value {
    json!({
        "status": status,
        "progress": progress,
        "current_step": step,
        "completed_steps": 0,
        "total_steps": 3,
        "logs": []
    })
}

pub fn matching_status(status: &str, progress: f64) -> Value {
    json!({"status": status, "taskState": task_state(status, progress, "matching")})
}

pub fn failed_status(message: &str) -> Value {
    json!({
        "status": "failed",
        "taskState": task_state("failed", 50.0, "matching"),
        "message": message
    })
}

pub fn candidate(source: &str, target: &str, matcher: &str, score: f64, status: &str) -> Value {
    json!({
        "sourceColumn": source,
        "targetColumn": target,
        "matcher": matcher,
        "score": score,
        "status": status
    })
}

pub fn sse_frame(event: &str, data: &str) -> String {
    format!("event: {}\ndata: {}\n\n", event, data)
}

/// Wait until `check` holds, failing the test after five seconds
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ============================================================================
// Routes
// ============================================================================

type TaskQuery = Query<HashMap<String, String>>;

fn router(server: FakeServer) -> Router {
    Router::new()
        .route("/api/matching/start", post(start_matching))
        .route("/api/matching/rematch", post(start_single))
        .route("/api/matchers/new", post(start_single))
        .route("/api/matching/status", get(matching_status_route))
        .route("/api/ontology/source/status", get(source_ontology_status))
        .route("/api/ontology/target/status", get(target_ontology_status))
        .route("/api/matchers/status", get(matcher_status_route))
        .route("/api/results", get(results))
        .route("/api/matchers", get(matchers))
        .route("/api/history", get(history))
        .route("/api/ontology/source", get(source_ontology))
        .route("/api/ontology/target", get(target_ontology))
        .route("/api/value/bins", get(value_bins))
        .route("/api/value/matches", get(value_matches))
        .route("/api/user-operation/apply", post(apply_operation))
        .route("/api/user-operation/undo", post(undo))
        .route("/api/user-operation/redo", post(redo))
        .route("/api/explanations/cached-summaries", post(cached_summaries))
        .route("/api/agent/stream", get(agent_stream))
        .with_state(server)
}

fn status_response((status, body): (u16, Value)) -> Response {
    let code = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (code, Json(body)).into_response()
}

fn task_id(query: &HashMap<String, String>) -> String {
    query.get("task_id").cloned().unwrap_or_default()
}

async fn start_matching(State(server): State<FakeServer>) -> Json<Value> {
    server.hit("start_matching");
    Json(server.data.lock().unwrap().start_matching.clone())
}

async fn start_single(State(server): State<FakeServer>) -> Json<Value> {
    server.hit("start_single");
    Json(server.data.lock().unwrap().start_single.clone())
}

async fn matching_status_route(State(server): State<FakeServer>, Query(query): TaskQuery) -> Response {
    status_response(server.next_status("matching_status", &task_id(&query)))
}

async fn source_ontology_status(State(server): State<FakeServer>, Query(query): TaskQuery) -> Response {
    status_response(server.next_status("source_ontology_status", &task_id(&query)))
}

async fn target_ontology_status(State(server): State<FakeServer>, Query(query): TaskQuery) -> Response {
    status_response(server.next_status("target_ontology_status", &task_id(&query)))
}

async fn matcher_status_route(State(server): State<FakeServer>, Query(query): TaskQuery) -> Response {
    status_response(server.next_status("matcher_status", &task_id(&query)))
}

async fn results(State(server): State<FakeServer>) -> Json<Value> {
    server.hit("results");
    server.pass_gate("results").await;
    let candidates = server.data.lock().unwrap().candidates.clone();
    Json(json!({"results": {"candidates": candidates}}))
}

async fn matchers(State(server): State<FakeServer>) -> Json<Value> {
    server.hit("matchers");
    let matchers = server.data.lock().unwrap().matchers.clone();
    Json(json!({ "matchers": matchers }))
}

async fn history(State(server): State<FakeServer>) -> Json<Value> {
    server.hit("history");
    let count = server.data.lock().unwrap().operations.len();
    Json(json!({"history": vec![json!({"operation": "accept"}); count]}))
}

async fn source_ontology(State(server): State<FakeServer>) -> Json<Value> {
    server.hit("source_ontology");
    Json(json!({"results": {"side": "source"}}))
}

async fn target_ontology(State(server): State<FakeServer>) -> Json<Value> {
    server.hit("target_ontology");
    Json(json!({"results": {"side": "target"}}))
}

async fn value_bins(State(server): State<FakeServer>) -> Json<Value> {
    server.hit("value_bins");
    Json(json!({"results": []}))
}

async fn value_matches(State(server): State<FakeServer>) -> Json<Value> {
    server.hit("value_matches");
    Json(json!({"results": []}))
}

async fn apply_operation(State(server): State<FakeServer>, Json(body): Json<Value>) -> StatusCode {
    server.hit("apply");
    server.data.lock().unwrap().operations.push(body);
    StatusCode::OK
}

async fn undo(State(server): State<FakeServer>) -> StatusCode {
    server.hit("undo");
    server.data.lock().unwrap().operations.pop();
    StatusCode::OK
}

async fn redo(State(server): State<FakeServer>) -> StatusCode {
    server.hit("redo");
    StatusCode::OK
}

async fn cached_summaries(State(server): State<FakeServer>, Json(body): Json<Value>) -> Json<Value> {
    server.hit("cached_summaries");
    let mut data = server.data.lock().unwrap();
    data.explanation_requests.push(body);
    Json(json!({"cachedExplanationTypes": data.explanations.clone()}))
}

async fn agent_stream(State(server): State<FakeServer>, Query(query): Query<HashMap<String, String>>) -> Response {
    server.hit("agent_stream");
    server.pass_gate("agent_stream").await;
    let key = query.get("query").cloned().unwrap_or_default();
    let script = server
        .data
        .lock()
        .unwrap()
        .streams
        .get(&key)
        .cloned()
        .unwrap_or_default();

    if let Some(status) = script.fail_status {
        return status_response((status, json!({"detail": "stream rejected"})));
    }

    let frames = futures::stream::iter(script.frames.into_iter().map(Ok::<_, std::io::Error>));
    let body = if script.hold_open {
        Body::from_stream(frames.chain(futures::stream::pending()))
    } else {
        Body::from_stream(frames)
    };

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(body)
        .unwrap()
}
