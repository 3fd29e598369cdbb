//! Job coordinator integration tests
//!
//! Drive the real HTTP client against the fake server: composite matching,
//! per-kind progress slots, failure isolation and user operations.

mod helpers;

use helpers::*;
use serde_json::json;
use smc_client::api::{
    ColumnPair, ExplanationSource, HttpMatchingApi, MatchingUpload, NewMatcherRequest, OperationKind,
    UploadFile, UserOperation,
};
use smc_client::services::{JobCallback, MatchingHooks};
use smc_client::ClientError;
use smc_common::config::ClientConfig;
use smc_common::events::SmcEvent;
use smc_common::{Candidate, CandidateStatus, JobKind, TaskStatus};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

fn upload() -> MatchingUpload {
    MatchingUpload::new(UploadFile::new("source.csv", b"a,b\n1,2\n".to_vec()), None)
}

/// Callback that forwards its result to a oneshot receiver
fn forward() -> (JobCallback, oneshot::Receiver<Result<(), ClientError>>) {
    let (tx, rx) = oneshot::channel();
    let callback: JobCallback = Box::new(move |result| {
        let _ = tx.send(result);
    });
    (callback, rx)
}

/// Callback that counts its invocations
fn counting(counter: &Arc<AtomicUsize>) -> JobCallback {
    let counter = Arc::clone(counter);
    Box::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    })
}

async fn recv<T>(rx: oneshot::Receiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("callback not invoked in time")
        .expect("callback dropped without result")
}

// ============================================================================
// Composite matching
// ============================================================================

#[tokio::test]
async fn tc_coord_001_only_task_id_starts_single_poller() {
    // Given: start returns only a task id, and the caller supplies all hooks
    let server = FakeServer::start().await;
    server.set_start_matching(json!({"task_id": "t1"}));
    server.script_status(
        "matching_status",
        "t1",
        vec![matching_status("running", 40.0), matching_status("completed", 100.0)],
    );
    server.set_candidates(json!([candidate("A", "X", "m1", 0.9, "idle")]));
    let client = server.client();

    let ontology_calls = Arc::new(AtomicUsize::new(0));
    let (on_complete, done) = forward();
    let hooks = MatchingHooks {
        on_complete: Some(on_complete),
        on_source_ontology: Some(counting(&ontology_calls)),
        on_target_ontology: Some(counting(&ontology_calls)),
    };

    // When: composite matching runs to completion
    let started = client.coordinator.start_matching(upload(), hooks).await.unwrap();
    recv(done).await.unwrap();

    // Then: exactly one poller, no ontology tracking
    assert_eq!(started.task_id, "t1");
    assert!(started.source_ontology_task_id.is_none());
    assert!(started.target_ontology_task_id.is_none());
    assert_eq!(
        client.coordinator.tracked_jobs().await,
        vec![(JobKind::Matching, "t1".to_string())]
    );
    assert_eq!(server.hits("source_ontology_status"), 0);
    assert_eq!(server.hits("target_ontology_status"), 0);
    assert_eq!(server.hits("source_ontology"), 0);
    assert_eq!(ontology_calls.load(Ordering::SeqCst), 0);

    // And: the completion refresh ran
    assert_eq!(client.state.candidates().await.len(), 1);
    for route in ["results", "history", "target_ontology", "value_bins", "value_matches"] {
        assert_eq!(server.hits(route), 1, "{} should be refreshed once", route);
    }
    let slot = client.state.task_state(JobKind::Matching).await.unwrap();
    assert_eq!(slot.status, TaskStatus::Completed);
}

#[tokio::test]
async fn tc_coord_002_ontology_jobs_use_independent_slots() {
    // Given: start returns ids for both ontology sub-jobs
    let server = FakeServer::start().await;
    server.set_start_matching(json!({
        "task_id": "t1",
        "source_ontology_task_id": "s1",
        "target_ontology_task_id": "g1"
    }));
    server.script_status("matching_status", "t1", vec![matching_status("completed", 100.0)]);
    server.script_status(
        "source_ontology_status",
        "s1",
        vec![json!({"status": "completed", "taskState": task_state("completed", 100.0, "source")})],
    );
    server.script_status(
        "target_ontology_status",
        "g1",
        vec![
            json!({"status": "running", "taskState": task_state("running", 30.0, "target")}),
            json!({"status": "failed", "taskState": task_state("failed", 30.0, "target"), "message": "no schema"}),
        ],
    );
    let client = server.client();

    let (on_complete, matching_done) = forward();
    let (on_source, source_done) = forward();
    let (on_target, target_done) = forward();
    let hooks = MatchingHooks {
        on_complete: Some(on_complete),
        on_source_ontology: Some(on_source),
        on_target_ontology: Some(on_target),
    };

    // When
    client.coordinator.start_matching(upload(), hooks).await.unwrap();

    // Then: each job reports independently
    recv(matching_done).await.unwrap();
    recv(source_done).await.unwrap();
    match recv(target_done).await {
        Err(ClientError::JobFailed(message)) => assert_eq!(message, "no schema"),
        other => panic!("expected target ontology failure, got {:?}", other),
    }

    let states = client.state.task_states().await;
    assert_eq!(states[&JobKind::Matching].status, TaskStatus::Completed);
    assert_eq!(states[&JobKind::SourceOntology].current_step, "source");
    assert_eq!(states[&JobKind::TargetOntology].status, TaskStatus::Failed);

    // And: the source ontology got its second fetch
    assert_eq!(server.hits("source_ontology"), 1);
    assert!(client.state.ontology(smc_client::api::OntologySide::Source).await.is_some());
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn tc_coord_003_failed_job_reports_once_and_can_repoll() {
    // Given: a job that fails with "boom" and a previously cached candidate set
    let server = FakeServer::start().await;
    server.script_status(
        "matching_status",
        "t1",
        vec![matching_status("running", 10.0), failed_status("boom")],
    );
    let client = server.client();
    client
        .state
        .set_candidates(vec![Candidate::new("A", "X", "m1", 0.5)])
        .await;

    let failures = Arc::new(AtomicUsize::new(0));
    let (callback, done) = forward();
    let failures_in_callback = Arc::clone(&failures);
    let callback: JobCallback = Box::new(move |result| {
        if result.is_err() {
            failures_in_callback.fetch_add(1, Ordering::SeqCst);
        }
        callback(result);
    });

    // When
    client
        .coordinator
        .track_matching(JobKind::Matching, "t1", Some(callback))
        .await;

    // Then: onError("boom") exactly once
    match recv(done).await {
        Err(ClientError::JobFailed(message)) => assert_eq!(message, "boom"),
        other => panic!("expected job failure, got {:?}", other),
    }
    let polls_at_failure = server.hits("matching_status");
    tokio::time::sleep(POLL_INTERVAL * 5).await;
    assert_eq!(server.hits("matching_status"), polls_at_failure, "polling must stop");
    assert_eq!(failures.load(Ordering::SeqCst), 1);

    // And: cached results were left untouched
    assert_eq!(server.hits("results"), 0);
    assert_eq!(client.state.candidates().await.len(), 1);
    let coordinator = client.coordinator.clone();
    eventually("poller to finish", || {
        let coordinator = coordinator.clone();
        async move { coordinator.active_jobs().await.is_empty() }
    })
    .await;

    // When: the same task id is polled again after the server recovered
    server.script_status("matching_status", "t1", vec![matching_status("completed", 100.0)]);
    let (callback, done) = forward();
    client
        .coordinator
        .track_matching(JobKind::Matching, "t1", Some(callback))
        .await;

    // Then: no latched failure
    recv(done).await.unwrap();
    assert_eq!(server.hits("results"), 1);
}

#[tokio::test]
async fn tc_coord_004_transport_error_ends_loop() {
    // Given: the status endpoint answers 500
    let server = FakeServer::start().await;
    server.script_status_error("matching_status", "t1", 500);
    let client = server.client();

    // When
    let (callback, done) = forward();
    client
        .coordinator
        .track_matching(JobKind::Matching, "t1", Some(callback))
        .await;

    // Then: surfaced as an error after a single request
    match recv(done).await {
        Err(ClientError::Api { status, .. }) => assert_eq!(status, 500),
        other => panic!("expected API error, got {:?}", other),
    }
    tokio::time::sleep(POLL_INTERVAL * 3).await;
    assert_eq!(server.hits("matching_status"), 1);
}

#[tokio::test]
async fn tc_coord_005_completed_compile_without_matchers_is_malformed() {
    // Given: compilation reports completed but omits the matcher list
    let server = FakeServer::start().await;
    server.set_start_single("c1");
    server.script_status(
        "matcher_status",
        "c1",
        vec![json!({"status": "completed", "taskState": task_state("completed", 100.0, "compile")})],
    );
    let client = server.client();

    // When
    let (callback, done) = forward();
    let request = NewMatcherRequest {
        name: "custom".to_string(),
        code: "def match(): pass".to_string(),
        params: json!({}),
    };
    client
        .coordinator
        .start_matcher_compile(request, Some(callback))
        .await
        .unwrap();

    // Then
    assert!(matches!(recv(done).await, Err(ClientError::Malformed(_))));
    assert!(client.state.matchers().await.is_empty());
}

// ============================================================================
// Single-job variants
// ============================================================================

#[tokio::test]
async fn tc_coord_006_matcher_compile_replaces_roster() {
    // Given
    let server = FakeServer::start().await;
    server.set_start_single("c1");
    server.script_status(
        "matcher_status",
        "c1",
        vec![
            json!({"status": "started", "taskState": task_state("running", 50.0, "compile")}),
            json!({
                "status": "completed",
                "taskState": task_state("completed", 100.0, "compile"),
                "matchers": [{"name": "magneto"}, {"name": "custom", "weight": 0.5}]
            }),
        ],
    );
    let client = server.client();

    // When
    let (callback, done) = forward();
    let request = NewMatcherRequest {
        name: "custom".to_string(),
        code: "def match(): pass".to_string(),
        params: json!({"threshold": 0.5}),
    };
    let task_id = client
        .coordinator
        .start_matcher_compile(request, Some(callback))
        .await
        .unwrap();
    recv(done).await.unwrap();

    // Then
    assert_eq!(task_id, "c1");
    let names: Vec<String> = client.state.matchers().await.into_iter().map(|m| m.name).collect();
    assert_eq!(names, vec!["magneto".to_string(), "custom".to_string()]);
    assert!(client.state.task_state(JobKind::Matching).await.is_none());
}

#[tokio::test]
async fn tc_coord_007_rematch_supersedes_previous_rematch() {
    // Given: a first rematch that never finishes
    let server = FakeServer::start().await;
    server.set_start_single("r1");
    server.script_status("matching_status", "r1", vec![matching_status("running", 10.0)]);
    server.script_status("matching_status", "r2", vec![matching_status("completed", 100.0)]);
    let client = server.client();

    let first_calls = Arc::new(AtomicUsize::new(0));
    let nodes = vec!["patient_age".to_string()];
    client
        .coordinator
        .start_rematch(&nodes, Some(counting(&first_calls)))
        .await
        .unwrap();
    eventually("first rematch to poll", || {
        let server = server.clone();
        async move { server.hits("matching_status") > 0 }
    })
    .await;

    // When: a second rematch starts in the same slot
    server.set_start_single("r2");
    let (callback, done) = forward();
    client.coordinator.start_rematch(&nodes, Some(callback)).await.unwrap();
    recv(done).await.unwrap();

    // Then: the slot belongs to the second job and the first is silent
    assert_eq!(client.state.task_id(JobKind::Rematch).await.as_deref(), Some("r2"));
    assert_eq!(
        client.state.task_state(JobKind::Rematch).await.unwrap().status,
        TaskStatus::Completed
    );
    tokio::time::sleep(POLL_INTERVAL * 3).await;
    assert_eq!(first_calls.load(Ordering::SeqCst), 0);
    assert!(client.coordinator.active_jobs().await.is_empty());
}

#[tokio::test]
async fn tc_coord_008_rematch_requires_nodes() {
    let server = FakeServer::start().await;
    let client = server.client();

    let result = client.coordinator.start_rematch(&[], None).await;

    assert!(matches!(result, Err(ClientError::InvalidRequest(_))));
    assert_eq!(server.hits("start_single"), 0);
}

// ============================================================================
// User operations
// ============================================================================

#[tokio::test]
async fn tc_coord_009_operations_round_trip_through_server() {
    // Given
    let server = FakeServer::start().await;
    server.set_candidates(json!([candidate("A", "X", "m1", 0.9, "accepted")]));
    let client = server.client();
    let operation = UserOperation {
        operation: OperationKind::Accept,
        candidate: Candidate::new("A", "X", "m1", 0.9),
        references: vec![],
    };

    // When: apply then undo
    client.coordinator.apply_operation(&operation).await.unwrap();

    // Then: local view comes from the server after each call
    assert_eq!(server.operations().len(), 1);
    assert_eq!(server.operations()[0]["session_name"], "test-session");
    assert_eq!(server.operations()[0]["operation"], "accept");
    let candidates = client.state.candidates().await;
    assert_eq!(candidates[0].status, CandidateStatus::Accepted);
    assert_eq!(client.state.history().await.len(), 1);

    client.coordinator.undo().await.unwrap();
    assert_eq!(client.state.history().await.len(), 0);
    assert_eq!(server.hits("results"), 2);

    client.coordinator.redo().await.unwrap();
    assert_eq!(server.hits("redo"), 1);
    assert_eq!(server.hits("results"), 3);
}

// ============================================================================
// Explanation cache
// ============================================================================

#[tokio::test]
async fn tc_coord_010_empty_explanation_request_makes_no_call() {
    let server = FakeServer::start().await;
    let api = HttpMatchingApi::new(&ClientConfig::new(server.url(), "test-session")).unwrap();

    let summaries = api.cached_explanation_summaries(&[]).await.unwrap();

    assert!(summaries.is_empty());
    assert_eq!(server.hits("cached_summaries"), 0);
}

#[tokio::test]
async fn tc_coord_011_explanation_request_is_batched() {
    // Given
    let server = FakeServer::start().await;
    server.set_explanations(json!([{
        "sourceColumn": "A",
        "targetColumn": "X",
        "explanations": [{"type": "semantic", "isMatch": true, "confidence": 0.8}]
    }]));
    let api = HttpMatchingApi::new(&ClientConfig::new(server.url(), "test-session")).unwrap();

    // When
    let pairs = vec![ColumnPair::new("A", "X"), ColumnPair::new("B", "Y")];
    let summaries = api.cached_explanation_summaries(&pairs).await.unwrap();

    // Then: one request carrying both pairs
    assert_eq!(server.hits("cached_summaries"), 1);
    let request = &server.explanation_requests()[0];
    assert_eq!(request["session_name"], "test-session");
    assert_eq!(request["pairs"].as_array().unwrap().len(), 2);
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].explanations[0].confidence, 0.8);
}

#[tokio::test]
async fn tc_coord_012_evaluation_uses_refreshed_state() {
    // Given: accepted ground truth on the server
    let server = FakeServer::start().await;
    server.set_candidates(json!([
        candidate("A", "X", "m1", 0.9, "accepted"),
        candidate("A", "Y", "m1", 0.95, "idle"),
        candidate("A", "X", "candidate_quadrants", 1.0, "idle")
    ]));
    server.set_matchers(json!([{"name": "m1"}, {"name": "candidate_quadrants"}]));
    let client = server.client();

    // When
    client.coordinator.refresh_candidates_and_history().await;
    client.coordinator.refresh_matchers().await.unwrap();
    client.evaluation.evaluate().await.unwrap();

    // Then: the only ground-truth pair is an exact match, so no evidence fetch
    assert_eq!(server.hits("cached_summaries"), 0);
    let analyses = client.state.analyses().await;
    assert_eq!(analyses.len(), 2);
    assert_eq!(analyses[0].mrr, 0.5);
    let breakdown = analyses[0].explanation_breakdown.as_ref().unwrap();
    assert_eq!(breakdown.exact_match_score, 0.9);
}

#[tokio::test]
async fn tc_coord_013_job_superseded_during_completion_stays_silent() {
    // Given: a rematch that completed but whose result refresh is still in flight
    let server = FakeServer::start().await;
    server.hold("results");
    server.set_start_single("r1");
    server.script_status("matching_status", "r1", vec![matching_status("completed", 100.0)]);
    server.script_status("matching_status", "r2", vec![matching_status("running", 40.0)]);
    let client = server.client();
    let mut events = client.events.subscribe();

    let first_calls = Arc::new(AtomicUsize::new(0));
    let nodes = vec!["patient_age".to_string()];
    client
        .coordinator
        .start_rematch(&nodes, Some(counting(&first_calls)))
        .await
        .unwrap();
    eventually("first rematch to start refreshing", || {
        let server = server.clone();
        async move { server.hits("results") > 0 }
    })
    .await;

    // When: a second rematch takes the slot before the refresh returns
    server.set_start_single("r2");
    client.coordinator.start_rematch(&nodes, None).await.unwrap();
    server.release("results");
    let state = client.state.clone();
    eventually("second rematch to report progress", || {
        let state = state.clone();
        async move {
            state
                .task_state(JobKind::Rematch)
                .await
                .is_some_and(|s| s.status == TaskStatus::Running)
        }
    })
    .await;
    tokio::time::sleep(POLL_INTERVAL * 5).await;

    // Then: the first job never reports completion and never touches the slot
    assert_eq!(first_calls.load(Ordering::SeqCst), 0);
    assert_eq!(client.state.task_id(JobKind::Rematch).await.as_deref(), Some("r2"));
    assert_eq!(
        client.state.task_state(JobKind::Rematch).await.unwrap().status,
        TaskStatus::Running
    );
    while let Ok(event) = events.try_recv() {
        if let SmcEvent::TaskCompleted { kind, task_id } = event {
            panic!("unexpected completion for {} {}", kind, task_id);
        }
    }
}
