//! Shared session state
//!
//! Written by job completion handlers and the agent stream, read by the
//! evaluation engine and display collaborators. Candidates and the matcher
//! roster are only ever replaced with a fresh server copy, so concurrent
//! refreshes are idempotent regardless of order.

use serde_json::Value;
use smc_common::model::aggregate_candidates;
use smc_common::{
    AggregatedCandidate, Candidate, ExplanationBreakdown, GroundTruth, JobKind, Matcher,
    MatcherAnalysis, TaskState,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};

use crate::api::OntologySide;

#[derive(Debug, Default)]
struct SessionData {
    candidates: Vec<Candidate>,
    matchers: Vec<Matcher>,
    task_states: BTreeMap<JobKind, TaskState>,
    task_ids: BTreeMap<JobKind, String>,
    history: Vec<Value>,
    source_ontology: Option<Value>,
    target_ontology: Option<Value>,
    value_bins: Option<Value>,
    value_matches: Option<Value>,
    analyses: Vec<MatcherAnalysis>,
}

/// Inputs of one evaluation cycle, captured at one instant
#[derive(Debug, Clone)]
pub struct EvaluationSnapshot {
    pub candidates: Vec<Candidate>,
    pub enabled_matchers: Vec<Matcher>,
}

/// Handle to the session's client-side state (cheap to clone)
#[derive(Clone)]
pub struct SessionState {
    session_name: Arc<str>,
    inner: Arc<RwLock<SessionData>>,
    /// Bumped whenever an evaluation input (candidates, roster) changes
    revision: Arc<watch::Sender<u64>>,
}

impl SessionState {
    pub fn new(session_name: impl Into<String>) -> Self {
        let (tx, _) = watch::channel(0);
        Self {
            session_name: Arc::from(session_name.into()),
            inner: Arc::new(RwLock::new(SessionData::default())),
            revision: Arc::new(tx),
        }
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    // ========================================================================
    // Evaluation inputs
    // ========================================================================

    pub async fn candidates(&self) -> Vec<Candidate> {
        self.inner.read().await.candidates.clone()
    }

    /// Replace the candidate set with the server's copy
    pub async fn set_candidates(&self, candidates: Vec<Candidate>) {
        self.inner.write().await.candidates = candidates;
        self.bump_revision();
    }

    pub async fn ground_truth(&self) -> GroundTruth {
        GroundTruth::from_candidates(&self.inner.read().await.candidates)
    }

    pub async fn aggregated_candidates(&self) -> Vec<AggregatedCandidate> {
        aggregate_candidates(&self.inner.read().await.candidates)
    }

    pub async fn matchers(&self) -> Vec<Matcher> {
        self.inner.read().await.matchers.clone()
    }

    /// Replace the roster, keeping local enable/disable toggles by name
    pub async fn set_matchers(&self, matchers: Vec<Matcher>) {
        self.set_matchers_if(matchers, || true).await;
    }

    /// Replace the roster unless `is_current` fails under the write lock
    pub async fn set_matchers_if(&self, matchers: Vec<Matcher>, is_current: impl FnOnce() -> bool) -> bool {
        let mut data = self.inner.write().await;
        if !is_current() {
            return false;
        }
        let toggles: HashMap<String, bool> = data
            .matchers
            .iter()
            .map(|m| (m.name.clone(), m.enabled))
            .collect();
        data.matchers = matchers
            .into_iter()
            .map(|mut m| {
                if let Some(enabled) = toggles.get(&m.name) {
                    m.enabled = *enabled;
                }
                m
            })
            .collect();
        drop(data);
        self.bump_revision();
        true
    }

    /// Toggle a matcher in or out of evaluation; returns false if unknown
    pub async fn set_matcher_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut data = self.inner.write().await;
        let Some(matcher) = data.matchers.iter_mut().find(|m| m.name == name) else {
            return false;
        };
        if matcher.enabled == enabled {
            return true;
        }
        matcher.enabled = enabled;
        drop(data);
        self.bump_revision();
        true
    }

    pub async fn evaluation_snapshot(&self) -> EvaluationSnapshot {
        let data = self.inner.read().await;
        EvaluationSnapshot {
            candidates: data.candidates.clone(),
            enabled_matchers: data.matchers.iter().filter(|m| m.enabled).cloned().collect(),
        }
    }

    pub fn subscribe_revisions(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    fn bump_revision(&self) {
        self.revision.send_modify(|r| *r += 1);
    }

    // ========================================================================
    // Job progress slots
    // ========================================================================

    /// Overwrite one job kind's progress slot
    pub async fn set_task_state(&self, kind: JobKind, task_id: &str, state: TaskState) {
        self.set_task_state_if(kind, task_id, state, || true).await;
    }

    /// Write a progress slot only if `is_current` still holds under the write lock
    pub async fn set_task_state_if(
        &self,
        kind: JobKind,
        task_id: &str,
        state: TaskState,
        is_current: impl FnOnce() -> bool,
    ) -> bool {
        let mut data = self.inner.write().await;
        if !is_current() {
            return false;
        }
        data.task_states.insert(kind, state);
        data.task_ids.insert(kind, task_id.to_string());
        true
    }

    pub async fn task_state(&self, kind: JobKind) -> Option<TaskState> {
        self.inner.read().await.task_states.get(&kind).cloned()
    }

    pub async fn task_id(&self, kind: JobKind) -> Option<String> {
        self.inner.read().await.task_ids.get(&kind).cloned()
    }

    pub async fn task_states(&self) -> BTreeMap<JobKind, TaskState> {
        self.inner.read().await.task_states.clone()
    }

    // ========================================================================
    // Auxiliary display data
    // ========================================================================

    pub async fn set_history(&self, history: Vec<Value>) {
        self.inner.write().await.history = history;
    }

    pub async fn history(&self) -> Vec<Value> {
        self.inner.read().await.history.clone()
    }

    pub async fn set_ontology(&self, side: OntologySide, ontology: Value) {
        let mut data = self.inner.write().await;
        match side {
            OntologySide::Source => data.source_ontology = Some(ontology),
            OntologySide::Target => data.target_ontology = Some(ontology),
        }
    }

    pub async fn ontology(&self, side: OntologySide) -> Option<Value> {
        let data = self.inner.read().await;
        match side {
            OntologySide::Source => data.source_ontology.clone(),
            OntologySide::Target => data.target_ontology.clone(),
        }
    }

    pub async fn set_value_bins(&self, bins: Value) {
        self.inner.write().await.value_bins = Some(bins);
    }

    pub async fn value_bins(&self) -> Option<Value> {
        self.inner.read().await.value_bins.clone()
    }

    pub async fn set_value_matches(&self, matches: Value) {
        self.inner.write().await.value_matches = Some(matches);
    }

    pub async fn value_matches(&self) -> Option<Value> {
        self.inner.read().await.value_matches.clone()
    }

    // ========================================================================
    // Matcher analyses
    // ========================================================================

    pub async fn analyses(&self) -> Vec<MatcherAnalysis> {
        self.inner.read().await.analyses.clone()
    }

    /// Replace the analysis set wholesale if `is_current` still holds
    ///
    /// The check runs under the write lock, so two cycles can never
    /// interleave between check and apply.
    pub async fn replace_analyses_if(
        &self,
        analyses: Vec<MatcherAnalysis>,
        is_current: impl FnOnce() -> bool,
    ) -> bool {
        let mut data = self.inner.write().await;
        if !is_current() {
            return false;
        }
        data.analyses = analyses;
        true
    }

    /// Swap in a new analysis set carrying the given breakdowns
    ///
    /// Analyses are never edited in place; readers holding the previous set
    /// keep seeing it unchanged.
    pub async fn patch_breakdowns_if(
        &self,
        breakdowns: &HashMap<String, ExplanationBreakdown>,
        is_current: impl FnOnce() -> bool,
    ) -> bool {
        let mut data = self.inner.write().await;
        if !is_current() {
            return false;
        }
        let patched = data
            .analyses
            .iter()
            .map(|analysis| MatcherAnalysis {
                explanation_breakdown: breakdowns
                    .get(&analysis.name)
                    .cloned()
                    .or_else(|| analysis.explanation_breakdown.clone()),
                ..analysis.clone()
            })
            .collect();
        data.analyses = patched;
        true
    }
}
