//! Job stream coordinator
//!
//! Owns one progress slot per `JobKind` and one live poller per slot. The
//! composite matching flow can fan out into up to three pollers (matching plus
//! source/target ontology inference); each writes only its own slot. Terminal
//! results trigger refreshes that re-fetch the server's authoritative copy, so
//! completion handlers racing each other converge on the same state.

use async_trait::async_trait;
use smc_common::events::{AuxiliaryData, EventBus, NotificationLevel, SmcEvent};
use smc_common::{JobKind, Matcher, TaskState};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::poller::{JobPoller, JobStatus, PollHandle, PollObserver, StatusEndpoint};
use crate::api::{MatchingApi, MatchingUpload, NewMatcherRequest, OntologySide, UserOperation};
use crate::error::{ClientError, ClientResult};
use crate::state::SessionState;

/// Completion callback for one tracked job
pub type JobCallback = Box<dyn FnOnce(ClientResult<()>) + Send + 'static>;

/// Optional callbacks for the composite matching job
///
/// An ontology sub-job is only tracked when the server returned its id *and*
/// the matching callback is present.
#[derive(Default)]
pub struct MatchingHooks {
    pub on_complete: Option<JobCallback>,
    pub on_source_ontology: Option<JobCallback>,
    pub on_target_ontology: Option<JobCallback>,
}

/// Ids of the pollers a composite start actually launched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedMatching {
    pub task_id: String,
    pub source_ontology_task_id: Option<String>,
    pub target_ontology_task_id: Option<String>,
}

// ============================================================================
// Status endpoint adapters
// ============================================================================

struct MatchingStatusEndpoint {
    api: Arc<dyn MatchingApi>,
}

#[async_trait]
impl StatusEndpoint for MatchingStatusEndpoint {
    type Output = serde_json::Value;

    fn name(&self) -> &'static str {
        "matching"
    }

    async fn fetch(&self, task_id: &str) -> ClientResult<JobStatus<serde_json::Value>> {
        let response = self.api.matching_status(task_id).await?;
        Ok(JobStatus {
            status: response.status,
            task_state: response.task_state,
            // Results are re-fetched from the cache, the inline payload is optional
            output: Some(response.result.unwrap_or(serde_json::Value::Null)),
            message: response.message,
        })
    }
}

struct OntologyStatusEndpoint {
    api: Arc<dyn MatchingApi>,
    side: OntologySide,
}

#[async_trait]
impl StatusEndpoint for OntologyStatusEndpoint {
    type Output = ();

    fn name(&self) -> &'static str {
        match self.side {
            OntologySide::Source => "source_ontology",
            OntologySide::Target => "target_ontology",
        }
    }

    async fn fetch(&self, task_id: &str) -> ClientResult<JobStatus<()>> {
        let response = self.api.ontology_status(self.side, task_id).await?;
        Ok(JobStatus {
            status: response.status,
            task_state: response.task_state,
            output: Some(()),
            message: response.message,
        })
    }
}

struct MatcherStatusEndpoint {
    api: Arc<dyn MatchingApi>,
}

#[async_trait]
impl StatusEndpoint for MatcherStatusEndpoint {
    type Output = Vec<Matcher>;

    fn name(&self) -> &'static str {
        "matcher_compile"
    }

    async fn fetch(&self, task_id: &str) -> ClientResult<JobStatus<Vec<Matcher>>> {
        let response = self.api.matcher_status(task_id).await?;
        Ok(JobStatus {
            status: response.status,
            task_state: response.task_state,
            output: response.matchers,
            message: response.error,
        })
    }
}

// ============================================================================
// Coordinator
// ============================================================================

struct CoordinatorInner {
    api: Arc<dyn MatchingApi>,
    state: SessionState,
    events: EventBus,
    poller: JobPoller,
    pollers: Mutex<HashMap<JobKind, PollHandle>>,
}

/// Tracks background jobs and applies their results to session state
#[derive(Clone)]
pub struct JobCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl JobCoordinator {
    pub fn new(api: Arc<dyn MatchingApi>, state: SessionState, events: EventBus, poller: JobPoller) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                api,
                state,
                events,
                poller,
                pollers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.inner.state
    }

    /// Start the composite matching job
    ///
    /// Fails without touching any slot if the start request itself fails.
    pub async fn start_matching(
        &self,
        upload: MatchingUpload,
        hooks: MatchingHooks,
    ) -> ClientResult<StartedMatching> {
        let started = self.inner.api.start_matching(upload).await?;

        self.track_matching(JobKind::Matching, &started.task_id, hooks.on_complete)
            .await;

        let source_ontology_task_id = match (started.source_ontology_task_id, hooks.on_source_ontology) {
            (Some(task_id), Some(hook)) => {
                self.track_ontology(OntologySide::Source, &task_id, Some(hook)).await;
                Some(task_id)
            }
            _ => None,
        };

        let target_ontology_task_id = match (started.target_ontology_task_id, hooks.on_target_ontology) {
            (Some(task_id), Some(hook)) => {
                self.track_ontology(OntologySide::Target, &task_id, Some(hook)).await;
                Some(task_id)
            }
            _ => None,
        };

        Ok(StartedMatching {
            task_id: started.task_id,
            source_ontology_task_id,
            target_ontology_task_id,
        })
    }

    /// Re-match a subset of target nodes; progress goes to the `Rematch` slot
    pub async fn start_rematch(&self, nodes: &[String], on_complete: Option<JobCallback>) -> ClientResult<String> {
        if nodes.is_empty() {
            return Err(ClientError::InvalidRequest("rematch needs at least one node".to_string()));
        }
        let started = self.inner.api.start_rematch(nodes).await?;
        self.track_matching(JobKind::Rematch, &started.task_id, on_complete)
            .await;
        Ok(started.task_id)
    }

    /// Compile a custom matcher; the roster is replaced on success
    pub async fn start_matcher_compile(
        &self,
        request: NewMatcherRequest,
        on_complete: Option<JobCallback>,
    ) -> ClientResult<String> {
        let started = self.inner.api.start_matcher_compile(request).await?;
        self.track_matcher_compile(&started.task_id, on_complete).await;
        Ok(started.task_id)
    }

    /// Track an already-started matching-style job under `kind`
    pub async fn track_matching(&self, kind: JobKind, task_id: &str, on_complete: Option<JobCallback>) {
        let endpoint = Arc::new(MatchingStatusEndpoint {
            api: Arc::clone(&self.inner.api),
        });
        let cancel = CancellationToken::new();
        let observer = MatchingObserver {
            job: JobContext::new(&self.inner, kind, task_id, cancel.clone(), on_complete),
        };
        self.install(kind, task_id, |poller| {
            poller.spawn_with_cancel(endpoint, task_id, observer, cancel)
        })
        .await;
    }

    /// Track an already-started matcher compilation job
    pub async fn track_matcher_compile(&self, task_id: &str, on_complete: Option<JobCallback>) {
        let endpoint = Arc::new(MatcherStatusEndpoint {
            api: Arc::clone(&self.inner.api),
        });
        let cancel = CancellationToken::new();
        let observer = MatcherObserver {
            job: JobContext::new(&self.inner, JobKind::MatcherCompile, task_id, cancel.clone(), on_complete),
        };
        self.install(JobKind::MatcherCompile, task_id, |poller| {
            poller.spawn_with_cancel(endpoint, task_id, observer, cancel)
        })
        .await;
    }

    async fn track_ontology(&self, side: OntologySide, task_id: &str, on_complete: Option<JobCallback>) {
        let kind = match side {
            OntologySide::Source => JobKind::SourceOntology,
            OntologySide::Target => JobKind::TargetOntology,
        };
        let endpoint = Arc::new(OntologyStatusEndpoint {
            api: Arc::clone(&self.inner.api),
            side,
        });
        let cancel = CancellationToken::new();
        let observer = OntologyObserver {
            side,
            job: JobContext::new(&self.inner, kind, task_id, cancel.clone(), on_complete),
        };
        self.install(kind, task_id, |poller| {
            poller.spawn_with_cancel(endpoint, task_id, observer, cancel)
        })
        .await;
    }

    /// Replace the poller for `kind`; the previous one (if any) is stopped first
    ///
    /// The previous observer shares the stopped token, so once this returns it
    /// can no longer write the slot, emit events or fire its callback.
    async fn install<F>(&self, kind: JobKind, task_id: &str, spawn: F)
    where
        F: FnOnce(&JobPoller) -> PollHandle,
    {
        let mut pollers = self.inner.pollers.lock().await;
        if let Some(previous) = pollers.remove(&kind) {
            if !previous.is_finished() {
                tracing::info!(
                    kind = %kind,
                    previous_task_id = previous.task_id(),
                    task_id = task_id,
                    "Superseding running job poller"
                );
            }
            previous.stop();
        }

        self.inner
            .state
            .set_task_state(kind, task_id, TaskState::pending())
            .await;
        pollers.insert(kind, spawn(&self.inner.poller));
        tracing::info!(kind = %kind, task_id = task_id, "Tracking job");
    }

    /// Stop tracking one job kind (its slot keeps its last snapshot)
    pub async fn stop(&self, kind: JobKind) -> bool {
        match self.inner.pollers.lock().await.remove(&kind) {
            Some(handle) => {
                handle.stop();
                true
            }
            None => false,
        }
    }

    pub async fn stop_all(&self) {
        for (_, handle) in self.inner.pollers.lock().await.drain() {
            handle.stop();
        }
    }

    /// Kinds whose poller is still running, in `JobKind` order
    pub async fn active_jobs(&self) -> Vec<JobKind> {
        let pollers = self.inner.pollers.lock().await;
        let mut kinds: Vec<JobKind> = pollers
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(kind, _)| *kind)
            .collect();
        kinds.sort();
        kinds
    }

    /// Kind and task id of every installed poller, finished or not
    pub async fn tracked_jobs(&self) -> Vec<(JobKind, String)> {
        let pollers = self.inner.pollers.lock().await;
        let mut tracked: Vec<(JobKind, String)> = pollers
            .iter()
            .map(|(kind, handle)| (*kind, handle.task_id().to_string()))
            .collect();
        tracked.sort();
        tracked
    }

    // ========================================================================
    // Refresh actions
    // ========================================================================

    /// Refresh everything a finished matching job invalidates
    pub async fn refresh_after_matching(&self) {
        self.inner.refresh_after_matching().await;
    }

    pub async fn refresh_candidates_and_history(&self) {
        self.inner.refresh_candidates_and_history().await;
    }

    /// Re-fetch the matcher roster
    pub async fn refresh_matchers(&self) -> ClientResult<()> {
        let matchers = self.inner.api.matchers().await?;
        let count = matchers.len();
        self.inner.state.set_matchers(matchers).await;
        self.inner.events.emit_lossy(SmcEvent::MatchersRefreshed { count });
        Ok(())
    }

    // ========================================================================
    // User operations (always round-trip through the server)
    // ========================================================================

    pub async fn apply_operation(&self, operation: &UserOperation) -> ClientResult<()> {
        self.inner.api.apply_operation(operation).await?;
        self.inner.refresh_candidates_and_history().await;
        Ok(())
    }

    pub async fn undo(&self) -> ClientResult<()> {
        self.inner.api.undo().await?;
        self.inner.refresh_candidates_and_history().await;
        Ok(())
    }

    pub async fn redo(&self) -> ClientResult<()> {
        self.inner.api.redo().await?;
        self.inner.refresh_candidates_and_history().await;
        Ok(())
    }
}

impl CoordinatorInner {
    async fn refresh_candidates(&self) {
        match self.api.cached_results().await {
            Ok(candidates) => {
                let count = candidates.len();
                self.state.set_candidates(candidates).await;
                self.events.emit_lossy(SmcEvent::CandidatesRefreshed { count });
            }
            Err(e) => self.refresh_failed("candidates", e),
        }
    }

    async fn refresh_history(&self) {
        match self.api.operation_history().await {
            Ok(history) => {
                self.state.set_history(history).await;
                self.events.emit_lossy(SmcEvent::AuxiliaryRefreshed {
                    data: AuxiliaryData::OperationHistory,
                });
            }
            Err(e) => self.refresh_failed("operation history", e),
        }
    }

    async fn refresh_ontology(&self, side: OntologySide) {
        match self.api.ontology(side).await {
            Ok(ontology) => {
                self.state.set_ontology(side, ontology).await;
                let data = match side {
                    OntologySide::Source => AuxiliaryData::SourceOntology,
                    OntologySide::Target => AuxiliaryData::TargetOntology,
                };
                self.events.emit_lossy(SmcEvent::AuxiliaryRefreshed { data });
            }
            Err(e) => self.refresh_failed(side.as_str(), e),
        }
    }

    async fn refresh_value_bins(&self) {
        match self.api.value_bins().await {
            Ok(bins) => {
                self.state.set_value_bins(bins).await;
                self.events.emit_lossy(SmcEvent::AuxiliaryRefreshed {
                    data: AuxiliaryData::ValueBins,
                });
            }
            Err(e) => self.refresh_failed("value bins", e),
        }
    }

    async fn refresh_value_matches(&self) {
        match self.api.value_matches().await {
            Ok(matches) => {
                self.state.set_value_matches(matches).await;
                self.events.emit_lossy(SmcEvent::AuxiliaryRefreshed {
                    data: AuxiliaryData::ValueMatches,
                });
            }
            Err(e) => self.refresh_failed("value matches", e),
        }
    }

    async fn refresh_candidates_and_history(&self) {
        tokio::join!(self.refresh_candidates(), self.refresh_history());
    }

    async fn refresh_after_matching(&self) {
        tokio::join!(
            self.refresh_candidates(),
            self.refresh_history(),
            self.refresh_ontology(OntologySide::Target),
            self.refresh_value_bins(),
            self.refresh_value_matches(),
        );
    }

    /// A failed refresh leaves the previous data in place
    fn refresh_failed(&self, what: &str, error: ClientError) {
        tracing::warn!(data = what, error = %error, "Refresh failed, keeping previous data");
        self.events.emit_lossy(SmcEvent::notify(
            NotificationLevel::Warning,
            format!("Failed to refresh {}: {}", what, error.user_message()),
        ));
    }
}

// ============================================================================
// Poll observers
// ============================================================================

/// What every observer needs: its slot, the shared state and its callback
///
/// `cancel` is the poller's own token. Once it fires the job no longer owns
/// its slot and every write below is skipped.
struct JobContext {
    inner: Arc<CoordinatorInner>,
    kind: JobKind,
    task_id: String,
    cancel: CancellationToken,
    on_complete: std::sync::Mutex<Option<JobCallback>>,
}

impl JobContext {
    fn new(
        inner: &Arc<CoordinatorInner>,
        kind: JobKind,
        task_id: &str,
        cancel: CancellationToken,
        on_complete: Option<JobCallback>,
    ) -> Self {
        Self {
            inner: Arc::clone(inner),
            kind,
            task_id: task_id.to_string(),
            cancel,
            on_complete: std::sync::Mutex::new(on_complete),
        }
    }

    fn superseded(&self, what: &str) -> bool {
        let stopped = self.cancel.is_cancelled();
        if stopped {
            tracing::debug!(kind = %self.kind, task_id = %self.task_id, "Job stopped, dropping {}", what);
        }
        stopped
    }

    fn take_callback(&mut self) -> Option<JobCallback> {
        self.on_complete.get_mut().ok().and_then(Option::take)
    }

    async fn progress(&self, state: TaskState) {
        let cancel = &self.cancel;
        let written = self
            .inner
            .state
            .set_task_state_if(self.kind, &self.task_id, state.clone(), || !cancel.is_cancelled())
            .await;
        if !written {
            self.superseded("progress");
            return;
        }
        self.inner.events.emit_lossy(SmcEvent::TaskProgress {
            kind: self.kind,
            task_id: self.task_id.clone(),
            state,
        });
    }

    fn completed(&mut self, message: String) {
        if self.superseded("completion") {
            return;
        }
        tracing::info!(kind = %self.kind, task_id = %self.task_id, "Job results applied");
        self.inner.events.emit_lossy(SmcEvent::TaskCompleted {
            kind: self.kind,
            task_id: self.task_id.clone(),
        });
        self.inner
            .events
            .emit_lossy(SmcEvent::notify(NotificationLevel::Success, message));
        if let Some(callback) = self.take_callback() {
            callback(Ok(()));
        }
    }

    fn failed(&mut self, error: ClientError) {
        if self.superseded("failure") {
            return;
        }
        let message = error.user_message();
        tracing::warn!(kind = %self.kind, task_id = %self.task_id, error = %message, "Job failed");
        self.inner.events.emit_lossy(SmcEvent::TaskFailed {
            kind: self.kind,
            task_id: self.task_id.clone(),
            message: message.clone(),
        });
        self.inner
            .events
            .emit_lossy(SmcEvent::notify(NotificationLevel::Error, message));
        if let Some(callback) = self.take_callback() {
            callback(Err(error));
        }
    }
}

struct MatchingObserver {
    job: JobContext,
}

#[async_trait]
impl PollObserver<serde_json::Value> for MatchingObserver {
    async fn on_progress(&mut self, state: TaskState) {
        self.job.progress(state).await;
    }

    async fn on_result(&mut self, _result: serde_json::Value) {
        self.job.inner.refresh_after_matching().await;
        self.job.completed(format!("{} finished", self.job.kind));
    }

    async fn on_error(&mut self, error: ClientError) {
        // Cached results stay exactly as they were
        self.job.failed(error);
    }
}

struct OntologyObserver {
    side: OntologySide,
    job: JobContext,
}

#[async_trait]
impl PollObserver<()> for OntologyObserver {
    async fn on_progress(&mut self, state: TaskState) {
        self.job.progress(state).await;
    }

    async fn on_result(&mut self, _result: ()) {
        self.job.inner.refresh_ontology(self.side).await;
        self.job
            .completed(format!("{} ontology inferred", self.side.as_str()));
    }

    async fn on_error(&mut self, error: ClientError) {
        self.job.failed(error);
    }
}

struct MatcherObserver {
    job: JobContext,
}

#[async_trait]
impl PollObserver<Vec<Matcher>> for MatcherObserver {
    async fn on_progress(&mut self, state: TaskState) {
        self.job.progress(state).await;
    }

    async fn on_result(&mut self, matchers: Vec<Matcher>) {
        let count = matchers.len();
        let cancel = &self.job.cancel;
        let applied = self
            .job
            .inner
            .state
            .set_matchers_if(matchers, || !cancel.is_cancelled())
            .await;
        if !applied {
            self.job.superseded("roster");
            return;
        }
        self.job
            .inner
            .events
            .emit_lossy(SmcEvent::MatchersRefreshed { count });
        self.job.completed(format!("Matcher compiled ({} matchers)", count));
    }

    async fn on_error(&mut self, error: ClientError) {
        self.job.failed(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_observers_can_be_shared_across_awaits() {
        // async_trait futures borrow the observer, which must be Sync for them to be Send
        assert_send_sync::<JobContext>();
        assert_send_sync::<MatchingObserver>();
        assert_send_sync::<OntologyObserver>();
        assert_send_sync::<MatcherObserver>();
    }
}
