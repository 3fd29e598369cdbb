//! smc-client library interface
//!
//! HTTP client, job coordination, agent streaming and matcher evaluation for
//! one schema-matching session. Everything is wired from an explicit
//! `ClientConfig`; there is no ambient session state.

pub mod api;
pub mod error;
pub mod services;
pub mod state;

pub use crate::error::{ClientError, ClientResult};

use smc_common::config::ClientConfig;
use smc_common::events::EventBus;
use std::sync::Arc;

use crate::api::{ExplanationSource, HttpMatchingApi, MatchingApi};
use crate::services::{AgentStream, EvaluationEngine, JobCoordinator, JobPoller};
use crate::state::SessionState;

/// Event bus capacity for one client
pub const EVENT_BUS_CAPACITY: usize = 256;

/// Fully wired client for one session
pub struct SmcClient {
    pub config: ClientConfig,
    pub events: EventBus,
    pub state: SessionState,
    pub coordinator: JobCoordinator,
    pub agent: AgentStream,
    pub evaluation: EvaluationEngine,
}

impl SmcClient {
    /// Build a client talking HTTP to `config.server_url`
    pub fn connect(config: ClientConfig) -> ClientResult<Self> {
        config.validate()?;
        let api = Arc::new(HttpMatchingApi::new(&config)?);
        Ok(Self::with_api(config, api.clone(), api))
    }

    /// Build a client over any API implementation
    pub fn with_api(
        config: ClientConfig,
        api: Arc<dyn MatchingApi>,
        explanations: Arc<dyn ExplanationSource>,
    ) -> Self {
        let events = EventBus::new(EVENT_BUS_CAPACITY);
        let state = SessionState::new(config.session_name.clone());
        let coordinator = JobCoordinator::new(
            Arc::clone(&api),
            state.clone(),
            events.clone(),
            JobPoller::new(config.poll_interval),
        );
        let agent = AgentStream::new(api, coordinator.clone(), events.clone());
        let evaluation = EvaluationEngine::new(explanations, state.clone(), events.clone());

        tracing::info!(
            server_url = %config.server_url,
            session = %config.session_name,
            poll_interval_ms = config.poll_interval.as_millis() as u64,
            "Client initialized"
        );

        Self {
            config,
            events,
            state,
            coordinator,
            agent,
            evaluation,
        }
    }
}
