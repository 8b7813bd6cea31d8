//! Proactive engine: pattern detection, trigger evaluation, suggestion
//! generation, diagnosis, and gated self-healing for a fleet of agents.
//!
//! [`ProactiveEngine`] is the single assembly point. Collaborators hand it
//! lifecycle events and operator decisions; dashboards watch it through the
//! live feed. Everything else in this module tree is internal machinery.

pub mod background;
pub mod cron;
pub mod diagnosis;
pub mod feed;
pub mod healing;
pub mod heartbeat;
pub mod patterns;
pub mod registry;
pub mod runtime;
pub mod suggestions;
pub mod triggers;

use std::sync::Arc;

use serde_json::Value;

use crate::config::EngineConfig;
use crate::db::models::{
    HealingRecord, HeartbeatLog, HeartbeatType, Pattern, Suggestion, SuggestionStatus,
    TriggerEventType,
};
use crate::db::repos::suggestions as suggestion_repo;
use crate::db::DbPool;
use crate::error::AppError;

use self::background::{EngineLoopStats, EngineState};
use self::feed::{ProactiveEvent, ProactiveFeed, ProactiveProjection, SubscriptionId};
use self::healing::HealingExecutor;
use self::heartbeat::{BatchSummary, HeartbeatOrchestrator};
use self::runtime::AgentRuntime;

/// The assembled engine. Owns the store handle, the healing executor, the
/// heartbeat orchestrator, and the read-side feed; all collaborator-facing
/// calls go through here.
pub struct ProactiveEngine {
    pool: DbPool,
    orchestrator: Arc<HeartbeatOrchestrator>,
    executor: Arc<HealingExecutor>,
    feed: Arc<ProactiveFeed>,
    projection: Arc<ProactiveProjection>,
    state: Arc<EngineState>,
    config: EngineConfig,
}

impl ProactiveEngine {
    pub fn new(pool: DbPool, config: EngineConfig, runtime: Arc<dyn AgentRuntime>) -> Self {
        let feed = Arc::new(ProactiveFeed::new());
        let projection = Arc::new(ProactiveProjection::new());
        let executor = Arc::new(HealingExecutor::new(pool.clone(), config.clone(), runtime));
        let orchestrator = Arc::new(HeartbeatOrchestrator::new(
            pool.clone(),
            config.clone(),
            Arc::clone(&executor),
            Arc::clone(&feed),
            Arc::clone(&projection),
        ));
        Self {
            pool,
            orchestrator,
            executor,
            feed,
            projection,
            state: Arc::new(EngineState::new()),
            config,
        }
    }

    /// Startup pass: rebuild the read model from the store and settle any
    /// healing sessions a previous process left mid-action. Call once before
    /// [`Self::start`].
    pub async fn recover(&self) -> Result<(), AppError> {
        self.projection.rebuild(&self.pool)?;
        self.executor.recover_stale_sessions().await?;
        Ok(())
    }

    /// Start the scheduled heartbeat, healing-poll and retention loops.
    pub fn start(&self) {
        background::start_loops(
            Arc::clone(&self.state),
            self.pool.clone(),
            self.config.clone(),
            Arc::clone(&self.orchestrator),
            Arc::clone(&self.executor),
            Arc::clone(&self.feed),
            Arc::clone(&self.projection),
        );
    }

    /// Signal the background loops to exit on their next tick.
    pub fn stop(&self) {
        background::stop_loops(&self.state);
    }

    pub fn loop_stats(&self) -> EngineLoopStats {
        self.state.stats()
    }

    // -----------------------------------------------------------------------
    // Heartbeats
    // -----------------------------------------------------------------------

    pub async fn run_heartbeat(
        &self,
        agent_id: &str,
        heartbeat_type: HeartbeatType,
    ) -> Result<HeartbeatLog, AppError> {
        self.orchestrator.run_heartbeat(agent_id, heartbeat_type).await
    }

    pub async fn run_batch_heartbeat(&self) -> Result<BatchSummary, AppError> {
        self.orchestrator.run_batch_heartbeat().await
    }

    // -----------------------------------------------------------------------
    // Lifecycle events (inbound from the agent runtime)
    // -----------------------------------------------------------------------

    pub async fn on_conversation_complete(
        &self,
        agent_id: &str,
        payload: Value,
    ) -> Result<HeartbeatLog, AppError> {
        self.orchestrator
            .on_event(agent_id, TriggerEventType::ConversationComplete, payload)
            .await
    }

    pub async fn on_task_complete(
        &self,
        agent_id: &str,
        payload: Value,
    ) -> Result<HeartbeatLog, AppError> {
        self.orchestrator
            .on_event(agent_id, TriggerEventType::TaskComplete, payload)
            .await
    }

    pub async fn on_workflow_complete(
        &self,
        agent_id: &str,
        payload: Value,
    ) -> Result<HeartbeatLog, AppError> {
        self.orchestrator
            .on_event(agent_id, TriggerEventType::WorkflowComplete, payload)
            .await
    }

    pub async fn on_memory_saved(
        &self,
        agent_id: &str,
        payload: Value,
    ) -> Result<HeartbeatLog, AppError> {
        self.orchestrator
            .on_event(agent_id, TriggerEventType::MemorySaved, payload)
            .await
    }

    pub async fn on_learning_created(
        &self,
        agent_id: &str,
        payload: Value,
    ) -> Result<HeartbeatLog, AppError> {
        self.orchestrator
            .on_event(agent_id, TriggerEventType::LearningCreated, payload)
            .await
    }

    // -----------------------------------------------------------------------
    // Operator surface
    // -----------------------------------------------------------------------

    /// Approve a healing session waiting at the gate. Idempotent: replays
    /// return the record as it stands.
    pub async fn approve_healing_session(
        &self,
        record_id: &str,
    ) -> Result<HealingRecord, AppError> {
        let record = self.executor.approve(record_id).await?;
        let event = self.projection.healing_updated(record.clone());
        self.feed.publish(&event);
        Ok(record)
    }

    /// Reject a waiting healing session. Idempotent like approval.
    pub async fn reject_healing_session(
        &self,
        record_id: &str,
        reason: Option<&str>,
    ) -> Result<HealingRecord, AppError> {
        let record = self.executor.reject(record_id, reason).await?;
        let event = self.projection.healing_updated(record.clone());
        self.feed.publish(&event);
        Ok(record)
    }

    /// Fast-path remediation for a pre-registered failure signature.
    pub async fn quick_heal(
        &self,
        agent_id: &str,
        signature: &str,
    ) -> Result<HealingRecord, AppError> {
        let record = self.executor.quick_heal(agent_id, signature).await?;
        let event = self.projection.healing_updated(record.clone());
        self.feed.publish(&event);
        Ok(record)
    }

    /// Accept or dismiss a pending suggestion. Other statuses are rejected
    /// at the repo layer.
    pub fn resolve_suggestion(
        &self,
        suggestion_id: &str,
        status: SuggestionStatus,
    ) -> Result<Suggestion, AppError> {
        let suggestion = suggestion_repo::update_status(&self.pool, suggestion_id, status)?;
        let event = self.projection.suggestion_updated(suggestion.clone());
        self.feed.publish(&event);
        Ok(suggestion)
    }

    // -----------------------------------------------------------------------
    // Read accessors and the live feed
    // -----------------------------------------------------------------------

    pub fn get_active_patterns(&self, agent_id: &str) -> Result<Vec<Pattern>, AppError> {
        patterns::get_active_patterns(&self.pool, agent_id, chrono::Utc::now())
    }

    pub fn get_healing_status(&self, record_id: &str) -> Result<HealingRecord, AppError> {
        self.executor.get_healing_status(record_id)
    }

    pub fn get_active_healing_sessions(
        &self,
        agent_id: Option<&str>,
    ) -> Result<Vec<HealingRecord>, AppError> {
        self.executor.get_active_healing_sessions(agent_id)
    }

    pub fn get_pending_suggestions(&self, agent_id: &str) -> Result<Vec<Suggestion>, AppError> {
        suggestion_repo::get_pending(&self.pool, agent_id)
    }

    pub fn subscribe_to_proactive_events(
        &self,
    ) -> (SubscriptionId, tokio::sync::mpsc::UnboundedReceiver<ProactiveEvent>) {
        self.feed.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.feed.unsubscribe(id)
    }

    /// Snapshot projection, for pull-style consumers that do not want a
    /// subscription.
    pub fn projection(&self) -> &ProactiveProjection {
        &self.projection
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
