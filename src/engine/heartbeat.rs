//! Heartbeat orchestrator: the periodic and event-driven entry points that
//! run the detection pipeline for one agent and fan out over the fleet.
//!
//! Every pass appends one [`HeartbeatLog`] row. Step failures degrade the
//! run instead of aborting it; only a timeout or a panic in the batch path
//! yields an `error` result. Writes for one agent are serialized behind a
//! per-agent async lock so event handlers and scheduled passes never
//! interleave their read-modify-write sequences.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;

use crate::config::EngineConfig;
use crate::db::models::{
    AgentStats, HeartbeatLog, HeartbeatResult, HeartbeatSubResult, HeartbeatType, IssueSeverity,
    Pattern, TriggerEventType,
};
use crate::db::repos::{agents, heartbeats as heartbeat_repo, patterns as pattern_repo, suggestions as suggestion_repo};
use crate::db::DbPool;
use crate::engine::feed::{ProactiveFeed, ProactiveProjection};
use crate::engine::healing::HealingExecutor;
use crate::engine::triggers::{TriggerContext, TriggerEvaluation, TriggerFire};
use crate::engine::{diagnosis, patterns, suggestions, triggers};
use crate::error::AppError;

/// Slack added to the scheduled-trigger window so a late heartbeat still
/// picks up ticks from the nominal interval.
const SCHEDULE_WINDOW_SLACK_MINUTES: i64 = 1;

/// Fleet-wide batch outcome.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub total: usize,
    pub ok: usize,
    pub degraded: usize,
    pub error: usize,
}

pub struct HeartbeatOrchestrator {
    pool: DbPool,
    config: EngineConfig,
    executor: Arc<HealingExecutor>,
    feed: Arc<ProactiveFeed>,
    projection: Arc<ProactiveProjection>,
    agent_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

fn aggregate(steps: &[HeartbeatSubResult]) -> HeartbeatResult {
    let failed = steps.iter().filter(|s| !s.ok).count();
    if failed == 0 {
        HeartbeatResult::Ok
    } else if failed == steps.len() {
        HeartbeatResult::Error
    } else {
        HeartbeatResult::Degraded
    }
}

fn payload_failed(payload: &Value) -> Option<String> {
    if let Some(error) = payload.get("error").and_then(Value::as_str) {
        if !error.is_empty() {
            return Some(error.to_string());
        }
    }
    if payload.get("success").and_then(Value::as_bool) == Some(false) {
        return Some("completed unsuccessfully".to_string());
    }
    None
}

impl HeartbeatOrchestrator {
    pub fn new(
        pool: DbPool,
        config: EngineConfig,
        executor: Arc<HealingExecutor>,
        feed: Arc<ProactiveFeed>,
        projection: Arc<ProactiveProjection>,
    ) -> Self {
        Self {
            pool,
            config,
            executor,
            feed,
            projection,
            agent_locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, agent_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .agent_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // -----------------------------------------------------------------------
    // Scheduled / realtime pass
    // -----------------------------------------------------------------------

    /// Run the full pipeline for one agent: reconcile patterns, fire due
    /// schedules and thresholds, generate suggestions, diagnose, and tend
    /// open healing sessions. Appends and returns the heartbeat log.
    pub async fn run_heartbeat(
        &self,
        agent_id: &str,
        heartbeat_type: HeartbeatType,
    ) -> Result<HeartbeatLog, AppError> {
        let lock = self.lock_for(agent_id);
        let _guard = lock.lock().await;
        let started = Instant::now();
        let now = Utc::now();
        let mut steps: Vec<HeartbeatSubResult> = Vec::new();

        let stats = match agents::get_stats(&self.pool, agent_id) {
            Ok(stats) => {
                steps.push(HeartbeatSubResult::ok("stats_snapshot", None));
                stats
            }
            Err(e) => {
                steps.push(HeartbeatSubResult::failed("stats_snapshot", e.to_string()));
                AgentStats::empty(agent_id, &now.to_rfc3339())
            }
        };

        match patterns::analyze_patterns(&self.pool, agent_id, now) {
            Ok(summary) => steps.push(HeartbeatSubResult::ok(
                "pattern_analysis",
                Some(format!(
                    "examined {} decayed {} promoted {} archived {}",
                    summary.examined, summary.decayed, summary.promoted, summary.archived
                )),
            )),
            Err(e) => steps.push(HeartbeatSubResult::failed("pattern_analysis", e.to_string())),
        }

        let active = match patterns::get_active_patterns(&self.pool, agent_id, now) {
            Ok(active) => active,
            Err(e) => {
                steps.push(HeartbeatSubResult::failed("active_patterns", e.to_string()));
                Vec::new()
            }
        };

        // Due cron schedules fire here; the feed consumer runs the actual
        // automation, the engine only stamps and announces the tick.
        let window = self.config.heartbeat_interval_minutes as i64 + SCHEDULE_WINDOW_SLACK_MINUTES;
        let scheduled = triggers::evaluate_scheduled_triggers(&active, window, now);
        match self.stamp_fired(&scheduled.fired, now) {
            Ok(()) => steps.push(HeartbeatSubResult::ok(
                "scheduled_triggers",
                Some(format!(
                    "{} fired, {} cooling",
                    scheduled.fired.len(),
                    scheduled.suppressed_by_cooldown
                )),
            )),
            Err(e) => steps.push(HeartbeatSubResult::failed("scheduled_triggers", e.to_string())),
        }

        // Threshold rules read the stats snapshot through the same evaluator.
        let pending = suggestion_repo::count_pending(&self.pool, agent_id).unwrap_or(0);
        let ctx = TriggerContext::new(
            agent_id,
            TriggerEventType::Scheduled,
            Value::Null,
            stats.clone(),
            pending,
            now,
        );
        let evaluation = triggers::evaluate_triggers(&ctx, &active);
        match self
            .suggest_from_evaluation(agent_id, &evaluation, &active, &stats, now)
            .await
        {
            Ok(created) => steps.push(HeartbeatSubResult::ok(
                "trigger_evaluation",
                Some(format!(
                    "{} fired, {} suggestions",
                    evaluation.fired.len(),
                    created
                )),
            )),
            Err(e) => steps.push(HeartbeatSubResult::failed("trigger_evaluation", e.to_string())),
        }

        match self.diagnose_and_heal(agent_id, now).await {
            Ok(detail) => steps.push(HeartbeatSubResult::ok("diagnosis", Some(detail))),
            Err(e) => steps.push(HeartbeatSubResult::failed("diagnosis", e.to_string())),
        }

        let maintenance = async {
            let polled = self.executor.poll_executing_sessions(now).await?;
            let resolved = self.executor.check_self_resolution(agent_id, now)?;
            let detail = format!("{} polled, {} self-resolved", polled.len(), resolved.len());
            for record in polled.into_iter().chain(resolved) {
                let event = self.projection.healing_updated(record);
                self.feed.publish(&event);
            }
            Ok::<String, AppError>(detail)
        };
        match maintenance.await {
            Ok(detail) => steps.push(HeartbeatSubResult::ok("healing_maintenance", Some(detail))),
            Err(e) => steps.push(HeartbeatSubResult::failed("healing_maintenance", e.to_string())),
        }

        match suggestion_repo::expire_overdue(&self.pool, agent_id, &now.to_rfc3339()) {
            Ok(expired) => {
                for s in &expired {
                    let event = self.projection.suggestion_updated(s.clone());
                    self.feed.publish(&event);
                }
                steps.push(HeartbeatSubResult::ok(
                    "suggestion_expiry",
                    Some(format!("{} expired", expired.len())),
                ));
            }
            Err(e) => steps.push(HeartbeatSubResult::failed("suggestion_expiry", e.to_string())),
        }

        self.append_log(agent_id, heartbeat_type, steps, started)
    }

    /// Fan a scheduled pass over every enabled agent with a bounded worker
    /// pool. A slow agent is cut off at the per-agent timeout and recorded
    /// as an `error` log; one agent's failure never touches the others.
    pub async fn run_batch_heartbeat(self: &Arc<Self>) -> Result<BatchSummary, AppError> {
        let roster = agents::get_enabled(&self.pool)?;
        let mut summary = BatchSummary {
            total: roster.len(),
            ..BatchSummary::default()
        };
        let semaphore = Arc::new(Semaphore::new(self.config.batch_worker_pool.max(1)));
        let timeout = std::time::Duration::from_secs(self.config.per_agent_timeout_secs);
        let mut set: JoinSet<(String, Result<HeartbeatResult, String>)> = JoinSet::new();

        for agent in roster {
            let orchestrator = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            set.spawn(async move {
                let _permit = match semaphore.acquire().await {
                    Ok(p) => p,
                    Err(_) => return (agent.id, Err("worker pool closed".to_string())),
                };
                let run = orchestrator.run_heartbeat(&agent.id, HeartbeatType::Scheduled);
                match tokio::time::timeout(timeout, run).await {
                    Ok(Ok(log)) => (agent.id, Ok(log.result)),
                    Ok(Err(e)) => (agent.id, Err(e.to_string())),
                    Err(_) => (agent.id, Err(format!("timed out after {timeout:?}"))),
                }
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(result))) => match result {
                    HeartbeatResult::Ok => summary.ok += 1,
                    HeartbeatResult::Degraded => summary.degraded += 1,
                    HeartbeatResult::Error => summary.error += 1,
                },
                Ok((agent_id, Err(detail))) => {
                    summary.error += 1;
                    self.record_failed_run(&agent_id, &detail);
                }
                Err(join_error) => {
                    summary.error += 1;
                    tracing::error!(error = %join_error, "Heartbeat worker panicked");
                }
            }
        }

        tracing::info!(
            total = summary.total,
            ok = summary.ok,
            degraded = summary.degraded,
            error = summary.error,
            "Batch heartbeat finished"
        );
        Ok(summary)
    }

    fn record_failed_run(&self, agent_id: &str, detail: &str) {
        let log = HeartbeatLog {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            heartbeat_type: HeartbeatType::Scheduled,
            result: HeartbeatResult::Error,
            sub_results: vec![HeartbeatSubResult::failed("pipeline", detail)],
            duration_ms: None,
            triggered_at: Utc::now().to_rfc3339(),
        };
        if let Err(e) = heartbeat_repo::insert(&self.pool, &log) {
            tracing::error!(agent_id = %agent_id, error = %e, "Failed to record error heartbeat");
            return;
        }
        let event = self.projection.heartbeat_completed(log);
        self.feed.publish(&event);
    }

    // -----------------------------------------------------------------------
    // Lifecycle events
    // -----------------------------------------------------------------------

    /// Fold one lifecycle event into the engine: update stats, observe
    /// patterns, evaluate triggers, and append an `event` heartbeat log.
    /// When the event carries a failure, the log lands first so the
    /// diagnosis pass that follows sees the full failure window.
    pub async fn on_event(
        &self,
        agent_id: &str,
        event_type: TriggerEventType,
        payload: Value,
    ) -> Result<HeartbeatLog, AppError> {
        if event_type == TriggerEventType::Scheduled {
            return self.run_heartbeat(agent_id, HeartbeatType::Realtime).await;
        }

        let lock = self.lock_for(agent_id);
        let guard = lock.lock().await;
        let started = Instant::now();
        let now = Utc::now();
        let mut steps: Vec<HeartbeatSubResult> = Vec::new();
        let failure = payload_failed(&payload);

        match &failure {
            Some(detail) => steps.push(HeartbeatSubResult::failed("lifecycle_event", detail.clone())),
            None => steps.push(HeartbeatSubResult::ok(
                "lifecycle_event",
                Some(event_type.as_str().to_string()),
            )),
        }

        let counts_interaction = matches!(
            event_type,
            TriggerEventType::ConversationComplete
                | TriggerEventType::TaskComplete
                | TriggerEventType::WorkflowComplete
        );
        let stats = if counts_interaction {
            let is_task = event_type == TriggerEventType::TaskComplete;
            let is_workflow = event_type == TriggerEventType::WorkflowComplete;
            match agents::record_event(&self.pool, agent_id, is_task, is_workflow, failure.is_some())
            {
                Ok(stats) => {
                    steps.push(HeartbeatSubResult::ok("stats_update", None));
                    stats
                }
                Err(e) => {
                    steps.push(HeartbeatSubResult::failed("stats_update", e.to_string()));
                    AgentStats::empty(agent_id, &now.to_rfc3339())
                }
            }
        } else {
            agents::get_stats(&self.pool, agent_id)
                .unwrap_or_else(|_| AgentStats::empty(agent_id, &now.to_rfc3339()))
        };

        match self.observe_event(agent_id, event_type, &payload, &stats, now) {
            Ok(touched) => {
                for pattern in &touched {
                    let event = self.projection.pattern_updated(pattern.clone());
                    self.feed.publish(&event);
                }
                steps.push(HeartbeatSubResult::ok(
                    "pattern_observation",
                    Some(format!("{} patterns touched", touched.len())),
                ));
            }
            Err(e) => steps.push(HeartbeatSubResult::failed("pattern_observation", e.to_string())),
        }

        let active = patterns::get_active_patterns(&self.pool, agent_id, now).unwrap_or_default();
        let pending = suggestion_repo::count_pending(&self.pool, agent_id).unwrap_or(0);
        let ctx = TriggerContext::new(agent_id, event_type, payload, stats.clone(), pending, now);
        let evaluation = triggers::evaluate_triggers(&ctx, &active);
        match self
            .suggest_from_evaluation(agent_id, &evaluation, &active, &stats, now)
            .await
        {
            Ok(created) => steps.push(HeartbeatSubResult::ok(
                "trigger_evaluation",
                Some(format!(
                    "{} fired, {} suggestions",
                    evaluation.fired.len(),
                    created
                )),
            )),
            Err(e) => steps.push(HeartbeatSubResult::failed("trigger_evaluation", e.to_string())),
        }

        let log = self.append_log(agent_id, HeartbeatType::Event, steps, started)?;
        drop(guard);

        // With the failure on record, the diagnosis window is complete.
        if failure.is_some() {
            if let Err(e) = self.diagnose_and_heal(agent_id, now).await {
                tracing::warn!(agent_id = %agent_id, error = %e, "Post-event diagnosis failed");
            }
        }
        Ok(log)
    }

    /// Pattern hooks per event type. Exhaustive on purpose: a new lifecycle
    /// event must decide what it feeds.
    fn observe_event(
        &self,
        agent_id: &str,
        event_type: TriggerEventType,
        payload: &Value,
        stats: &AgentStats,
        now: chrono::DateTime<Utc>,
    ) -> Result<Vec<Pattern>, AppError> {
        match event_type {
            TriggerEventType::TaskComplete => {
                patterns::observe_task_completion(&self.pool, agent_id, payload, now)
            }
            TriggerEventType::WorkflowComplete => {
                patterns::observe_workflow_completion(&self.pool, agent_id, payload, now)
            }
            TriggerEventType::ConversationComplete => {
                Ok(patterns::observe_conversation(&self.pool, agent_id, stats, now)?
                    .into_iter()
                    .collect())
            }
            TriggerEventType::MemorySaved => {
                patterns::on_memory_saved(&self.pool, agent_id, payload, now).map(|p| vec![p])
            }
            TriggerEventType::LearningCreated => {
                patterns::on_learning_created(&self.pool, agent_id, payload, now).map(|p| vec![p])
            }
            TriggerEventType::Scheduled => Ok(vec![]),
        }
    }

    // -----------------------------------------------------------------------
    // Shared pipeline pieces
    // -----------------------------------------------------------------------

    fn stamp_fired(&self, fired: &[TriggerFire], now: chrono::DateTime<Utc>) -> Result<(), AppError> {
        for fire in fired {
            let mut pattern = pattern_repo::get_by_id(&self.pool, &fire.pattern_id)?;
            let now_str = now.to_rfc3339();
            pattern.last_triggered_at = Some(now_str.clone());
            // A fired schedule is a live behavior: keep it from decaying out.
            pattern.last_observed_at = now_str.clone();
            pattern.expires_at =
                (now + chrono::Duration::days(patterns::PATTERN_EXPIRY_DAYS)).to_rfc3339();
            pattern.updated_at = now_str;
            pattern_repo::update(&self.pool, &pattern)?;
            let event = self.projection.pattern_updated(pattern);
            self.feed.publish(&event);
            tracing::info!(reason = %fire.reason, "Scheduled trigger fired");
        }
        Ok(())
    }

    /// Turn fired triggers into persisted suggestions: confident patterns get
    /// the full suggestion, mid-band ones a reverse prompt, and the batch
    /// filter owns dedup and caps. Returns how many rows were written.
    async fn suggest_from_evaluation(
        &self,
        agent_id: &str,
        evaluation: &TriggerEvaluation,
        active: &[Pattern],
        stats: &AgentStats,
        now: chrono::DateTime<Utc>,
    ) -> Result<usize, AppError> {
        let mut candidates = Vec::new();
        for fire in &evaluation.fired {
            let Some(pattern) = active.iter().find(|p| p.id == fire.pattern_id) else {
                continue;
            };
            if let Some(s) = suggestions::generate_from_pattern(pattern, now) {
                candidates.push(s);
            } else if let Some(prompt) = suggestions::generate_reverse_prompt(pattern, now) {
                candidates.push(prompt);
            }
        }
        if let Some(nudge) = suggestions::generate_relationship_nudge(agent_id, stats, now) {
            candidates.push(nudge);
        }

        let stamped: Vec<String> = evaluation.fired.iter().map(|f| f.pattern_id.clone()).collect();
        let limits = suggestions::BatchLimits::from_config(&self.config);
        let persisted =
            suggestions::generate_batch_suggestions(&self.pool, agent_id, candidates, limits, now)?;
        let created = persisted.len();
        for s in persisted {
            let event = self.projection.suggestion_created(s);
            self.feed.publish(&event);
        }
        // Event-triggered patterns get their cooldown stamp only when they
        // actually fired, regardless of whether a suggestion survived dedup.
        for pattern_id in stamped {
            if let Ok(mut pattern) = pattern_repo::get_by_id(&self.pool, &pattern_id) {
                pattern.last_triggered_at = Some(now.to_rfc3339());
                pattern.updated_at = now.to_rfc3339();
                let _ = pattern_repo::update(&self.pool, &pattern);
            }
        }
        Ok(created)
    }

    /// Diagnosis pass: explicit failures first, leading indicators second.
    /// High severity opens (or merges into) a healing session; softer
    /// findings become error-alert suggestions.
    async fn diagnose_and_heal(
        &self,
        agent_id: &str,
        now: chrono::DateTime<Utc>,
    ) -> Result<String, AppError> {
        let mut findings = 0usize;
        let mut alerts = Vec::new();

        if let Some(diagnosis) = diagnosis::diagnose_agent(&self.pool, agent_id, now)? {
            findings += 1;
            if diagnosis.severity >= IssueSeverity::High {
                let record = self.executor.start_healing_session(diagnosis).await?;
                let event = self.projection.healing_updated(record);
                self.feed.publish(&event);
            } else {
                alerts.push(suggestions::generate_error_alert(agent_id, &diagnosis, now));
            }
        }

        if let Some(potential) = diagnosis::diagnose_potential_issues(&self.pool, agent_id, now)? {
            findings += 1;
            alerts.push(suggestions::generate_error_alert(agent_id, &potential, now));
        }

        if !alerts.is_empty() {
            let limits = suggestions::BatchLimits::from_config(&self.config);
            let persisted =
                suggestions::generate_batch_suggestions(&self.pool, agent_id, alerts, limits, now)?;
            for s in persisted {
                let event = self.projection.suggestion_created(s);
                self.feed.publish(&event);
            }
        }
        Ok(format!("{findings} findings"))
    }

    fn append_log(
        &self,
        agent_id: &str,
        heartbeat_type: HeartbeatType,
        steps: Vec<HeartbeatSubResult>,
        started: Instant,
    ) -> Result<HeartbeatLog, AppError> {
        let log = HeartbeatLog {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            heartbeat_type,
            result: aggregate(&steps),
            sub_results: steps,
            duration_ms: Some(started.elapsed().as_millis() as i64),
            triggered_at: Utc::now().to_rfc3339(),
        };
        heartbeat_repo::insert(&self.pool, &log)?;
        let event = self.projection.heartbeat_completed(log.clone());
        self.feed.publish(&event);
        tracing::debug!(
            agent_id = %agent_id,
            heartbeat_type = heartbeat_type.as_str(),
            result = log.result.as_str(),
            duration_ms = log.duration_ms,
            "Heartbeat recorded"
        );
        Ok(log)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;
    use crate::db::models::{HealingStatus, IssueType, PatternType};
    use crate::db::repos::healing as healing_repo;
    use crate::engine::runtime::NoopRuntime;
    use serde_json::json;

    fn make_orchestrator(pool: &DbPool) -> Arc<HeartbeatOrchestrator> {
        make_orchestrator_with(pool, EngineConfig::default())
    }

    fn make_orchestrator_with(pool: &DbPool, config: EngineConfig) -> Arc<HeartbeatOrchestrator> {
        let executor = Arc::new(HealingExecutor::new(
            pool.clone(),
            config.clone(),
            Arc::new(NoopRuntime),
        ));
        Arc::new(HeartbeatOrchestrator::new(
            pool.clone(),
            config,
            executor,
            Arc::new(ProactiveFeed::new()),
            Arc::new(ProactiveProjection::new()),
        ))
    }

    // --- aggregate ---

    #[test]
    fn test_aggregate_result() {
        let ok = HeartbeatSubResult::ok("a", None);
        let bad = HeartbeatSubResult::failed("b", "boom");
        assert_eq!(aggregate(&[ok.clone(), ok.clone()]), HeartbeatResult::Ok);
        assert_eq!(aggregate(&[ok, bad.clone()]), HeartbeatResult::Degraded);
        assert_eq!(aggregate(&[bad.clone(), bad]), HeartbeatResult::Error);
    }

    // --- on_event ---

    #[tokio::test]
    async fn test_task_complete_event_full_pipeline() {
        let pool = init_test_db().unwrap();
        agents::upsert(&pool, "agent-a", "Agent A").unwrap();
        let orchestrator = make_orchestrator(&pool);

        let log = orchestrator
            .on_event(
                "agent-a",
                TriggerEventType::TaskComplete,
                json!({"task_title": "Send weekly report", "success": true}),
            )
            .await
            .unwrap();

        assert_eq!(log.heartbeat_type, HeartbeatType::Event);
        assert_eq!(log.result, HeartbeatResult::Ok);
        assert!(log.sub_results.iter().any(|s| s.step == "pattern_observation"));

        // Stats and patterns moved.
        let stats = agents::get_stats(&pool, "agent-a").unwrap();
        assert_eq!(stats.total_tasks, 1);
        let pattern = pattern_repo::get_by_group(
            &pool,
            "agent-a",
            PatternType::RecurringTask,
            "send_weekly_report",
        )
        .unwrap()
        .unwrap();
        assert_eq!(pattern.observation_count, 1);
    }

    #[tokio::test]
    async fn test_suggestion_caps_follow_config() {
        // Three identical completions promote the pattern past the
        // suggestion bar, so the default pipeline persists an automation
        // proposal.
        let pool = init_test_db().unwrap();
        agents::upsert(&pool, "agent-a", "Agent A").unwrap();
        let orchestrator = make_orchestrator(&pool);
        for _ in 0..3 {
            orchestrator
                .on_event(
                    "agent-a",
                    TriggerEventType::TaskComplete,
                    json!({"task_title": "Send weekly report", "success": true}),
                )
                .await
                .unwrap();
        }
        assert_eq!(suggestion_repo::count_pending(&pool, "agent-a").unwrap(), 1);

        // Same events against a zero pending ceiling: the pattern still
        // promotes and fires, but nothing is persisted.
        let pool = init_test_db().unwrap();
        agents::upsert(&pool, "agent-a", "Agent A").unwrap();
        let strict = make_orchestrator_with(
            &pool,
            EngineConfig {
                max_pending_suggestions: 0,
                ..EngineConfig::default()
            },
        );
        for _ in 0..3 {
            strict
                .on_event(
                    "agent-a",
                    TriggerEventType::TaskComplete,
                    json!({"task_title": "Send weekly report", "success": true}),
                )
                .await
                .unwrap();
        }
        let pattern = pattern_repo::get_by_group(
            &pool,
            "agent-a",
            PatternType::RecurringTask,
            "send_weekly_report",
        )
        .unwrap()
        .unwrap();
        assert!(pattern.active);
        assert!(pattern.confidence >= 0.7);
        assert_eq!(suggestion_repo::count_pending(&pool, "agent-a").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failure_events_reach_diagnosis_and_healing() {
        let pool = init_test_db().unwrap();
        agents::upsert(&pool, "agent-a", "Agent A").unwrap();
        let orchestrator = make_orchestrator(&pool);

        // Five timeouts in quick succession cross the frequency bump.
        for i in 0..5 {
            let log = orchestrator
                .on_event(
                    "agent-a",
                    TriggerEventType::TaskComplete,
                    json!({
                        "task_title": format!("fetch page {i}"),
                        "success": false,
                        "error": "request timeout after 30000ms",
                    }),
                )
                .await
                .unwrap();
            assert_eq!(log.result, HeartbeatResult::Degraded);
        }

        // The healing session ran; with the no-op runtime the first safe
        // action resolves it.
        let recent = healing_repo::get_recent_for_agent(&pool, "agent-a", 5).unwrap();
        assert!(!recent.is_empty());
        assert_eq!(recent[0].issue_type, IssueType::Connectivity);
        assert_eq!(recent[0].status, HealingStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_memory_saved_feeds_behavior_patterns() {
        let pool = init_test_db().unwrap();
        agents::upsert(&pool, "agent-a", "Agent A").unwrap();
        let orchestrator = make_orchestrator(&pool);

        orchestrator
            .on_event(
                "agent-a",
                TriggerEventType::MemorySaved,
                json!({"kind": "preference", "topic": "tone"}),
            )
            .await
            .unwrap();

        let pattern = pattern_repo::get_by_group(
            &pool,
            "agent-a",
            PatternType::UserBehavior,
            "memory_preference",
        )
        .unwrap()
        .unwrap();
        assert_eq!(pattern.observation_count, 1);
        // Memories are not interactions.
        assert_eq!(agents::get_stats(&pool, "agent-a").unwrap().total_interactions, 0);
    }

    // --- run_heartbeat ---

    #[tokio::test]
    async fn test_scheduled_heartbeat_is_quiet_on_healthy_agent() {
        let pool = init_test_db().unwrap();
        agents::upsert(&pool, "agent-a", "Agent A").unwrap();
        let orchestrator = make_orchestrator(&pool);

        let log = orchestrator
            .run_heartbeat("agent-a", HeartbeatType::Scheduled)
            .await
            .unwrap();
        assert_eq!(log.result, HeartbeatResult::Ok);
        let step_names: Vec<&str> = log.sub_results.iter().map(|s| s.step.as_str()).collect();
        assert!(step_names.contains(&"stats_snapshot"));
        assert!(step_names.contains(&"pattern_analysis"));
        assert!(step_names.contains(&"scheduled_triggers"));
        assert!(step_names.contains(&"diagnosis"));
        assert!(step_names.contains(&"suggestion_expiry"));
    }

    #[tokio::test]
    async fn test_scheduled_heartbeat_fires_due_cron() {
        let pool = init_test_db().unwrap();
        agents::upsert(&pool, "agent-a", "Agent A").unwrap();
        let orchestrator = make_orchestrator(&pool);

        // Every-minute schedule is always due inside the window.
        let created = patterns::create_scheduled_pattern(
            &pool,
            "agent-a",
            "Sync inbox",
            "* * * * *",
            Utc::now(),
        )
        .unwrap();
        assert!(created.last_triggered_at.is_none());

        orchestrator
            .run_heartbeat("agent-a", HeartbeatType::Scheduled)
            .await
            .unwrap();
        let after = pattern_repo::get_by_id(&pool, &created.id).unwrap();
        assert!(after.last_triggered_at.is_some());

        // Within the cooldown a second pass does not re-fire.
        orchestrator
            .run_heartbeat("agent-a", HeartbeatType::Scheduled)
            .await
            .unwrap();
        let again = pattern_repo::get_by_id(&pool, &after.id).unwrap();
        assert_eq!(again.last_triggered_at, after.last_triggered_at);
    }

    // --- run_batch_heartbeat ---

    #[tokio::test]
    async fn test_batch_covers_enabled_agents_only() {
        let pool = init_test_db().unwrap();
        agents::upsert(&pool, "agent-a", "Agent A").unwrap();
        agents::upsert(&pool, "agent-b", "Agent B").unwrap();
        agents::upsert(&pool, "agent-c", "Agent C").unwrap();
        agents::set_enabled(&pool, "agent-c", false).unwrap();
        let orchestrator = make_orchestrator(&pool);

        let summary = orchestrator.run_batch_heartbeat().await.unwrap();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.ok, 2);
        assert_eq!(summary.error, 0);

        let since = (Utc::now() - chrono::Duration::minutes(5)).to_rfc3339();
        assert!(heartbeat_repo::recent_for_agent(&pool, "agent-c", &since)
            .unwrap()
            .is_empty());
    }
}
