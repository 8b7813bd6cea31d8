//! Background loops: scheduled batch heartbeats, a fast healing poll so
//! in-progress remediations do not wait a full heartbeat interval, and an
//! hourly retention sweep.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::config::EngineConfig;
use crate::db::repos::{agents, heartbeats as heartbeat_repo, patterns as pattern_repo};
use crate::db::DbPool;
use crate::engine::feed::{ProactiveFeed, ProactiveProjection};
use crate::engine::healing::HealingExecutor;
use crate::engine::heartbeat::HeartbeatOrchestrator;

const HEALING_POLL_SECS: u64 = 60;
const CLEANUP_INTERVAL_SECS: u64 = 3600;

/// Runtime state for the background loops, shared across threads.
pub struct EngineState {
    running: AtomicBool,
    batches_run: AtomicU64,
    agents_ok: AtomicU64,
    agents_degraded: AtomicU64,
    agents_failed: AtomicU64,
    healing_advanced: AtomicU64,
    rows_pruned: AtomicU64,
}

impl Default for EngineState {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineState {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            batches_run: AtomicU64::new(0),
            agents_ok: AtomicU64::new(0),
            agents_degraded: AtomicU64::new(0),
            agents_failed: AtomicU64::new(0),
            healing_advanced: AtomicU64::new(0),
            rows_pruned: AtomicU64::new(0),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> EngineLoopStats {
        EngineLoopStats {
            running: self.running.load(Ordering::Relaxed),
            batches_run: self.batches_run.load(Ordering::Relaxed),
            agents_ok: self.agents_ok.load(Ordering::Relaxed),
            agents_degraded: self.agents_degraded.load(Ordering::Relaxed),
            agents_failed: self.agents_failed.load(Ordering::Relaxed),
            healing_advanced: self.healing_advanced.load(Ordering::Relaxed),
            rows_pruned: self.rows_pruned.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineLoopStats {
    pub running: bool,
    pub batches_run: u64,
    pub agents_ok: u64,
    pub agents_degraded: u64,
    pub agents_failed: u64,
    pub healing_advanced: u64,
    pub rows_pruned: u64,
}

/// Start all background loops. Returns immediately.
pub fn start_loops(
    state: Arc<EngineState>,
    pool: DbPool,
    config: EngineConfig,
    orchestrator: Arc<HeartbeatOrchestrator>,
    executor: Arc<HealingExecutor>,
    feed: Arc<ProactiveFeed>,
    projection: Arc<ProactiveProjection>,
) {
    state.running.store(true, Ordering::Relaxed);
    tracing::info!(
        heartbeat_minutes = config.heartbeat_interval_minutes,
        healing_poll_secs = HEALING_POLL_SECS,
        "Background loops starting"
    );

    // Batch heartbeat loop
    tokio::spawn({
        let state = state.clone();
        let config = config.clone();
        async move {
            heartbeat_loop(state, config, orchestrator).await;
        }
    });

    // Healing poll loop
    tokio::spawn({
        let state = state.clone();
        let pool = pool.clone();
        async move {
            healing_poll_loop(state, pool, executor, feed, projection).await;
        }
    });

    // Cleanup loop (hourly)
    tokio::spawn({
        let state = state.clone();
        async move {
            cleanup_loop(state, pool, config).await;
        }
    });
}

/// Stop all background loops.
pub fn stop_loops(state: &EngineState) {
    state.running.store(false, Ordering::Relaxed);
    tracing::info!("Background loops stopped");
}

/// Scheduled heartbeats: sweep the enabled fleet every interval.
async fn heartbeat_loop(
    state: Arc<EngineState>,
    config: EngineConfig,
    orchestrator: Arc<HeartbeatOrchestrator>,
) {
    let period = Duration::from_secs(config.heartbeat_interval_minutes.max(1) * 60);
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        if !state.is_running() {
            break;
        }

        match orchestrator.run_batch_heartbeat().await {
            Ok(summary) => {
                state.batches_run.fetch_add(1, Ordering::Relaxed);
                state.agents_ok.fetch_add(summary.ok as u64, Ordering::Relaxed);
                state
                    .agents_degraded
                    .fetch_add(summary.degraded as u64, Ordering::Relaxed);
                state
                    .agents_failed
                    .fetch_add(summary.error as u64, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::error!("Batch heartbeat error: {}", e);
            }
        }
    }
    tracing::info!("Heartbeat loop exited");
}

/// Fast poll for healing sessions: re-check `executing` records and close
/// quiet `awaiting_approval` ones without waiting for the next heartbeat.
async fn healing_poll_loop(
    state: Arc<EngineState>,
    pool: DbPool,
    executor: Arc<HealingExecutor>,
    feed: Arc<ProactiveFeed>,
    projection: Arc<ProactiveProjection>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(HEALING_POLL_SECS));
    loop {
        interval.tick().await;
        if !state.is_running() {
            break;
        }

        let now = chrono::Utc::now();
        let mut moved = Vec::new();

        match executor.poll_executing_sessions(now).await {
            Ok(records) => moved.extend(records),
            Err(e) => {
                tracing::error!("Healing poll error: {}", e);
                continue;
            }
        }

        let roster = match agents::get_enabled(&pool) {
            Ok(r) => r,
            Err(e) => {
                tracing::error!("Healing poll roster error: {}", e);
                continue;
            }
        };
        for agent in roster {
            match executor.check_self_resolution(&agent.id, now) {
                Ok(records) => moved.extend(records),
                Err(e) => {
                    tracing::warn!(agent_id = %agent.id, "Self-resolution check error: {}", e);
                }
            }
        }

        if !moved.is_empty() {
            state
                .healing_advanced
                .fetch_add(moved.len() as u64, Ordering::Relaxed);
            for record in moved {
                let event = projection.healing_updated(record);
                feed.publish(&event);
            }
        }
    }
    tracing::info!("Healing poll loop exited");
}

/// Retention: drop heartbeat logs and raw observations past the window.
async fn cleanup_loop(state: Arc<EngineState>, pool: DbPool, config: EngineConfig) {
    let mut interval = tokio::time::interval(Duration::from_secs(CLEANUP_INTERVAL_SECS));
    loop {
        interval.tick().await;
        if !state.is_running() {
            break;
        }

        let cutoff =
            (chrono::Utc::now() - chrono::Duration::days(config.retention_days)).to_rfc3339();
        let mut pruned = 0usize;
        match heartbeat_repo::prune_older_than(&pool, &cutoff) {
            Ok(n) => pruned += n,
            Err(e) => tracing::error!("Heartbeat log prune error: {}", e),
        }
        match pattern_repo::prune_observations(&pool, &cutoff) {
            Ok(n) => pruned += n,
            Err(e) => tracing::error!("Observation prune error: {}", e),
        }
        if pruned > 0 {
            state.rows_pruned.fetch_add(pruned as u64, Ordering::Relaxed);
            tracing::info!(rows = pruned, "Cleaned up expired engine data");
        }
    }
}
