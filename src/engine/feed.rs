//! Live feed and read-side projection.
//!
//! [`ProactiveFeed`] is a plain observer registry: subscribers get an
//! unbounded channel and an id to unsubscribe with, publishers never block,
//! and dead subscribers are pruned on the next publish.
//!
//! [`ProactiveProjection`] is the in-memory read model the feed events are
//! stamped from. Every record key carries a monotonically increasing version
//! so consumers can discard out-of-order deliveries; the projection is
//! rebuilt from the store at startup and kept current by the engine
//! afterwards.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use serde::Serialize;
use tokio::sync::mpsc;
use ts_rs::TS;

use crate::db::models::{HealingRecord, HeartbeatLog, Pattern, Suggestion};
use crate::db::repos::{agents, healing as healing_repo, patterns as pattern_repo, suggestions as suggestion_repo};
use crate::db::DbPool;
use crate::error::AppError;

/// One entry on the live feed. `version` is per record key: a consumer that
/// sees version 7 for a record can drop any later delivery with version <= 7.
#[derive(Debug, Clone, Serialize, TS)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[ts(export)]
pub enum ProactiveEvent {
    SuggestionCreated { version: u64, suggestion: Suggestion },
    SuggestionUpdated { version: u64, suggestion: Suggestion },
    PatternUpdated { version: u64, pattern: Pattern },
    HealingUpdated { version: u64, record: HealingRecord },
    HeartbeatCompleted { version: u64, log: HeartbeatLog },
}

impl ProactiveEvent {
    pub fn version(&self) -> u64 {
        match self {
            ProactiveEvent::SuggestionCreated { version, .. }
            | ProactiveEvent::SuggestionUpdated { version, .. }
            | ProactiveEvent::PatternUpdated { version, .. }
            | ProactiveEvent::HealingUpdated { version, .. }
            | ProactiveEvent::HeartbeatCompleted { version, .. } => *version,
        }
    }
}

// ---------------------------------------------------------------------------
// Feed
// ---------------------------------------------------------------------------

pub type SubscriptionId = u64;

#[derive(Default)]
pub struct ProactiveFeed {
    subscribers: RwLock<HashMap<SubscriptionId, mpsc::UnboundedSender<ProactiveEvent>>>,
    next_id: AtomicU64,
}

impl ProactiveFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. The receiver sees every event published after
    /// this call; dropping it (or calling [`Self::unsubscribe`]) ends the
    /// subscription.
    pub fn subscribe(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<ProactiveEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut subs) = self.subscribers.write() {
            subs.insert(id, tx);
        }
        (id, rx)
    }

    /// Returns false when the id was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers
            .write()
            .map(|mut subs| subs.remove(&id).is_some())
            .unwrap_or(false)
    }

    /// Deliver one event to every live subscriber. Closed channels are
    /// dropped from the registry here rather than on a timer.
    pub fn publish(&self, event: &ProactiveEvent) {
        let Ok(mut subs) = self.subscribers.write() else {
            return;
        };
        subs.retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().map(|s| s.len()).unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Projection
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ProjectionState {
    versions: HashMap<String, u64>,
    pending_suggestions: HashMap<String, Suggestion>,
    active_healing: HashMap<String, HealingRecord>,
    active_patterns: HashMap<String, Pattern>,
}

impl ProjectionState {
    fn bump(&mut self, key: &str) -> u64 {
        let v = self.versions.entry(key.to_string()).or_insert(0);
        *v += 1;
        *v
    }
}

/// Read model over the store: pending suggestions, open healing sessions and
/// active patterns, versioned per record.
#[derive(Default)]
pub struct ProactiveProjection {
    state: RwLock<ProjectionState>,
}

impl ProactiveProjection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reload the whole read model from the store. Versions restart at 1; the
    /// per-record guarantee is monotonicity within a process lifetime.
    pub fn rebuild(&self, pool: &DbPool) -> Result<(), AppError> {
        let mut fresh = ProjectionState::default();
        for agent in agents::get_enabled(pool)? {
            for s in suggestion_repo::get_pending(pool, &agent.id)? {
                fresh.bump(&s.id);
                fresh.pending_suggestions.insert(s.id.clone(), s);
            }
            let now = chrono::Utc::now().to_rfc3339();
            for p in pattern_repo::get_active(pool, &agent.id, 0.0, &now)? {
                fresh.bump(&p.id);
                fresh.active_patterns.insert(p.id.clone(), p);
            }
        }
        for r in healing_repo::get_active(pool, None)? {
            fresh.bump(&r.id);
            fresh.active_healing.insert(r.id.clone(), r);
        }
        let suggestions = fresh.pending_suggestions.len();
        let healing = fresh.active_healing.len();
        let patterns = fresh.active_patterns.len();
        if let Ok(mut state) = self.state.write() {
            *state = fresh;
        }
        tracing::info!(suggestions, healing, patterns, "Projection rebuilt from store");
        Ok(())
    }

    pub fn suggestion_created(&self, suggestion: Suggestion) -> ProactiveEvent {
        self.upsert_suggestion(suggestion, true)
    }

    pub fn suggestion_updated(&self, suggestion: Suggestion) -> ProactiveEvent {
        self.upsert_suggestion(suggestion, false)
    }

    fn upsert_suggestion(&self, suggestion: Suggestion, created: bool) -> ProactiveEvent {
        let version = self
            .state
            .write()
            .map(|mut state| {
                let version = state.bump(&suggestion.id);
                if suggestion.status == crate::db::models::SuggestionStatus::Pending {
                    state
                        .pending_suggestions
                        .insert(suggestion.id.clone(), suggestion.clone());
                } else {
                    state.pending_suggestions.remove(&suggestion.id);
                }
                version
            })
            .unwrap_or(0);
        if created {
            ProactiveEvent::SuggestionCreated { version, suggestion }
        } else {
            ProactiveEvent::SuggestionUpdated { version, suggestion }
        }
    }

    pub fn pattern_updated(&self, pattern: Pattern) -> ProactiveEvent {
        let version = self
            .state
            .write()
            .map(|mut state| {
                let version = state.bump(&pattern.id);
                if pattern.active {
                    state.active_patterns.insert(pattern.id.clone(), pattern.clone());
                } else {
                    state.active_patterns.remove(&pattern.id);
                }
                version
            })
            .unwrap_or(0);
        ProactiveEvent::PatternUpdated { version, pattern }
    }

    pub fn healing_updated(&self, record: HealingRecord) -> ProactiveEvent {
        let version = self
            .state
            .write()
            .map(|mut state| {
                let version = state.bump(&record.id);
                if record.status.is_terminal() {
                    state.active_healing.remove(&record.id);
                } else {
                    state.active_healing.insert(record.id.clone(), record.clone());
                }
                version
            })
            .unwrap_or(0);
        ProactiveEvent::HealingUpdated { version, record }
    }

    /// Heartbeats version per agent rather than per log row, so a feed
    /// consumer can tell "a newer cycle finished" without tracking log ids.
    pub fn heartbeat_completed(&self, log: HeartbeatLog) -> ProactiveEvent {
        let key = format!("heartbeat:{}", log.agent_id);
        let version = self
            .state
            .write()
            .map(|mut state| state.bump(&key))
            .unwrap_or(0);
        ProactiveEvent::HeartbeatCompleted { version, log }
    }

    // --- snapshot accessors ---

    pub fn pending_suggestions(&self, agent_id: &str) -> Vec<Suggestion> {
        self.state
            .read()
            .map(|state| {
                let mut out: Vec<Suggestion> = state
                    .pending_suggestions
                    .values()
                    .filter(|s| s.agent_id == agent_id)
                    .cloned()
                    .collect();
                out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                out
            })
            .unwrap_or_default()
    }

    pub fn active_healing(&self, agent_id: Option<&str>) -> Vec<HealingRecord> {
        self.state
            .read()
            .map(|state| {
                state
                    .active_healing
                    .values()
                    .filter(|r| agent_id.map_or(true, |id| r.agent_id == id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn active_patterns(&self, agent_id: &str) -> Vec<Pattern> {
        self.state
            .read()
            .map(|state| {
                state
                    .active_patterns
                    .values()
                    .filter(|p| p.agent_id == agent_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn version_of(&self, record_id: &str) -> Option<u64> {
        self.state
            .read()
            .ok()
            .and_then(|state| state.versions.get(record_id).copied())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;
    use crate::db::models::{
        SuggestedActionKind, SuggestionPriority, SuggestionStatus, SuggestionType,
    };

    fn make_suggestion(id: &str, status: SuggestionStatus) -> Suggestion {
        let now = chrono::Utc::now();
        Suggestion {
            id: id.to_string(),
            agent_id: "agent-a".into(),
            source_pattern_id: None,
            suggestion_type: SuggestionType::BehaviorInsight,
            priority: SuggestionPriority::Low,
            title: "Recurring theme".into(),
            body: "theme body".into(),
            action_type: SuggestedActionKind::None,
            action_params: serde_json::json!({}),
            confidence: 0.8,
            status,
            created_at: now.to_rfc3339(),
            expires_at: (now + chrono::Duration::hours(48)).to_rfc3339(),
            resolved_at: None,
        }
    }

    // --- feed ---

    #[tokio::test]
    async fn test_subscribe_publish_unsubscribe() {
        let feed = ProactiveFeed::new();
        let projection = ProactiveProjection::new();
        let (id_a, mut rx_a) = feed.subscribe();
        let (_id_b, mut rx_b) = feed.subscribe();
        assert_eq!(feed.subscriber_count(), 2);

        let event = projection.suggestion_created(make_suggestion("s-1", SuggestionStatus::Pending));
        feed.publish(&event);
        assert_eq!(rx_a.recv().await.unwrap().version(), 1);
        assert_eq!(rx_b.recv().await.unwrap().version(), 1);

        assert!(feed.unsubscribe(id_a));
        assert!(!feed.unsubscribe(id_a));
        assert_eq!(feed.subscriber_count(), 1);

        let event = projection.suggestion_updated(make_suggestion("s-1", SuggestionStatus::Accepted));
        feed.publish(&event);
        assert_eq!(rx_b.recv().await.unwrap().version(), 2);
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropped_receiver_pruned_on_publish() {
        let feed = ProactiveFeed::new();
        let projection = ProactiveProjection::new();
        let (_id, rx) = feed.subscribe();
        drop(rx);
        assert_eq!(feed.subscriber_count(), 1);

        let event = projection.suggestion_created(make_suggestion("s-1", SuggestionStatus::Pending));
        feed.publish(&event);
        assert_eq!(feed.subscriber_count(), 0);
    }

    // --- projection ---

    #[test]
    fn test_versions_monotonic_and_independent() {
        let projection = ProactiveProjection::new();
        let e1 = projection.suggestion_created(make_suggestion("s-1", SuggestionStatus::Pending));
        let e2 = projection.suggestion_updated(make_suggestion("s-1", SuggestionStatus::Pending));
        let e3 = projection.suggestion_created(make_suggestion("s-2", SuggestionStatus::Pending));
        assert_eq!(e1.version(), 1);
        assert_eq!(e2.version(), 2);
        assert_eq!(e3.version(), 1);
        assert_eq!(projection.version_of("s-1"), Some(2));
        assert_eq!(projection.version_of("s-404"), None);
    }

    #[test]
    fn test_resolved_suggestion_leaves_snapshot() {
        let projection = ProactiveProjection::new();
        projection.suggestion_created(make_suggestion("s-1", SuggestionStatus::Pending));
        assert_eq!(projection.pending_suggestions("agent-a").len(), 1);

        projection.suggestion_updated(make_suggestion("s-1", SuggestionStatus::Dismissed));
        assert!(projection.pending_suggestions("agent-a").is_empty());
        // The version survives removal so late deliveries stay ordered.
        assert_eq!(projection.version_of("s-1"), Some(2));
    }

    #[test]
    fn test_heartbeat_versions_per_agent() {
        let projection = ProactiveProjection::new();
        let make_log = |agent: &str| HeartbeatLog {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent.to_string(),
            heartbeat_type: crate::db::models::HeartbeatType::Scheduled,
            result: crate::db::models::HeartbeatResult::Ok,
            sub_results: vec![],
            duration_ms: Some(5),
            triggered_at: chrono::Utc::now().to_rfc3339(),
        };
        assert_eq!(projection.heartbeat_completed(make_log("agent-a")).version(), 1);
        assert_eq!(projection.heartbeat_completed(make_log("agent-a")).version(), 2);
        assert_eq!(projection.heartbeat_completed(make_log("agent-b")).version(), 1);
    }

    #[test]
    fn test_rebuild_from_store() {
        let pool = init_test_db().unwrap();
        crate::db::repos::agents::upsert(&pool, "agent-a", "Agent A").unwrap();
        let suggestion = make_suggestion("s-1", SuggestionStatus::Pending);
        suggestion_repo::insert(&pool, &suggestion).unwrap();

        let projection = ProactiveProjection::new();
        projection.rebuild(&pool).unwrap();
        let pending = projection.pending_suggestions("agent-a");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "s-1");
        assert_eq!(projection.version_of("s-1"), Some(1));
        assert!(projection.active_healing(None).is_empty());
    }
}
