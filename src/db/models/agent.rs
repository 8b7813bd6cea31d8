use serde::{Deserialize, Serialize};
use ts_rs::TS;

// ============================================================================
// Agents
// ============================================================================

/// Fleet roster mirror. The agent-execution runtime owns agents; the engine
/// keeps this row so its own tables have a foreign-key anchor and batch
/// heartbeats can enumerate the fleet.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub created_at: String,
    pub updated_at: String,
}

// ============================================================================
// Agent Stats
// ============================================================================

/// Rolling per-agent counters, updated on every lifecycle event and read as
/// the stats snapshot at the start of a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct AgentStats {
    pub agent_id: String,
    pub total_interactions: i64,
    pub total_tasks: i64,
    pub failed_tasks: i64,
    pub total_workflows: i64,
    pub failed_workflows: i64,
    /// Completed-without-failure share across tasks and workflows, in [0,1].
    pub success_rate: f64,
    pub last_interaction_at: Option<String>,
    pub updated_at: String,
}

impl AgentStats {
    pub fn empty(agent_id: &str, now: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            total_interactions: 0,
            total_tasks: 0,
            failed_tasks: 0,
            total_workflows: 0,
            failed_workflows: 0,
            success_rate: 1.0,
            last_interaction_at: None,
            updated_at: now.to_string(),
        }
    }
}
