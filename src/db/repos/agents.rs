use rusqlite::{params, Row};

use crate::db::models::{Agent, AgentStats};
use crate::db::DbPool;
use crate::error::AppError;

fn row_to_agent(row: &Row) -> rusqlite::Result<Agent> {
    Ok(Agent {
        id: row.get("id")?,
        name: row.get("name")?,
        enabled: row.get("enabled")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_stats(row: &Row) -> rusqlite::Result<AgentStats> {
    Ok(AgentStats {
        agent_id: row.get("agent_id")?,
        total_interactions: row.get("total_interactions")?,
        total_tasks: row.get("total_tasks")?,
        failed_tasks: row.get("failed_tasks")?,
        total_workflows: row.get("total_workflows")?,
        failed_workflows: row.get("failed_workflows")?,
        success_rate: row.get("success_rate")?,
        last_interaction_at: row.get("last_interaction_at")?,
        updated_at: row.get("updated_at")?,
    })
}

/// Register or refresh an agent in the roster mirror. Events for unknown
/// agents call this first so foreign keys always resolve.
pub fn upsert(pool: &DbPool, id: &str, name: &str) -> Result<Agent, AppError> {
    if id.trim().is_empty() {
        return Err(AppError::Validation("Agent id cannot be empty".into()));
    }
    let now = chrono::Utc::now().to_rfc3339();
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO agents (id, name, enabled, created_at, updated_at)
         VALUES (?1, ?2, 1, ?3, ?3)
         ON CONFLICT(id) DO UPDATE SET name = ?2, updated_at = ?3",
        params![id, name, now],
    )?;
    get_by_id(pool, id)
}

pub fn get_by_id(pool: &DbPool, id: &str) -> Result<Agent, AppError> {
    let conn = pool.get()?;
    conn.query_row("SELECT * FROM agents WHERE id = ?1", params![id], row_to_agent)
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => AppError::NotFound(format!("Agent {id}")),
            other => AppError::Database(other),
        })
}

pub fn get_enabled(pool: &DbPool) -> Result<Vec<Agent>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare("SELECT * FROM agents WHERE enabled = 1 ORDER BY id")?;
    let rows = stmt.query_map([], row_to_agent)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn set_enabled(pool: &DbPool, id: &str, enabled: bool) -> Result<Agent, AppError> {
    let now = chrono::Utc::now().to_rfc3339();
    let conn = pool.get()?;
    let changed = conn.execute(
        "UPDATE agents SET enabled = ?1, updated_at = ?2 WHERE id = ?3",
        params![enabled, now, id],
    )?;
    if changed == 0 {
        return Err(AppError::NotFound(format!("Agent {id}")));
    }
    drop(conn);
    get_by_id(pool, id)
}

// ============================================================================
// Stats
// ============================================================================

/// Read the rolling counters, defaulting to an empty row for agents that
/// have not produced an event yet.
pub fn get_stats(pool: &DbPool, agent_id: &str) -> Result<AgentStats, AppError> {
    let conn = pool.get()?;
    let found = conn
        .query_row(
            "SELECT * FROM agent_stats WHERE agent_id = ?1",
            params![agent_id],
            row_to_stats,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(AppError::Database(other)),
        })?;
    let now = chrono::Utc::now().to_rfc3339();
    Ok(found.unwrap_or_else(|| AgentStats::empty(agent_id, &now)))
}

/// Fold one lifecycle event into the counters. The orchestrator serializes
/// writes per agent, so read-modify-write here cannot lose updates.
pub fn record_event(
    pool: &DbPool,
    agent_id: &str,
    is_task: bool,
    is_workflow: bool,
    failed: bool,
) -> Result<AgentStats, AppError> {
    let mut stats = get_stats(pool, agent_id)?;
    let now = chrono::Utc::now().to_rfc3339();

    stats.total_interactions += 1;
    if is_task {
        stats.total_tasks += 1;
        if failed {
            stats.failed_tasks += 1;
        }
    }
    if is_workflow {
        stats.total_workflows += 1;
        if failed {
            stats.failed_workflows += 1;
        }
    }
    let attempts = stats.total_tasks + stats.total_workflows;
    stats.success_rate = if attempts == 0 {
        1.0
    } else {
        (attempts - stats.failed_tasks - stats.failed_workflows) as f64 / attempts as f64
    };
    stats.last_interaction_at = Some(now.clone());
    stats.updated_at = now;

    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO agent_stats
         (agent_id, total_interactions, total_tasks, failed_tasks, total_workflows,
          failed_workflows, success_rate, last_interaction_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(agent_id) DO UPDATE SET
           total_interactions = ?2, total_tasks = ?3, failed_tasks = ?4,
           total_workflows = ?5, failed_workflows = ?6, success_rate = ?7,
           last_interaction_at = ?8, updated_at = ?9",
        params![
            stats.agent_id,
            stats.total_interactions,
            stats.total_tasks,
            stats.failed_tasks,
            stats.total_workflows,
            stats.failed_workflows,
            stats.success_rate,
            stats.last_interaction_at,
            stats.updated_at,
        ],
    )?;
    Ok(stats)
}
