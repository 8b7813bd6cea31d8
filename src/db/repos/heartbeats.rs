use rusqlite::{params, Row};

use crate::db::models::{HeartbeatLog, HeartbeatResult, HeartbeatType};
use crate::db::repos::{bad_enum, bad_json};
use crate::db::DbPool;
use crate::error::AppError;

fn row_to_log(row: &Row) -> rusqlite::Result<HeartbeatLog> {
    let type_raw: String = row.get("heartbeat_type")?;
    let result_raw: String = row.get("result")?;
    let subs_raw: String = row.get("sub_results")?;
    Ok(HeartbeatLog {
        id: row.get("id")?,
        agent_id: row.get("agent_id")?,
        heartbeat_type: HeartbeatType::parse(&type_raw)
            .ok_or_else(|| bad_enum("heartbeat_type", &type_raw))?,
        result: HeartbeatResult::parse(&result_raw)
            .ok_or_else(|| bad_enum("result", &result_raw))?,
        sub_results: serde_json::from_str(&subs_raw).map_err(|e| bad_json("sub_results", e))?,
        duration_ms: row.get("duration_ms")?,
        triggered_at: row.get("triggered_at")?,
    })
}

pub fn insert(pool: &DbPool, log: &HeartbeatLog) -> Result<(), AppError> {
    let subs = serde_json::to_string(&log.sub_results)?;
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO heartbeat_logs
         (id, agent_id, heartbeat_type, result, sub_results, duration_ms, triggered_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            log.id,
            log.agent_id,
            log.heartbeat_type.as_str(),
            log.result.as_str(),
            subs,
            log.duration_ms,
            log.triggered_at,
        ],
    )?;
    Ok(())
}

/// One agent's logs since a cutoff, newest first.
pub fn recent_for_agent(
    pool: &DbPool,
    agent_id: &str,
    since: &str,
) -> Result<Vec<HeartbeatLog>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT * FROM heartbeat_logs
         WHERE agent_id = ?1 AND triggered_at >= ?2
         ORDER BY triggered_at DESC",
    )?;
    let rows = stmt.query_map(params![agent_id, since], row_to_log)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// Every agent's logs since a cutoff. Blast-radius analysis needs the
/// cross-agent view.
pub fn recent_all(pool: &DbPool, since: &str) -> Result<Vec<HeartbeatLog>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT * FROM heartbeat_logs
         WHERE triggered_at >= ?1
         ORDER BY triggered_at DESC",
    )?;
    let rows = stmt.query_map(params![since], row_to_log)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn prune_older_than(pool: &DbPool, cutoff: &str) -> Result<usize, AppError> {
    let conn = pool.get()?;
    let deleted = conn.execute(
        "DELETE FROM heartbeat_logs WHERE triggered_at < ?1",
        params![cutoff],
    )?;
    Ok(deleted)
}
