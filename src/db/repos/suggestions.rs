use rusqlite::{params, Row};

use crate::db::models::{
    SuggestedActionKind, Suggestion, SuggestionPriority, SuggestionStatus, SuggestionType,
};
use crate::db::repos::{bad_enum, bad_json};
use crate::db::DbPool;
use crate::error::AppError;

fn row_to_suggestion(row: &Row) -> rusqlite::Result<Suggestion> {
    let type_raw: String = row.get("suggestion_type")?;
    let priority_raw: String = row.get("priority")?;
    let action_raw: String = row.get("action_type")?;
    let params_raw: String = row.get("action_params")?;
    let status_raw: String = row.get("status")?;
    Ok(Suggestion {
        id: row.get("id")?,
        agent_id: row.get("agent_id")?,
        source_pattern_id: row.get("source_pattern_id")?,
        suggestion_type: SuggestionType::parse(&type_raw)
            .ok_or_else(|| bad_enum("suggestion_type", &type_raw))?,
        priority: SuggestionPriority::parse(&priority_raw)
            .ok_or_else(|| bad_enum("priority", &priority_raw))?,
        title: row.get("title")?,
        body: row.get("body")?,
        action_type: SuggestedActionKind::parse(&action_raw)
            .ok_or_else(|| bad_enum("action_type", &action_raw))?,
        action_params: serde_json::from_str(&params_raw)
            .map_err(|e| bad_json("action_params", e))?,
        confidence: row.get("confidence")?,
        status: SuggestionStatus::parse(&status_raw)
            .ok_or_else(|| bad_enum("status", &status_raw))?,
        created_at: row.get("created_at")?,
        expires_at: row.get("expires_at")?,
        resolved_at: row.get("resolved_at")?,
    })
}

pub fn get_by_id(pool: &DbPool, id: &str) -> Result<Suggestion, AppError> {
    let conn = pool.get()?;
    conn.query_row(
        "SELECT * FROM proactive_suggestions WHERE id = ?1",
        params![id],
        row_to_suggestion,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => AppError::NotFound(format!("Suggestion {id}")),
        other => AppError::Database(other),
    })
}

pub fn insert(pool: &DbPool, s: &Suggestion) -> Result<(), AppError> {
    if s.title.trim().is_empty() {
        return Err(AppError::Validation("Suggestion title cannot be empty".into()));
    }
    let action_params = serde_json::to_string(&s.action_params)?;
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO proactive_suggestions
         (id, agent_id, source_pattern_id, suggestion_type, priority, title, body,
          action_type, action_params, confidence, status, created_at, expires_at, resolved_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            s.id,
            s.agent_id,
            s.source_pattern_id,
            s.suggestion_type.as_str(),
            s.priority.as_str(),
            s.title,
            s.body,
            s.action_type.as_str(),
            action_params,
            s.confidence,
            s.status.as_str(),
            s.created_at,
            s.expires_at,
            s.resolved_at,
        ],
    )?;
    Ok(())
}

pub fn get_pending(pool: &DbPool, agent_id: &str) -> Result<Vec<Suggestion>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT * FROM proactive_suggestions
         WHERE agent_id = ?1 AND status = 'pending'
         ORDER BY created_at DESC",
    )?;
    let rows = stmt.query_map(params![agent_id], row_to_suggestion)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn count_pending(pool: &DbPool, agent_id: &str) -> Result<i64, AppError> {
    let conn = pool.get()?;
    let count = conn.query_row(
        "SELECT COUNT(*) FROM proactive_suggestions WHERE agent_id = ?1 AND status = 'pending'",
        params![agent_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Creation time of the newest suggestion derived from this pattern,
/// regardless of status. Drives the cooldown dedup.
pub fn latest_for_pattern(
    pool: &DbPool,
    source_pattern_id: &str,
) -> Result<Option<String>, AppError> {
    let conn = pool.get()?;
    conn.query_row(
        "SELECT created_at FROM proactive_suggestions
         WHERE source_pattern_id = ?1
         ORDER BY created_at DESC LIMIT 1",
        params![source_pattern_id],
        |row| row.get(0),
    )
    .map(Some)
    .or_else(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(AppError::Database(other)),
    })
}

/// Operator surface: accept or dismiss a pending suggestion. Any other
/// target status or a non-pending start state is a validation error.
pub fn update_status(
    pool: &DbPool,
    id: &str,
    status: SuggestionStatus,
) -> Result<Suggestion, AppError> {
    if !matches!(status, SuggestionStatus::Accepted | SuggestionStatus::Dismissed) {
        return Err(AppError::Validation(format!(
            "Operators may only accept or dismiss suggestions, got {}",
            status.as_str()
        )));
    }
    let current = get_by_id(pool, id)?;
    if current.status != SuggestionStatus::Pending {
        return Err(AppError::Validation(format!(
            "Suggestion {id} is {}, not pending",
            current.status.as_str()
        )));
    }
    let now = chrono::Utc::now().to_rfc3339();
    let conn = pool.get()?;
    conn.execute(
        "UPDATE proactive_suggestions SET status = ?2, resolved_at = ?3 WHERE id = ?1",
        params![id, status.as_str(), now],
    )?;
    drop(conn);
    get_by_id(pool, id)
}

/// Flip overdue pending suggestions to expired; returns the affected rows
/// so the projection can mirror them.
pub fn expire_overdue(pool: &DbPool, agent_id: &str, now: &str) -> Result<Vec<Suggestion>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT id FROM proactive_suggestions
         WHERE agent_id = ?1 AND status = 'pending' AND expires_at <= ?2",
    )?;
    let ids: Vec<String> = stmt
        .query_map(params![agent_id, now], |row| row.get(0))?
        .filter_map(|r| r.ok())
        .collect();
    if ids.is_empty() {
        return Ok(vec![]);
    }
    conn.execute(
        "UPDATE proactive_suggestions SET status = 'expired', resolved_at = ?2
         WHERE agent_id = ?1 AND status = 'pending' AND expires_at <= ?2",
        params![agent_id, now],
    )?;
    drop(stmt);
    drop(conn);
    ids.iter().map(|id| get_by_id(pool, id)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;
    use crate::db::repos::agents;

    fn make_suggestion(agent_id: &str, pattern_id: Option<&str>) -> Suggestion {
        let now = chrono::Utc::now();
        Suggestion {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            source_pattern_id: pattern_id.map(|s| s.to_string()),
            suggestion_type: SuggestionType::AutomateRecurringTask,
            priority: SuggestionPriority::Medium,
            title: "Automate the Monday report".into(),
            body: "This task recurred 3 times; set up an automation?".into(),
            action_type: SuggestedActionKind::CreateAutomation,
            action_params: serde_json::json!({"task_title": "send_report"}),
            confidence: 0.75,
            status: SuggestionStatus::Pending,
            created_at: now.to_rfc3339(),
            expires_at: (now + chrono::Duration::hours(48)).to_rfc3339(),
            resolved_at: None,
        }
    }

    #[test]
    fn test_suggestion_lifecycle() {
        let pool = init_test_db().unwrap();
        agents::upsert(&pool, "agent-1", "Support Bot").unwrap();

        let s = make_suggestion("agent-1", None);
        insert(&pool, &s).unwrap();

        assert_eq!(count_pending(&pool, "agent-1").unwrap(), 1);
        let pending = get_pending(&pool, "agent-1").unwrap();
        assert_eq!(pending[0].action_type, SuggestedActionKind::CreateAutomation);
        assert_eq!(pending[0].action_params["task_title"], "send_report");

        let accepted = update_status(&pool, &s.id, SuggestionStatus::Accepted).unwrap();
        assert_eq!(accepted.status, SuggestionStatus::Accepted);
        assert!(accepted.resolved_at.is_some());

        // Accepting twice is a validation error (already resolved).
        assert!(update_status(&pool, &s.id, SuggestionStatus::Dismissed).is_err());
        // Operators cannot set engine-owned statuses.
        let s2 = make_suggestion("agent-1", None);
        insert(&pool, &s2).unwrap();
        assert!(update_status(&pool, &s2.id, SuggestionStatus::Expired).is_err());
    }

    #[test]
    fn test_expiry_sweep_and_cooldown_lookup() {
        let pool = init_test_db().unwrap();
        agents::upsert(&pool, "agent-1", "Support Bot").unwrap();

        // A suggestion's source pattern must exist (FK).
        let now_ts = chrono::Utc::now();
        let pattern = crate::db::models::Pattern {
            id: "pat-1".into(),
            agent_id: "agent-1".into(),
            pattern_type: crate::db::models::PatternType::RecurringTask,
            group_key: "send_report::mon".into(),
            condition_rules: crate::db::models::ConditionRules {
                trigger: crate::db::models::TriggerRule::Event {
                    event_type: crate::db::models::TriggerEventType::TaskComplete,
                },
                conditions: vec![],
                cooldown_minutes: 60,
            },
            confidence: 0.8,
            observation_count: 3,
            active: true,
            last_observed_at: now_ts.to_rfc3339(),
            last_triggered_at: None,
            expires_at: (now_ts + chrono::Duration::days(30)).to_rfc3339(),
            created_at: now_ts.to_rfc3339(),
            updated_at: now_ts.to_rfc3339(),
        };
        crate::db::repos::patterns::insert(&pool, &pattern).unwrap();

        let mut overdue = make_suggestion("agent-1", Some("pat-1"));
        overdue.expires_at = (now_ts - chrono::Duration::hours(1)).to_rfc3339();
        overdue.created_at = (now_ts - chrono::Duration::hours(2)).to_rfc3339();
        insert(&pool, &overdue).unwrap();
        let fresh = make_suggestion("agent-1", Some("pat-1"));
        insert(&pool, &fresh).unwrap();

        let now = chrono::Utc::now().to_rfc3339();
        let expired = expire_overdue(&pool, "agent-1", &now).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, overdue.id);
        assert_eq!(expired[0].status, SuggestionStatus::Expired);
        assert_eq!(count_pending(&pool, "agent-1").unwrap(), 1);

        // Cooldown lookup sees the newest row for the pattern either way.
        let latest = latest_for_pattern(&pool, "pat-1").unwrap().unwrap();
        assert_eq!(latest, fresh.created_at);
        assert!(latest_for_pattern(&pool, "pat-404").unwrap().is_none());
    }
}
