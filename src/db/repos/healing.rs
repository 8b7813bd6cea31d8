use rusqlite::{params, Row};

use crate::db::models::{ActionType, HealingRecord, HealingStat, HealingStatus, IssueSeverity, IssueType};
use crate::db::repos::{bad_enum, bad_json};
use crate::db::DbPool;
use crate::error::AppError;

fn row_to_record(row: &Row) -> rusqlite::Result<HealingRecord> {
    let issue_raw: String = row.get("issue_type")?;
    let severity_raw: String = row.get("severity")?;
    let status_raw: String = row.get("status")?;
    let diagnosis_raw: String = row.get("diagnosis")?;
    let actions_raw: String = row.get("actions")?;
    let audit_raw: String = row.get("audit_trail")?;
    Ok(HealingRecord {
        id: row.get("id")?,
        agent_id: row.get("agent_id")?,
        issue_type: IssueType::parse(&issue_raw).ok_or_else(|| bad_enum("issue_type", &issue_raw))?,
        severity: IssueSeverity::parse(&severity_raw)
            .ok_or_else(|| bad_enum("severity", &severity_raw))?,
        diagnosis: serde_json::from_str(&diagnosis_raw).map_err(|e| bad_json("diagnosis", e))?,
        actions: serde_json::from_str(&actions_raw).map_err(|e| bad_json("actions", e))?,
        current_action: row.get("current_action")?,
        status: HealingStatus::parse(&status_raw).ok_or_else(|| bad_enum("status", &status_raw))?,
        attempt_count: row.get("attempt_count")?,
        audit_trail: serde_json::from_str(&audit_raw).map_err(|e| bad_json("audit_trail", e))?,
        approved_at: row.get("approved_at")?,
        resolved_at: row.get("resolved_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

pub fn get_by_id(pool: &DbPool, id: &str) -> Result<HealingRecord, AppError> {
    let conn = pool.get()?;
    conn.query_row(
        "SELECT * FROM healing_records WHERE id = ?1",
        params![id],
        row_to_record,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => AppError::NotFound(format!("HealingRecord {id}")),
        other => AppError::Database(other),
    })
}

/// The open (non-terminal) record for a dedup key, if one exists. The partial
/// unique index guarantees at most one.
pub fn get_open_for(
    pool: &DbPool,
    agent_id: &str,
    issue_type: IssueType,
) -> Result<Option<HealingRecord>, AppError> {
    let conn = pool.get()?;
    conn.query_row(
        "SELECT * FROM healing_records
         WHERE agent_id = ?1 AND issue_type = ?2
           AND status NOT IN ('succeeded', 'escalated', 'rejected')",
        params![agent_id, issue_type.as_str()],
        row_to_record,
    )
    .map(Some)
    .or_else(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(AppError::Database(other)),
    })
}

/// All non-terminal sessions, optionally narrowed to one agent.
pub fn get_active(pool: &DbPool, agent_id: Option<&str>) -> Result<Vec<HealingRecord>, AppError> {
    let conn = pool.get()?;
    let mut sql = String::from(
        "SELECT * FROM healing_records
         WHERE status NOT IN ('succeeded', 'escalated', 'rejected')",
    );
    let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
    if let Some(aid) = agent_id {
        sql.push_str(" AND agent_id = ?1");
        param_values.push(Box::new(aid.to_string()));
    }
    sql.push_str(" ORDER BY updated_at DESC");

    let params_ref: Vec<&dyn rusqlite::types::ToSql> =
        param_values.iter().map(|p| p.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_ref.as_slice(), row_to_record)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn get_recent_for_agent(
    pool: &DbPool,
    agent_id: &str,
    limit: i64,
) -> Result<Vec<HealingRecord>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT * FROM healing_records WHERE agent_id = ?1
         ORDER BY updated_at DESC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![agent_id, limit], row_to_record)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn insert(pool: &DbPool, record: &HealingRecord) -> Result<(), AppError> {
    let diagnosis = serde_json::to_string(&record.diagnosis)?;
    let actions = serde_json::to_string(&record.actions)?;
    let audit = serde_json::to_string(&record.audit_trail)?;
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO healing_records
         (id, agent_id, issue_type, severity, diagnosis, actions, current_action,
          status, attempt_count, audit_trail, approved_at, resolved_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            record.id,
            record.agent_id,
            record.issue_type.as_str(),
            record.severity.as_str(),
            diagnosis,
            actions,
            record.current_action,
            record.status.as_str(),
            record.attempt_count,
            audit,
            record.approved_at,
            record.resolved_at,
            record.created_at,
            record.updated_at,
        ],
    )
    .map_err(|e| match e {
        // The partial unique index rejects a second open record per
        // (agent, issue type); surface that as a conflict the executor
        // resolves by merging.
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            AppError::ConcurrencyConflict(format!(
                "open healing record already exists for ({}, {})",
                record.agent_id,
                record.issue_type.as_str()
            ))
        }
        other => AppError::Database(other),
    })?;
    Ok(())
}

/// Full-row update; the executor owns every mutable field.
pub fn update(pool: &DbPool, record: &HealingRecord) -> Result<(), AppError> {
    let diagnosis = serde_json::to_string(&record.diagnosis)?;
    let actions = serde_json::to_string(&record.actions)?;
    let audit = serde_json::to_string(&record.audit_trail)?;
    let conn = pool.get()?;
    let changed = conn.execute(
        "UPDATE healing_records SET
           severity = ?2, diagnosis = ?3, actions = ?4, current_action = ?5,
           status = ?6, attempt_count = ?7, audit_trail = ?8, approved_at = ?9,
           resolved_at = ?10, updated_at = ?11
         WHERE id = ?1",
        params![
            record.id,
            record.severity.as_str(),
            diagnosis,
            actions,
            record.current_action,
            record.status.as_str(),
            record.attempt_count,
            audit,
            record.approved_at,
            record.resolved_at,
            record.updated_at,
        ],
    )?;
    if changed == 0 {
        return Err(AppError::NotFound(format!("HealingRecord {}", record.id)));
    }
    Ok(())
}

// ============================================================================
// Outcome stats
// ============================================================================

/// Fold one action outcome into the per-(issue, action) counters.
pub fn record_outcome(
    pool: &DbPool,
    issue_type: IssueType,
    action_type: ActionType,
    success: bool,
) -> Result<(), AppError> {
    let now = chrono::Utc::now().to_rfc3339();
    let (s, f) = if success { (1, 0) } else { (0, 1) };
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO healing_stats (issue_type, action_type, success_count, failure_count, last_outcome_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(issue_type, action_type) DO UPDATE SET
           success_count = success_count + ?3,
           failure_count = failure_count + ?4,
           last_outcome_at = ?5",
        params![issue_type.as_str(), action_type.as_str(), s, f, now],
    )?;
    Ok(())
}

pub fn get_stats_for_issue(pool: &DbPool, issue_type: IssueType) -> Result<Vec<HealingStat>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT * FROM healing_stats WHERE issue_type = ?1",
    )?;
    let rows = stmt.query_map(params![issue_type.as_str()], |row| {
        let issue_raw: String = row.get("issue_type")?;
        let action_raw: String = row.get("action_type")?;
        Ok(HealingStat {
            issue_type: IssueType::parse(&issue_raw)
                .ok_or_else(|| bad_enum("issue_type", &issue_raw))?,
            action_type: ActionType::parse(&action_raw)
                .ok_or_else(|| bad_enum("action_type", &action_raw))?,
            success_count: row.get("success_count")?,
            failure_count: row.get("failure_count")?,
            last_outcome_at: row.get("last_outcome_at")?,
        })
    })?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;
    use crate::db::models::{AuditEntry, AuditOutcome, DiagnosisResult, HealingAction};
    use crate::db::repos::agents;

    fn make_record(agent_id: &str, issue_type: IssueType, status: HealingStatus) -> HealingRecord {
        let now = chrono::Utc::now().to_rfc3339();
        HealingRecord {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            issue_type,
            severity: IssueSeverity::High,
            diagnosis: DiagnosisResult {
                agent_id: agent_id.to_string(),
                issue_type,
                severity: IssueSeverity::High,
                summary: "5 timeouts in 10 minutes".into(),
                recommended_actions: vec![HealingAction::new(
                    ActionType::RefreshConnection,
                    serde_json::json!({"target": "all"}),
                )],
                confidence: 0.8,
                evidence: vec!["request timeout after 30000ms".into()],
            },
            actions: vec![
                HealingAction::new(ActionType::RefreshConnection, serde_json::json!({"target": "all"})),
                HealingAction::new(ActionType::Retry, serde_json::json!({"max_retries": 3})),
            ],
            current_action: 0,
            status,
            attempt_count: 1,
            audit_trail: vec![AuditEntry {
                action: None,
                outcome: AuditOutcome::Started,
                detail: Some("session opened".into()),
                timestamp: now.clone(),
            }],
            approved_at: None,
            resolved_at: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    #[test]
    fn test_record_crud_and_open_lookup() {
        let pool = init_test_db().unwrap();
        agents::upsert(&pool, "agent-1", "Support Bot").unwrap();

        let rec = make_record("agent-1", IssueType::Connectivity, HealingStatus::Executing);
        insert(&pool, &rec).unwrap();

        let fetched = get_by_id(&pool, &rec.id).unwrap();
        assert_eq!(fetched.issue_type, IssueType::Connectivity);
        assert_eq!(fetched.actions.len(), 2);
        assert_eq!(fetched.actions[0].action_type, ActionType::RefreshConnection);
        assert_eq!(fetched.audit_trail.len(), 1);

        let open = get_open_for(&pool, "agent-1", IssueType::Connectivity)
            .unwrap()
            .unwrap();
        assert_eq!(open.id, rec.id);
        assert!(get_open_for(&pool, "agent-1", IssueType::RateLimit)
            .unwrap()
            .is_none());

        // Second open record for the same pair maps to ConcurrencyConflict.
        let dup = make_record("agent-1", IssueType::Connectivity, HealingStatus::Diagnosed);
        match insert(&pool, &dup) {
            Err(AppError::ConcurrencyConflict(_)) => {}
            other => panic!("expected ConcurrencyConflict, got {other:?}"),
        }

        // Closing the first frees the dedup key.
        let mut closed = fetched.clone();
        closed.status = HealingStatus::Succeeded;
        closed.resolved_at = Some(chrono::Utc::now().to_rfc3339());
        closed.updated_at = chrono::Utc::now().to_rfc3339();
        update(&pool, &closed).unwrap();
        assert!(get_open_for(&pool, "agent-1", IssueType::Connectivity)
            .unwrap()
            .is_none());
        insert(&pool, &dup).unwrap();

        let active = get_active(&pool, Some("agent-1")).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, dup.id);
        assert_eq!(get_recent_for_agent(&pool, "agent-1", 10).unwrap().len(), 2);
    }

    #[test]
    fn test_outcome_stats_upsert() {
        let pool = init_test_db().unwrap();

        record_outcome(&pool, IssueType::Connectivity, ActionType::Retry, true).unwrap();
        record_outcome(&pool, IssueType::Connectivity, ActionType::Retry, true).unwrap();
        record_outcome(&pool, IssueType::Connectivity, ActionType::Retry, false).unwrap();
        record_outcome(&pool, IssueType::Connectivity, ActionType::RefreshConnection, true).unwrap();

        let stats = get_stats_for_issue(&pool, IssueType::Connectivity).unwrap();
        assert_eq!(stats.len(), 2);
        let retry = stats
            .iter()
            .find(|s| s.action_type == ActionType::Retry)
            .unwrap();
        assert_eq!(retry.success_count, 2);
        assert_eq!(retry.failure_count, 1);
        assert_eq!(retry.success_rate(), Some(2.0 / 3.0));

        assert!(get_stats_for_issue(&pool, IssueType::RateLimit).unwrap().is_empty());
    }
}
