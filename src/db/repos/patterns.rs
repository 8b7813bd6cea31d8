use rusqlite::{params, Row};

use crate::db::models::{Pattern, PatternType};
use crate::db::repos::{bad_enum, bad_json};
use crate::db::DbPool;
use crate::error::AppError;

fn row_to_pattern(row: &Row) -> rusqlite::Result<Pattern> {
    let type_raw: String = row.get("pattern_type")?;
    let rules_raw: String = row.get("condition_rules")?;
    Ok(Pattern {
        id: row.get("id")?,
        agent_id: row.get("agent_id")?,
        pattern_type: PatternType::parse(&type_raw)
            .ok_or_else(|| bad_enum("pattern_type", &type_raw))?,
        group_key: row.get("group_key")?,
        condition_rules: serde_json::from_str(&rules_raw)
            .map_err(|e| bad_json("condition_rules", e))?,
        confidence: row.get("confidence")?,
        observation_count: row.get("observation_count")?,
        active: row.get("active")?,
        last_observed_at: row.get("last_observed_at")?,
        last_triggered_at: row.get("last_triggered_at")?,
        expires_at: row.get("expires_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

pub fn get_by_id(pool: &DbPool, id: &str) -> Result<Pattern, AppError> {
    let conn = pool.get()?;
    conn.query_row(
        "SELECT * FROM proactive_patterns WHERE id = ?1",
        params![id],
        row_to_pattern,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => AppError::NotFound(format!("Pattern {id}")),
        other => AppError::Database(other),
    })
}

/// Lookup by the detection identity (agent, type, group key), open or archived.
pub fn get_by_group(
    pool: &DbPool,
    agent_id: &str,
    pattern_type: PatternType,
    group_key: &str,
) -> Result<Option<Pattern>, AppError> {
    let conn = pool.get()?;
    conn.query_row(
        "SELECT * FROM proactive_patterns
         WHERE agent_id = ?1 AND pattern_type = ?2 AND group_key = ?3",
        params![agent_id, pattern_type.as_str(), group_key],
        row_to_pattern,
    )
    .map(Some)
    .or_else(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(AppError::Database(other)),
    })
}

/// Patterns visible to the trigger evaluator: active, unexpired, confidence
/// at or above the floor. Ordered by confidence so the strongest match wins
/// cap contention downstream.
pub fn get_active(
    pool: &DbPool,
    agent_id: &str,
    min_confidence: f64,
    now: &str,
) -> Result<Vec<Pattern>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT * FROM proactive_patterns
         WHERE agent_id = ?1 AND active = 1 AND confidence >= ?2 AND expires_at > ?3
         ORDER BY confidence DESC, created_at ASC",
    )?;
    let rows = stmt.query_map(params![agent_id, min_confidence, now], row_to_pattern)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn get_all_for_agent(pool: &DbPool, agent_id: &str) -> Result<Vec<Pattern>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT * FROM proactive_patterns WHERE agent_id = ?1 ORDER BY confidence DESC",
    )?;
    let rows = stmt.query_map(params![agent_id], row_to_pattern)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn insert(pool: &DbPool, pattern: &Pattern) -> Result<(), AppError> {
    let rules = serde_json::to_string(&pattern.condition_rules)?;
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO proactive_patterns
         (id, agent_id, pattern_type, group_key, condition_rules, confidence,
          observation_count, active, last_observed_at, last_triggered_at,
          expires_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            pattern.id,
            pattern.agent_id,
            pattern.pattern_type.as_str(),
            pattern.group_key,
            rules,
            pattern.confidence,
            pattern.observation_count,
            pattern.active,
            pattern.last_observed_at,
            pattern.last_triggered_at,
            pattern.expires_at,
            pattern.created_at,
            pattern.updated_at,
        ],
    )?;
    Ok(())
}

/// Full-row update; the engine owns every mutable field.
pub fn update(pool: &DbPool, pattern: &Pattern) -> Result<(), AppError> {
    let rules = serde_json::to_string(&pattern.condition_rules)?;
    let conn = pool.get()?;
    let changed = conn.execute(
        "UPDATE proactive_patterns SET
           condition_rules = ?2, confidence = ?3, observation_count = ?4,
           active = ?5, last_observed_at = ?6, last_triggered_at = ?7,
           expires_at = ?8, updated_at = ?9
         WHERE id = ?1",
        params![
            pattern.id,
            rules,
            pattern.confidence,
            pattern.observation_count,
            pattern.active,
            pattern.last_observed_at,
            pattern.last_triggered_at,
            pattern.expires_at,
            pattern.updated_at,
        ],
    )?;
    if changed == 0 {
        return Err(AppError::NotFound(format!("Pattern {}", pattern.id)));
    }
    Ok(())
}

/// Archive patterns whose reinforcement window has lapsed. Returns the ids
/// that flipped so the projection can mirror them.
pub fn archive_expired(pool: &DbPool, agent_id: &str, now: &str) -> Result<Vec<String>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT id FROM proactive_patterns
         WHERE agent_id = ?1 AND active = 1 AND expires_at <= ?2",
    )?;
    let ids: Vec<String> = stmt
        .query_map(params![agent_id, now], |row| row.get(0))?
        .filter_map(|r| r.ok())
        .collect();
    if !ids.is_empty() {
        conn.execute(
            "UPDATE proactive_patterns SET active = 0, updated_at = ?2
             WHERE agent_id = ?1 AND active = 1 AND expires_at <= ?2",
            params![agent_id, now],
        )?;
    }
    Ok(ids)
}

// ============================================================================
// Observations
// ============================================================================

pub fn add_observation(
    pool: &DbPool,
    agent_id: &str,
    pattern_type: PatternType,
    group_key: &str,
    payload: Option<&str>,
    observed_at: &str,
) -> Result<(), AppError> {
    let id = uuid::Uuid::new_v4().to_string();
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO pattern_observations (id, agent_id, pattern_type, group_key, payload, observed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![id, agent_id, pattern_type.as_str(), group_key, payload, observed_at],
    )?;
    Ok(())
}

pub fn count_observations(
    pool: &DbPool,
    agent_id: &str,
    pattern_type: PatternType,
    group_key: &str,
    since: &str,
) -> Result<i64, AppError> {
    let conn = pool.get()?;
    let count = conn.query_row(
        "SELECT COUNT(*) FROM pattern_observations
         WHERE agent_id = ?1 AND pattern_type = ?2 AND group_key = ?3 AND observed_at >= ?4",
        params![agent_id, pattern_type.as_str(), group_key, since],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Distinct (group_key, count, last_observed_at) triples within the window,
/// used by the reconciliation pass.
pub fn group_counts(
    pool: &DbPool,
    agent_id: &str,
    pattern_type: PatternType,
    since: &str,
) -> Result<Vec<(String, i64, String)>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT group_key, COUNT(*) as n, MAX(observed_at) as last_seen
         FROM pattern_observations
         WHERE agent_id = ?1 AND pattern_type = ?2 AND observed_at >= ?3
         GROUP BY group_key ORDER BY n DESC",
    )?;
    let rows = stmt.query_map(params![agent_id, pattern_type.as_str(), since], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
    })?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn prune_observations(pool: &DbPool, cutoff: &str) -> Result<usize, AppError> {
    let conn = pool.get()?;
    let n = conn.execute(
        "DELETE FROM pattern_observations WHERE observed_at < ?1",
        params![cutoff],
    )?;
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;
    use crate::db::models::{ConditionOp, ConditionRules, StatsMetric, TriggerEventType, TriggerRule};
    use crate::db::repos::agents;

    fn make_pattern(agent_id: &str, group_key: &str, confidence: f64) -> Pattern {
        let now = chrono::Utc::now();
        Pattern {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            pattern_type: PatternType::RecurringTask,
            group_key: group_key.to_string(),
            condition_rules: ConditionRules {
                trigger: TriggerRule::Event {
                    event_type: TriggerEventType::TaskComplete,
                },
                conditions: vec![],
                cooldown_minutes: 60,
            },
            confidence,
            observation_count: 3,
            active: true,
            last_observed_at: now.to_rfc3339(),
            last_triggered_at: None,
            expires_at: (now + chrono::Duration::days(30)).to_rfc3339(),
            created_at: now.to_rfc3339(),
            updated_at: now.to_rfc3339(),
        }
    }

    #[test]
    fn test_pattern_crud_and_active_filter() {
        let pool = init_test_db().unwrap();
        agents::upsert(&pool, "agent-1", "Support Bot").unwrap();

        let strong = make_pattern("agent-1", "send_report::mon", 0.8);
        let weak = make_pattern("agent-1", "check_inbox::tue", 0.2);
        insert(&pool, &strong).unwrap();
        insert(&pool, &weak).unwrap();

        let fetched = get_by_id(&pool, &strong.id).unwrap();
        assert_eq!(fetched.group_key, "send_report::mon");
        assert_eq!(fetched.pattern_type, PatternType::RecurringTask);
        assert_eq!(fetched.condition_rules.cooldown_minutes, 60);

        let now = chrono::Utc::now().to_rfc3339();
        let active = get_active(&pool, "agent-1", 0.4, &now).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, strong.id);

        let by_group =
            get_by_group(&pool, "agent-1", PatternType::RecurringTask, "send_report::mon")
                .unwrap()
                .unwrap();
        assert_eq!(by_group.id, strong.id);
        assert!(
            get_by_group(&pool, "agent-1", PatternType::TimePreference, "send_report::mon")
                .unwrap()
                .is_none()
        );

        let mut updated = fetched.clone();
        updated.confidence = 0.9;
        updated.condition_rules.trigger = TriggerRule::Threshold {
            metric: StatsMetric::SuccessRate,
            op: ConditionOp::Lt,
            value: 0.5,
        };
        update(&pool, &updated).unwrap();
        let back = get_by_id(&pool, &strong.id).unwrap();
        assert_eq!(back.confidence, 0.9);
        assert!(matches!(
            back.condition_rules.trigger,
            TriggerRule::Threshold { .. }
        ));
    }

    #[test]
    fn test_archive_expired() {
        let pool = init_test_db().unwrap();
        agents::upsert(&pool, "agent-1", "Support Bot").unwrap();

        let mut stale = make_pattern("agent-1", "old_habit::fri", 0.6);
        stale.expires_at = (chrono::Utc::now() - chrono::Duration::days(1)).to_rfc3339();
        insert(&pool, &stale).unwrap();
        insert(&pool, &make_pattern("agent-1", "fresh::sat", 0.6)).unwrap();

        let now = chrono::Utc::now().to_rfc3339();
        let archived = archive_expired(&pool, "agent-1", &now).unwrap();
        assert_eq!(archived, vec![stale.id.clone()]);
        assert!(!get_by_id(&pool, &stale.id).unwrap().active);

        // Second sweep is a no-op.
        assert!(archive_expired(&pool, "agent-1", &now).unwrap().is_empty());
    }

    #[test]
    fn test_observation_counts() {
        let pool = init_test_db().unwrap();
        agents::upsert(&pool, "agent-1", "Support Bot").unwrap();

        let base = chrono::Utc::now() - chrono::Duration::days(2);
        for i in 0..4 {
            add_observation(
                &pool,
                "agent-1",
                PatternType::RecurringTask,
                "send_report::mon",
                None,
                &(base + chrono::Duration::hours(i)).to_rfc3339(),
            )
            .unwrap();
        }
        add_observation(
            &pool,
            "agent-1",
            PatternType::RecurringTask,
            "check_inbox::tue",
            None,
            &base.to_rfc3339(),
        )
        .unwrap();

        let since = (chrono::Utc::now() - chrono::Duration::days(7)).to_rfc3339();
        assert_eq!(
            count_observations(&pool, "agent-1", PatternType::RecurringTask, "send_report::mon", &since)
                .unwrap(),
            4
        );

        let groups = group_counts(&pool, "agent-1", PatternType::RecurringTask, &since).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, "send_report::mon");
        assert_eq!(groups[0].1, 4);

        // Pruning with a future cutoff clears everything.
        let future = (chrono::Utc::now() + chrono::Duration::days(1)).to_rfc3339();
        assert_eq!(prune_observations(&pool, &future).unwrap(), 5);
    }
}
