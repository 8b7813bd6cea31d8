use rusqlite::Connection;

use crate::error::AppError;

/// Run the consolidated schema migration. Idempotent: every statement is
/// CREATE IF NOT EXISTS, so it is safe on both fresh and existing databases.
pub fn run(conn: &Connection) -> Result<(), AppError> {
    tracing::debug!("Running database migrations");

    conn.execute_batch(SCHEMA)?;

    tracing::info!("Database migrations complete");
    Ok(())
}

const SCHEMA: &str = r#"

-- ============================================================================
-- Agents (fleet roster mirror; must precede everything due to FKs)
-- ============================================================================

CREATE TABLE IF NOT EXISTS agents (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    enabled     INTEGER NOT NULL DEFAULT 1,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_agents_enabled ON agents(enabled);

-- ============================================================================
-- Agent Stats (rolling counters snapshotted at the start of each heartbeat)
-- ============================================================================

CREATE TABLE IF NOT EXISTS agent_stats (
    agent_id            TEXT PRIMARY KEY REFERENCES agents(id) ON DELETE CASCADE,
    total_interactions  INTEGER NOT NULL DEFAULT 0,
    total_tasks         INTEGER NOT NULL DEFAULT 0,
    failed_tasks        INTEGER NOT NULL DEFAULT 0,
    total_workflows     INTEGER NOT NULL DEFAULT 0,
    failed_workflows    INTEGER NOT NULL DEFAULT 0,
    success_rate        REAL NOT NULL DEFAULT 1.0,
    last_interaction_at TEXT,
    updated_at          TEXT NOT NULL
);

-- ============================================================================
-- Patterns
-- ============================================================================

CREATE TABLE IF NOT EXISTS proactive_patterns (
    id                TEXT PRIMARY KEY,
    agent_id          TEXT NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
    pattern_type      TEXT NOT NULL CHECK(pattern_type IN (
                        'recurring_task', 'time_preference', 'user_behavior',
                        'error_pattern', 'relationship_milestone', 'skill_gap')),
    group_key         TEXT NOT NULL,
    condition_rules   TEXT NOT NULL,
    confidence        REAL NOT NULL CHECK(confidence >= 0.0 AND confidence <= 1.0),
    observation_count INTEGER NOT NULL DEFAULT 1,
    active            INTEGER NOT NULL DEFAULT 1,
    last_observed_at  TEXT NOT NULL,
    last_triggered_at TEXT,
    expires_at        TEXT NOT NULL,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL,
    UNIQUE(agent_id, pattern_type, group_key)
);
CREATE INDEX IF NOT EXISTS idx_pp_agent    ON proactive_patterns(agent_id);
CREATE INDEX IF NOT EXISTS idx_pp_active   ON proactive_patterns(active, confidence);
CREATE INDEX IF NOT EXISTS idx_pp_expires  ON proactive_patterns(expires_at);

-- ============================================================================
-- Pattern Observations (append-only; powers incremental counts + reconciliation)
-- ============================================================================

CREATE TABLE IF NOT EXISTS pattern_observations (
    id           TEXT PRIMARY KEY,
    agent_id     TEXT NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
    pattern_type TEXT NOT NULL,
    group_key    TEXT NOT NULL,
    payload      TEXT,
    observed_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_po_lookup ON pattern_observations(agent_id, pattern_type, group_key, observed_at);
CREATE INDEX IF NOT EXISTS idx_po_age    ON pattern_observations(observed_at);

-- ============================================================================
-- Suggestions
-- ============================================================================

CREATE TABLE IF NOT EXISTS proactive_suggestions (
    id                TEXT PRIMARY KEY,
    agent_id          TEXT NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
    source_pattern_id TEXT REFERENCES proactive_patterns(id) ON DELETE SET NULL,
    suggestion_type   TEXT NOT NULL CHECK(suggestion_type IN (
                        'automate_recurring_task', 'schedule_optimization',
                        'behavior_insight', 'error_alert', 'relationship_nudge',
                        'skill_suggestion', 'reverse_prompt')),
    priority          TEXT NOT NULL CHECK(priority IN ('low', 'medium', 'high', 'urgent')),
    title             TEXT NOT NULL,
    body              TEXT NOT NULL,
    action_type       TEXT NOT NULL,
    action_params     TEXT NOT NULL DEFAULT '{}',
    confidence        REAL NOT NULL,
    status            TEXT NOT NULL DEFAULT 'pending'
                      CHECK(status IN ('pending', 'accepted', 'dismissed', 'expired')),
    created_at        TEXT NOT NULL,
    expires_at        TEXT NOT NULL,
    resolved_at       TEXT
);
CREATE INDEX IF NOT EXISTS idx_ps_agent_status ON proactive_suggestions(agent_id, status);
CREATE INDEX IF NOT EXISTS idx_ps_source       ON proactive_suggestions(source_pattern_id, created_at);
CREATE INDEX IF NOT EXISTS idx_ps_expires      ON proactive_suggestions(status, expires_at);

-- ============================================================================
-- Healing Records
-- ============================================================================

CREATE TABLE IF NOT EXISTS healing_records (
    id             TEXT PRIMARY KEY,
    agent_id       TEXT NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
    issue_type     TEXT NOT NULL CHECK(issue_type IN (
                     'connectivity', 'rate_limit', 'state_corruption',
                     'capability_gap', 'unknown')),
    severity       TEXT NOT NULL CHECK(severity IN ('low', 'medium', 'high', 'critical')),
    diagnosis      TEXT NOT NULL,
    actions        TEXT NOT NULL,
    current_action INTEGER NOT NULL DEFAULT 0,
    status         TEXT NOT NULL DEFAULT 'diagnosed'
                   CHECK(status IN ('diagnosed', 'awaiting_approval', 'auto_approved',
                                    'executing', 'succeeded', 'failed', 'escalated', 'rejected')),
    attempt_count  INTEGER NOT NULL DEFAULT 1,
    audit_trail    TEXT NOT NULL DEFAULT '[]',
    approved_at    TEXT,
    resolved_at    TEXT,
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_hr_agent_status ON healing_records(agent_id, status);
-- At most one non-terminal record per (agent, issue type).
CREATE UNIQUE INDEX IF NOT EXISTS idx_hr_open_unique
    ON healing_records(agent_id, issue_type)
    WHERE status NOT IN ('succeeded', 'escalated', 'rejected');

-- ============================================================================
-- Heartbeat Logs (append-only, one row per orchestrator run per agent)
-- ============================================================================

CREATE TABLE IF NOT EXISTS heartbeat_logs (
    id             TEXT PRIMARY KEY,
    agent_id       TEXT NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
    heartbeat_type TEXT NOT NULL CHECK(heartbeat_type IN ('scheduled', 'event', 'realtime')),
    result         TEXT NOT NULL CHECK(result IN ('ok', 'degraded', 'error')),
    sub_results    TEXT NOT NULL DEFAULT '[]',
    duration_ms    INTEGER,
    triggered_at   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_hl_agent_time ON heartbeat_logs(agent_id, triggered_at DESC);
CREATE INDEX IF NOT EXISTS idx_hl_age        ON heartbeat_logs(triggered_at);

-- ============================================================================
-- Healing Stats (historical outcome counts per issue/action pair)
-- ============================================================================

CREATE TABLE IF NOT EXISTS healing_stats (
    issue_type      TEXT NOT NULL,
    action_type     TEXT NOT NULL,
    success_count   INTEGER NOT NULL DEFAULT 0,
    failure_count   INTEGER NOT NULL DEFAULT 0,
    last_outcome_at TEXT NOT NULL,
    PRIMARY KEY (issue_type, action_type)
);

"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        // Running twice must not error.
        run(&conn).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN (
                 'agents', 'agent_stats', 'proactive_patterns', 'pattern_observations',
                 'proactive_suggestions', 'healing_records', 'heartbeat_logs', 'healing_stats')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 8);
    }

    #[test]
    fn test_open_healing_record_uniqueness() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        run(&conn).unwrap();

        conn.execute(
            "INSERT INTO agents (id, name, enabled, created_at, updated_at)
             VALUES ('a1', 'Agent One', 1, '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();

        let insert = "INSERT INTO healing_records
             (id, agent_id, issue_type, severity, diagnosis, actions, status, created_at, updated_at)
             VALUES (?1, 'a1', 'connectivity', 'high', '{}', '[]', ?2,
                     '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')";

        conn.execute(insert, rusqlite::params!["h1", "executing"])
            .unwrap();
        // Second open record for the same (agent, issue) pair must be refused.
        let dup = conn.execute(insert, rusqlite::params!["h2", "diagnosed"]);
        assert!(dup.is_err());
        // A terminal record for the pair is fine.
        conn.execute(insert, rusqlite::params!["h3", "succeeded"])
            .unwrap();
    }
}
