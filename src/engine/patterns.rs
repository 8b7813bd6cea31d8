//! Pattern store & analyzer: turns lifecycle events into per-agent behavioral
//! patterns with exponentially-smoothed confidence.
//!
//! Incremental hooks (`observe_*`, `on_memory_saved`, `on_learning_created`)
//! fold one event into the store without a rescan. `analyze_patterns` is the
//! periodic reconciliation: daily confidence decay, promotion sweep from raw
//! observation counts, and expiry archiving.
//!
//! Payload contracts (all fields optional unless noted):
//! - task_complete / workflow_complete: `task_title` or `workflow_name`,
//!   `success`, `error`, `question` (an unresolved question the task raised).
//! - memory_saved: `kind` ("preference", "fact", ...), `topic`.
//! - learning_created: `capability` (marks a skill gap), `kind`.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use crate::db::models::{
    AgentStats, Condition, ConditionRules, Pattern, PatternType, TriggerEventType, TriggerRule,
};
use crate::db::repos::patterns as pattern_repo;
use crate::db::DbPool;
use crate::engine::cron::CronSchedule;
use crate::error::AppError;

/// Weight of one new observation in the confidence EMA.
pub const EMA_ALPHA: f64 = 0.3;
/// Confidence a brand-new pattern starts at.
pub const INITIAL_CONFIDENCE: f64 = 0.5;
/// Patterns below this confidence are invisible to the trigger evaluator.
pub const ACTIVE_CONFIDENCE_THRESHOLD: f64 = 0.4;
/// Multiplier applied once per reinforcement-free day during reconciliation.
pub const DAILY_DECAY_FACTOR: f64 = 0.7;
/// A pattern with no reinforcement for this long is archived.
pub const PATTERN_EXPIRY_DAYS: i64 = 30;
/// Observation window for counts and the promotion sweep.
pub const OBSERVATION_WINDOW_DAYS: i64 = 30;

/// Interaction counts that mark a relationship milestone.
pub const INTERACTION_MILESTONES: [i64; 5] = [10, 50, 100, 500, 1000];

/// Minimum observations before a pattern type is promoted to active. Never 0:
/// promotion from a single event is only allowed for milestones, which are
/// facts rather than inferences.
pub fn min_occurrences(pattern_type: PatternType) -> i64 {
    match pattern_type {
        PatternType::RecurringTask => 3,
        PatternType::TimePreference => 5,
        PatternType::UserBehavior => 5,
        PatternType::ErrorPattern => 3,
        PatternType::RelationshipMilestone => 1,
        PatternType::SkillGap => 2,
    }
}

// ---------------------------------------------------------------------------
// Confidence arithmetic
// ---------------------------------------------------------------------------

/// One reinforcement: nudge confidence toward 1.
pub fn reinforce(confidence: f64) -> f64 {
    (confidence + EMA_ALPHA * (1.0 - confidence)).clamp(0.0, 1.0)
}

/// `steps` reinforcement-free days worth of decay toward 0.
pub fn decay(confidence: f64, steps: u32) -> f64 {
    (confidence * DAILY_DECAY_FACTOR.powi(steps as i32)).clamp(0.0, 1.0)
}

// ---------------------------------------------------------------------------
// Grouping keys
// ---------------------------------------------------------------------------

/// Normalize free text into a similarity key: lowercase, alphanumeric words
/// only, first six words joined with underscores.
pub fn normalize_key(raw: &str) -> String {
    let cleaned: String = raw
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    let words: Vec<&str> = cleaned.split_whitespace().take(6).collect();
    if words.is_empty() {
        "unspecified".to_string()
    } else {
        words.join("_")
    }
}

/// Weekday + hour bucket, e.g. "mon_09". Groups time-preference observations.
pub fn time_bucket(at: DateTime<Utc>) -> String {
    let day = match at.format("%a").to_string().to_lowercase().as_str() {
        d @ ("mon" | "tue" | "wed" | "thu" | "fri" | "sat" | "sun") => d.to_string(),
        other => other.to_string(),
    };
    format!("{day}_{:02}", chrono::Timelike::hour(&at))
}

fn default_rules(pattern_type: PatternType) -> ConditionRules {
    let (event_type, cooldown_minutes) = match pattern_type {
        PatternType::RecurringTask => (TriggerEventType::TaskComplete, 60),
        PatternType::TimePreference => (TriggerEventType::TaskComplete, 1440),
        PatternType::UserBehavior => (TriggerEventType::MemorySaved, 720),
        PatternType::ErrorPattern => (TriggerEventType::TaskComplete, 120),
        PatternType::RelationshipMilestone => (TriggerEventType::ConversationComplete, 10080),
        PatternType::SkillGap => (TriggerEventType::LearningCreated, 1440),
    };
    ConditionRules {
        trigger: TriggerRule::Event { event_type },
        conditions: Vec::<Condition>::new(),
        cooldown_minutes,
    }
}

// ---------------------------------------------------------------------------
// Incremental observation
// ---------------------------------------------------------------------------

/// Fold one observation into the store: append to the observation log, then
/// create or reinforce the matching pattern row. Promotion to active happens
/// here the moment the occurrence threshold is met.
pub fn observe(
    pool: &DbPool,
    agent_id: &str,
    pattern_type: PatternType,
    group_key: &str,
    payload: Option<&Value>,
    now: DateTime<Utc>,
) -> Result<Pattern, AppError> {
    let now_str = now.to_rfc3339();
    let payload_str = payload.map(|p| p.to_string());
    pattern_repo::add_observation(
        pool,
        agent_id,
        pattern_type,
        group_key,
        payload_str.as_deref(),
        &now_str,
    )?;

    match pattern_repo::get_by_group(pool, agent_id, pattern_type, group_key)? {
        Some(mut pattern) => {
            pattern.confidence = reinforce(pattern.confidence);
            pattern.observation_count += 1;
            pattern.last_observed_at = now_str.clone();
            pattern.expires_at = (now + Duration::days(PATTERN_EXPIRY_DAYS)).to_rfc3339();
            if !pattern.active && pattern.observation_count >= min_occurrences(pattern_type) {
                pattern.active = true;
                tracing::info!(
                    agent_id = %agent_id,
                    pattern_type = pattern_type.as_str(),
                    group_key = %group_key,
                    confidence = pattern.confidence,
                    "Pattern promoted to active"
                );
            }
            pattern.updated_at = now_str;
            pattern_repo::update(pool, &pattern)?;
            Ok(pattern)
        }
        None => {
            let pattern = Pattern {
                id: uuid::Uuid::new_v4().to_string(),
                agent_id: agent_id.to_string(),
                pattern_type,
                group_key: group_key.to_string(),
                condition_rules: default_rules(pattern_type),
                confidence: INITIAL_CONFIDENCE,
                observation_count: 1,
                active: min_occurrences(pattern_type) <= 1,
                last_observed_at: now_str.clone(),
                last_triggered_at: None,
                expires_at: (now + Duration::days(PATTERN_EXPIRY_DAYS)).to_rfc3339(),
                created_at: now_str.clone(),
                updated_at: now_str,
            };
            pattern_repo::insert(pool, &pattern)?;
            Ok(pattern)
        }
    }
}

/// Task completion feeds up to three pattern types: the recurring-task group
/// (keyed by the unresolved question when present, else the title), the
/// time-of-day bucket, and an error signature when the task failed.
pub fn observe_task_completion(
    pool: &DbPool,
    agent_id: &str,
    payload: &Value,
    now: DateTime<Utc>,
) -> Result<Vec<Pattern>, AppError> {
    let mut touched = Vec::new();

    let recurring_source = payload
        .get("question")
        .and_then(Value::as_str)
        .or_else(|| payload.get("task_title").and_then(Value::as_str));
    if let Some(source) = recurring_source {
        let key = normalize_key(source);
        touched.push(observe(
            pool,
            agent_id,
            PatternType::RecurringTask,
            &key,
            Some(payload),
            now,
        )?);
    }

    touched.push(observe(
        pool,
        agent_id,
        PatternType::TimePreference,
        &time_bucket(now),
        None,
        now,
    )?);

    if let Some(error) = payload.get("error").and_then(Value::as_str) {
        if !error.is_empty() {
            let sig: String = error.chars().take(48).collect();
            touched.push(observe(
                pool,
                agent_id,
                PatternType::ErrorPattern,
                &normalize_key(&sig),
                Some(payload),
                now,
            )?);
        }
    }

    Ok(touched)
}

pub fn observe_workflow_completion(
    pool: &DbPool,
    agent_id: &str,
    payload: &Value,
    now: DateTime<Utc>,
) -> Result<Vec<Pattern>, AppError> {
    let mut touched = Vec::new();

    if let Some(name) = payload.get("workflow_name").and_then(Value::as_str) {
        touched.push(observe(
            pool,
            agent_id,
            PatternType::RecurringTask,
            &normalize_key(name),
            Some(payload),
            now,
        )?);
    }

    if let Some(error) = payload.get("error").and_then(Value::as_str) {
        if !error.is_empty() {
            let sig: String = error.chars().take(48).collect();
            touched.push(observe(
                pool,
                agent_id,
                PatternType::ErrorPattern,
                &normalize_key(&sig),
                Some(payload),
                now,
            )?);
        }
    }

    Ok(touched)
}

/// Conversation completion only matters for relationship milestones: when the
/// rolling interaction total lands exactly on a milestone, record it. Counts
/// advance one at a time, so equality is the crossing test.
pub fn observe_conversation(
    pool: &DbPool,
    agent_id: &str,
    stats: &AgentStats,
    now: DateTime<Utc>,
) -> Result<Option<Pattern>, AppError> {
    for milestone in INTERACTION_MILESTONES {
        if stats.total_interactions == milestone {
            let key = format!("interactions_{milestone}");
            return observe(
                pool,
                agent_id,
                PatternType::RelationshipMilestone,
                &key,
                None,
                now,
            )
            .map(Some);
        }
    }
    Ok(None)
}

pub fn on_memory_saved(
    pool: &DbPool,
    agent_id: &str,
    payload: &Value,
    now: DateTime<Utc>,
) -> Result<Pattern, AppError> {
    let kind = payload
        .get("kind")
        .and_then(Value::as_str)
        .unwrap_or("general");
    let key = format!("memory_{}", normalize_key(kind));
    observe(pool, agent_id, PatternType::UserBehavior, &key, Some(payload), now)
}

/// A learning that names a missing capability becomes a skill-gap pattern;
/// anything else counts as plain behavior.
pub fn on_learning_created(
    pool: &DbPool,
    agent_id: &str,
    payload: &Value,
    now: DateTime<Utc>,
) -> Result<Pattern, AppError> {
    if let Some(capability) = payload.get("capability").and_then(Value::as_str) {
        let key = format!("skill_{}", normalize_key(capability));
        return observe(pool, agent_id, PatternType::SkillGap, &key, Some(payload), now);
    }
    let kind = payload
        .get("kind")
        .and_then(Value::as_str)
        .unwrap_or("general");
    let key = format!("learning_{}", normalize_key(kind));
    observe(pool, agent_id, PatternType::UserBehavior, &key, Some(payload), now)
}

/// Explicit automation created from an accepted suggestion: active from the
/// start, fired by its cron schedule rather than by live events.
pub fn create_scheduled_pattern(
    pool: &DbPool,
    agent_id: &str,
    title: &str,
    cron: &str,
    now: DateTime<Utc>,
) -> Result<Pattern, AppError> {
    CronSchedule::parse(cron)?;

    let key = format!("scheduled_{}", normalize_key(title));
    if let Some(existing) = pattern_repo::get_by_group(pool, agent_id, PatternType::RecurringTask, &key)? {
        return Err(AppError::validation(format!(
            "automation '{}' already exists for this agent",
            existing.group_key
        )));
    }

    let now_str = now.to_rfc3339();
    let pattern = Pattern {
        id: uuid::Uuid::new_v4().to_string(),
        agent_id: agent_id.to_string(),
        pattern_type: PatternType::RecurringTask,
        group_key: key,
        condition_rules: ConditionRules {
            trigger: TriggerRule::Schedule { cron: cron.to_string() },
            conditions: Vec::new(),
            cooldown_minutes: 60,
        },
        confidence: 0.9,
        observation_count: min_occurrences(PatternType::RecurringTask),
        active: true,
        last_observed_at: now_str.clone(),
        last_triggered_at: None,
        expires_at: (now + Duration::days(PATTERN_EXPIRY_DAYS)).to_rfc3339(),
        created_at: now_str.clone(),
        updated_at: now_str,
    };
    pattern_repo::insert(pool, &pattern)?;
    Ok(pattern)
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

#[derive(Debug, Default, PartialEq, Eq)]
pub struct AnalysisSummary {
    pub examined: usize,
    pub decayed: usize,
    pub promoted: usize,
    pub archived: usize,
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Full reconciliation pass for one agent.
///
/// Decay applies at most once per reinforcement-free UTC day per pattern:
/// `updated_at` doubles as the last-touch marker, so downtime longer than a
/// day catches up with compounded steps, while repeated same-day runs are
/// no-ops.
pub fn analyze_patterns(
    pool: &DbPool,
    agent_id: &str,
    now: DateTime<Utc>,
) -> Result<AnalysisSummary, AppError> {
    let mut summary = AnalysisSummary::default();
    let today = now.date_naive();
    let now_str = now.to_rfc3339();

    let patterns = pattern_repo::get_all_for_agent(pool, agent_id)?;
    summary.examined = patterns.len();

    for mut pattern in patterns {
        if !pattern.active {
            continue;
        }
        let observed_today = parse_ts(&pattern.last_observed_at)
            .map(|d| d.date_naive() == today)
            .unwrap_or(false);
        if observed_today {
            continue;
        }
        let steps = parse_ts(&pattern.updated_at)
            .map(|d| (today - d.date_naive()).num_days().max(0) as u32)
            .unwrap_or(0);
        if steps == 0 {
            continue;
        }
        pattern.confidence = decay(pattern.confidence, steps);
        pattern.updated_at = now_str.clone();
        pattern_repo::update(pool, &pattern)?;
        summary.decayed += 1;
    }

    // Promotion sweep: raw observation counts are the source of truth when
    // the incremental path and the pattern row disagree.
    let since = (now - Duration::days(OBSERVATION_WINDOW_DAYS)).to_rfc3339();
    for pattern_type in PatternType::ALL {
        for (group_key, count, last_seen) in
            pattern_repo::group_counts(pool, agent_id, pattern_type, &since)?
        {
            if count < min_occurrences(pattern_type) {
                continue;
            }
            match pattern_repo::get_by_group(pool, agent_id, pattern_type, &group_key)? {
                Some(mut pattern) => {
                    let expired = pattern.expires_at.as_str() <= now_str.as_str();
                    if !pattern.active && !expired {
                        pattern.active = true;
                        pattern.observation_count = pattern.observation_count.max(count);
                        pattern.updated_at = now_str.clone();
                        pattern_repo::update(pool, &pattern)?;
                        summary.promoted += 1;
                    }
                }
                None => {
                    let pattern = Pattern {
                        id: uuid::Uuid::new_v4().to_string(),
                        agent_id: agent_id.to_string(),
                        pattern_type,
                        group_key: group_key.clone(),
                        condition_rules: default_rules(pattern_type),
                        confidence: INITIAL_CONFIDENCE,
                        observation_count: count,
                        active: true,
                        last_observed_at: last_seen,
                        last_triggered_at: None,
                        expires_at: (now + Duration::days(PATTERN_EXPIRY_DAYS)).to_rfc3339(),
                        created_at: now_str.clone(),
                        updated_at: now_str.clone(),
                    };
                    pattern_repo::insert(pool, &pattern)?;
                    summary.promoted += 1;
                }
            }
        }
    }

    summary.archived = pattern_repo::archive_expired(pool, agent_id, &now_str)?.len();

    if summary.decayed + summary.promoted + summary.archived > 0 {
        tracing::debug!(
            agent_id = %agent_id,
            examined = summary.examined,
            decayed = summary.decayed,
            promoted = summary.promoted,
            archived = summary.archived,
            "Pattern reconciliation finished"
        );
    }
    Ok(summary)
}

/// Patterns the trigger evaluator should see right now.
pub fn get_active_patterns(
    pool: &DbPool,
    agent_id: &str,
    now: DateTime<Utc>,
) -> Result<Vec<Pattern>, AppError> {
    pattern_repo::get_active(pool, agent_id, ACTIVE_CONFIDENCE_THRESHOLD, &now.to_rfc3339())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;
    use crate::db::repos::agents;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use serde_json::json;

    // --- confidence arithmetic ---

    #[test]
    fn test_reinforce_sequence_crosses_promotion_bar() {
        // 0.5 -> 0.65 -> 0.755: the third observation crosses 0.7.
        let c1 = INITIAL_CONFIDENCE;
        let c2 = reinforce(c1);
        let c3 = reinforce(c2);
        assert!((c2 - 0.65).abs() < 1e-9);
        assert!((c3 - 0.755).abs() < 1e-9);
        assert!(c2 < 0.7 && c3 > 0.7);
    }

    #[test]
    fn test_decay_steps() {
        let c = decay(0.8, 1);
        assert!((c - 0.56).abs() < 1e-9);
        // Three days offline compound.
        let c3 = decay(0.8, 3);
        assert!((c3 - 0.8 * 0.7 * 0.7 * 0.7).abs() < 1e-9);
        assert_eq!(decay(0.8, 0), 0.8);
    }

    proptest! {
        /// Confidence stays inside [0,1] under any interleaving of
        /// reinforcements and decays.
        #[test]
        fn confidence_stays_bounded(
            initial in 0.0_f64..=1.0,
            ops in prop::collection::vec(any::<bool>(), 0..64),
        ) {
            let mut c = initial;
            for reinforce_step in ops {
                c = if reinforce_step { reinforce(c) } else { decay(c, 1) };
                prop_assert!((0.0..=1.0).contains(&c), "confidence escaped: {c}");
            }
        }

        /// Reinforcement is monotone non-decreasing.
        #[test]
        fn reinforce_never_decreases(c in 0.0_f64..=1.0) {
            prop_assert!(reinforce(c) >= c);
        }
    }

    // --- keys ---

    #[test]
    fn test_normalize_key() {
        assert_eq!(normalize_key("Send Weekly Report!"), "send_weekly_report");
        assert_eq!(
            normalize_key("  What's   the Q3 budget?  "),
            "what_s_the_q3_budget"
        );
        // Capped at six words.
        assert_eq!(
            normalize_key("a b c d e f g h"),
            "a_b_c_d_e_f"
        );
        assert_eq!(normalize_key("!!!"), "unspecified");
    }

    #[test]
    fn test_time_bucket() {
        // 2026-03-02 is a Monday.
        let at = Utc.with_ymd_and_hms(2026, 3, 2, 9, 30, 0).unwrap();
        assert_eq!(time_bucket(at), "mon_09");
        let at = Utc.with_ymd_and_hms(2026, 3, 7, 23, 0, 0).unwrap();
        assert_eq!(time_bucket(at), "sat_23");
    }

    // --- incremental observation ---

    #[test]
    fn test_observe_creates_then_promotes() {
        let pool = init_test_db().unwrap();
        agents::upsert(&pool, "agent-a", "Agent A").unwrap();
        let base = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();

        let p1 = observe(&pool, "agent-a", PatternType::RecurringTask, "q3_budget", None, base)
            .unwrap();
        assert!(!p1.active);
        assert_eq!(p1.observation_count, 1);
        assert!((p1.confidence - 0.5).abs() < 1e-9);

        let p2 = observe(
            &pool,
            "agent-a",
            PatternType::RecurringTask,
            "q3_budget",
            None,
            base + Duration::hours(1),
        )
        .unwrap();
        assert!(!p2.active);
        assert!((p2.confidence - 0.65).abs() < 1e-9);

        let p3 = observe(
            &pool,
            "agent-a",
            PatternType::RecurringTask,
            "q3_budget",
            None,
            base + Duration::hours(2),
        )
        .unwrap();
        assert!(p3.active);
        assert_eq!(p3.observation_count, 3);
        assert!(p3.confidence > 0.7);
        assert_eq!(p3.id, p1.id);
    }

    #[test]
    fn test_min_occurrence_gate_per_type() {
        let pool = init_test_db().unwrap();
        agents::upsert(&pool, "agent-a", "Agent A").unwrap();
        let base = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();

        // Time preference needs five; three are not enough.
        for i in 0..3 {
            observe(
                &pool,
                "agent-a",
                PatternType::TimePreference,
                "mon_09",
                None,
                base + Duration::minutes(i),
            )
            .unwrap();
        }
        let p = pattern_repo::get_by_group(&pool, "agent-a", PatternType::TimePreference, "mon_09")
            .unwrap()
            .unwrap();
        assert!(!p.active);

        // Milestones promote immediately.
        let m = observe(
            &pool,
            "agent-a",
            PatternType::RelationshipMilestone,
            "interactions_10",
            None,
            base,
        )
        .unwrap();
        assert!(m.active);
    }

    #[test]
    fn test_task_completion_touches_expected_types() {
        let pool = init_test_db().unwrap();
        agents::upsert(&pool, "agent-a", "Agent A").unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();

        let payload = json!({
            "task_title": "Compile weekly numbers",
            "question": "What is the Q3 budget?",
            "success": false,
            "error": "request timeout after 30000ms",
        });
        let touched = observe_task_completion(&pool, "agent-a", &payload, now).unwrap();
        let types: Vec<PatternType> = touched.iter().map(|p| p.pattern_type).collect();
        assert_eq!(
            types,
            vec![
                PatternType::RecurringTask,
                PatternType::TimePreference,
                PatternType::ErrorPattern,
            ]
        );
        // The question outranks the title as the recurring key.
        assert_eq!(touched[0].group_key, "what_is_the_q3_budget");
        assert_eq!(touched[1].group_key, "mon_09");
    }

    #[test]
    fn test_milestone_crossing_and_learning_hooks() {
        let pool = init_test_db().unwrap();
        agents::upsert(&pool, "agent-a", "Agent A").unwrap();
        let now = Utc::now();

        let mut stats = AgentStats::empty("agent-a", &now.to_rfc3339());
        stats.total_interactions = 49;
        assert!(observe_conversation(&pool, "agent-a", &stats, now)
            .unwrap()
            .is_none());
        stats.total_interactions = 50;
        let m = observe_conversation(&pool, "agent-a", &stats, now)
            .unwrap()
            .unwrap();
        assert_eq!(m.group_key, "interactions_50");
        assert!(m.active);

        let skill = on_learning_created(
            &pool,
            "agent-a",
            &json!({"capability": "web search"}),
            now,
        )
        .unwrap();
        assert_eq!(skill.pattern_type, PatternType::SkillGap);
        assert_eq!(skill.group_key, "skill_web_search");

        let behavior = on_memory_saved(&pool, "agent-a", &json!({"kind": "preference"}), now).unwrap();
        assert_eq!(behavior.pattern_type, PatternType::UserBehavior);
        assert_eq!(behavior.group_key, "memory_preference");
    }

    #[test]
    fn test_scheduled_pattern_creation() {
        let pool = init_test_db().unwrap();
        agents::upsert(&pool, "agent-a", "Agent A").unwrap();
        let now = Utc::now();

        let p = create_scheduled_pattern(&pool, "agent-a", "Send weekly report", "0 9 * * 1", now)
            .unwrap();
        assert!(p.active);
        assert!(matches!(p.condition_rules.trigger, TriggerRule::Schedule { .. }));

        // Duplicate automation and bad cron both refuse.
        assert!(
            create_scheduled_pattern(&pool, "agent-a", "Send weekly report", "0 9 * * 1", now)
                .is_err()
        );
        assert!(create_scheduled_pattern(&pool, "agent-a", "Other", "not cron", now).is_err());
    }

    // --- reconciliation ---

    #[test]
    fn test_analyze_decays_once_per_day_and_archives() {
        let pool = init_test_db().unwrap();
        agents::upsert(&pool, "agent-a", "Agent A").unwrap();
        let three_days_ago = Utc::now() - Duration::days(3);

        // Build an active pattern last touched three days ago.
        for i in 0..3 {
            observe(
                &pool,
                "agent-a",
                PatternType::RecurringTask,
                "stale_habit",
                None,
                three_days_ago + Duration::minutes(i),
            )
            .unwrap();
        }
        let before = pattern_repo::get_by_group(&pool, "agent-a", PatternType::RecurringTask, "stale_habit")
            .unwrap()
            .unwrap();
        assert!(before.active);

        let now = Utc::now();
        let summary = analyze_patterns(&pool, "agent-a", now).unwrap();
        assert_eq!(summary.decayed, 1);
        let after = pattern_repo::get_by_id(&pool, &before.id).unwrap();
        assert!((after.confidence - decay(before.confidence, 3)).abs() < 1e-9);

        // Same-day rerun: no further decay.
        let summary2 = analyze_patterns(&pool, "agent-a", now + Duration::minutes(10)).unwrap();
        assert_eq!(summary2.decayed, 0);
        let unchanged = pattern_repo::get_by_id(&pool, &before.id).unwrap();
        assert!((unchanged.confidence - after.confidence).abs() < 1e-9);

        // Force expiry and confirm archiving.
        let mut expiring = unchanged.clone();
        expiring.expires_at = (now - Duration::hours(1)).to_rfc3339();
        pattern_repo::update(&pool, &expiring).unwrap();
        let summary3 = analyze_patterns(&pool, "agent-a", now + Duration::minutes(20)).unwrap();
        assert_eq!(summary3.archived, 1);
        assert!(!pattern_repo::get_by_id(&pool, &before.id).unwrap().active);
    }

    #[test]
    fn test_promotion_sweep_heals_missing_rows() {
        let pool = init_test_db().unwrap();
        agents::upsert(&pool, "agent-a", "Agent A").unwrap();
        let now = Utc::now();

        // Observations exist but the pattern row was never written.
        for i in 0..4 {
            pattern_repo::add_observation(
                &pool,
                "agent-a",
                PatternType::ErrorPattern,
                "request_timeout_after",
                None,
                &(now - Duration::minutes(10 - i)).to_rfc3339(),
            )
            .unwrap();
        }

        let summary = analyze_patterns(&pool, "agent-a", now).unwrap();
        assert_eq!(summary.promoted, 1);
        let healed =
            pattern_repo::get_by_group(&pool, "agent-a", PatternType::ErrorPattern, "request_timeout_after")
                .unwrap()
                .unwrap();
        assert!(healed.active);
        assert_eq!(healed.observation_count, 4);
    }

    #[test]
    fn test_get_active_patterns_threshold() {
        let pool = init_test_db().unwrap();
        agents::upsert(&pool, "agent-a", "Agent A").unwrap();
        let now = Utc::now();

        // Two observations leave skill gaps active at 0.65.
        for i in 0..2 {
            observe(
                &pool,
                "agent-a",
                PatternType::SkillGap,
                "skill_web_search",
                None,
                now + Duration::minutes(i),
            )
            .unwrap();
        }
        let active = get_active_patterns(&pool, "agent-a", now + Duration::hours(1)).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].pattern_type, PatternType::SkillGap);
    }
}
