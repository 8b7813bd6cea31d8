//! Trigger evaluator: pure decision logic that matches active patterns
//! against a snapshot of context. No database access and no wall clock; the
//! caller assembles a [`TriggerContext`] and stamps `last_triggered_at` on
//! the patterns that fired.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use crate::db::models::{
    AgentStats, Condition, ConditionOp, Pattern, PatternType, StatsMetric, TriggerEventType,
    TriggerRule,
};
use crate::engine::cron::CronSchedule;

/// Everything the evaluator is allowed to look at for one event.
#[derive(Debug, Clone)]
pub struct TriggerContext {
    pub agent_id: String,
    pub event_type: TriggerEventType,
    /// Event payload; condition field paths resolve into this unless they
    /// start with `stats.`.
    pub payload: Value,
    pub stats: AgentStats,
    pub pending_suggestions: i64,
    pub now: DateTime<Utc>,
}

impl TriggerContext {
    pub fn new(
        agent_id: &str,
        event_type: TriggerEventType,
        payload: Value,
        stats: AgentStats,
        pending_suggestions: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            event_type,
            payload,
            stats,
            pending_suggestions,
            now,
        }
    }
}

/// One pattern that decided to fire.
#[derive(Debug, Clone)]
pub struct TriggerFire {
    pub pattern_id: String,
    pub pattern_type: PatternType,
    pub group_key: String,
    pub confidence: f64,
    pub reason: String,
}

/// Outcome of one evaluation pass. Suppression counters feed heartbeat
/// sub-results so a quiet cycle is distinguishable from a broken one.
#[derive(Debug, Default)]
pub struct TriggerEvaluation {
    pub fired: Vec<TriggerFire>,
    pub suppressed_by_cooldown: usize,
    pub suppressed_by_conditions: usize,
}

// ---------------------------------------------------------------------------
// Field and metric resolution
// ---------------------------------------------------------------------------

fn stats_field(stats: &AgentStats, pending_suggestions: i64, name: &str) -> Option<Value> {
    match name {
        "success_rate" => serde_json::Number::from_f64(stats.success_rate).map(Value::Number),
        "failed_tasks" => Some(Value::from(stats.failed_tasks)),
        "failed_workflows" => Some(Value::from(stats.failed_workflows)),
        "total_tasks" => Some(Value::from(stats.total_tasks)),
        "total_workflows" => Some(Value::from(stats.total_workflows)),
        "total_interactions" => Some(Value::from(stats.total_interactions)),
        "pending_suggestions" => Some(Value::from(pending_suggestions)),
        "last_interaction_at" => stats
            .last_interaction_at
            .as_ref()
            .map(|s| Value::String(s.clone())),
        _ => None,
    }
}

/// Resolve a dotted field path: `stats.*` reads the snapshot, everything
/// else traverses the event payload.
fn resolve_field(ctx: &TriggerContext, path: &str) -> Option<Value> {
    if let Some(stat) = path.strip_prefix("stats.") {
        return stats_field(&ctx.stats, ctx.pending_suggestions, stat);
    }
    let mut cursor = &ctx.payload;
    for segment in path.split('.') {
        cursor = cursor.get(segment)?;
    }
    Some(cursor.clone())
}

/// Resolve the numeric value a threshold rule compares against.
pub fn metric_value(metric: StatsMetric, stats: &AgentStats, pending_suggestions: i64) -> f64 {
    match metric {
        StatsMetric::SuccessRate => stats.success_rate,
        StatsMetric::FailedTasks => stats.failed_tasks as f64,
        StatsMetric::FailedWorkflows => stats.failed_workflows as f64,
        StatsMetric::TotalInteractions => stats.total_interactions as f64,
        StatsMetric::PendingSuggestions => pending_suggestions as f64,
    }
}

/// Numeric comparison for threshold rules. String and existence operators
/// make no sense against a metric and never match.
fn threshold_met(actual: f64, op: ConditionOp, threshold: f64) -> bool {
    match op {
        ConditionOp::Eq => (actual - threshold).abs() < f64::EPSILON,
        ConditionOp::Neq => (actual - threshold).abs() >= f64::EPSILON,
        ConditionOp::Gt => actual > threshold,
        ConditionOp::Gte => actual >= threshold,
        ConditionOp::Lt => actual < threshold,
        ConditionOp::Lte => actual <= threshold,
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Condition evaluation
// ---------------------------------------------------------------------------

fn as_number(v: &Value) -> Option<f64> {
    v.as_f64()
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => (x - y).abs() < f64::EPSILON,
        _ => a == b,
    }
}

fn value_contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => needle
            .as_str()
            .map(|n| s.to_lowercase().contains(&n.to_lowercase()))
            .unwrap_or(false),
        Value::Array(items) => items.iter().any(|item| values_equal(item, needle)),
        _ => false,
    }
}

/// Evaluate one condition. A missing field fails everything except
/// `NotExists`.
pub fn condition_met(ctx: &TriggerContext, condition: &Condition) -> bool {
    let actual = resolve_field(ctx, &condition.field);
    match condition.op {
        ConditionOp::Exists => return actual.is_some(),
        ConditionOp::NotExists => return actual.is_none(),
        _ => {}
    }
    let Some(actual) = actual else {
        return false;
    };
    match condition.op {
        ConditionOp::Eq => values_equal(&actual, &condition.value),
        ConditionOp::Neq => !values_equal(&actual, &condition.value),
        ConditionOp::Gt => matches!(
            (as_number(&actual), as_number(&condition.value)),
            (Some(a), Some(b)) if a > b
        ),
        ConditionOp::Gte => matches!(
            (as_number(&actual), as_number(&condition.value)),
            (Some(a), Some(b)) if a >= b
        ),
        ConditionOp::Lt => matches!(
            (as_number(&actual), as_number(&condition.value)),
            (Some(a), Some(b)) if a < b
        ),
        ConditionOp::Lte => matches!(
            (as_number(&actual), as_number(&condition.value)),
            (Some(a), Some(b)) if a <= b
        ),
        ConditionOp::Contains => value_contains(&actual, &condition.value),
        ConditionOp::NotContains => !value_contains(&actual, &condition.value),
        ConditionOp::Exists | ConditionOp::NotExists => unreachable!("handled above"),
    }
}

fn conditions_met(ctx: &TriggerContext, conditions: &[Condition]) -> bool {
    conditions.iter().all(|c| condition_met(ctx, c))
}

fn cooldown_elapsed(pattern: &Pattern, now: DateTime<Utc>) -> bool {
    let Some(last) = pattern.last_triggered_at.as_deref() else {
        return true;
    };
    match DateTime::parse_from_rfc3339(last) {
        Ok(last) => {
            now - last.with_timezone(&Utc)
                >= Duration::minutes(pattern.condition_rules.cooldown_minutes)
        }
        Err(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Evaluation passes
// ---------------------------------------------------------------------------

/// Match every active pattern against one live event. Schedule-triggered
/// patterns never fire here; they belong to [`evaluate_scheduled_triggers`].
pub fn evaluate_triggers(ctx: &TriggerContext, active_patterns: &[Pattern]) -> TriggerEvaluation {
    let mut eval = TriggerEvaluation::default();

    for pattern in active_patterns {
        let rule_matches = match &pattern.condition_rules.trigger {
            TriggerRule::Event { event_type } => *event_type == ctx.event_type,
            TriggerRule::Threshold { metric, op, value } => {
                let actual = metric_value(*metric, &ctx.stats, ctx.pending_suggestions);
                threshold_met(actual, *op, *value)
            }
            TriggerRule::Schedule { .. } => false,
        };
        if !rule_matches {
            continue;
        }
        if !conditions_met(ctx, &pattern.condition_rules.conditions) {
            eval.suppressed_by_conditions += 1;
            continue;
        }
        if !cooldown_elapsed(pattern, ctx.now) {
            eval.suppressed_by_cooldown += 1;
            continue;
        }
        let reason = match &pattern.condition_rules.trigger {
            TriggerRule::Threshold { metric, op, value } => format!(
                "{} '{}': {} {:?} {} (confidence {:.2})",
                pattern.pattern_type.as_str(),
                pattern.group_key,
                metric.as_str(),
                op,
                value,
                pattern.confidence,
            ),
            _ => format!(
                "{} '{}' fired on {} (confidence {:.2})",
                pattern.pattern_type.as_str(),
                pattern.group_key,
                ctx.event_type.as_str(),
                pattern.confidence,
            ),
        };
        eval.fired.push(TriggerFire {
            pattern_id: pattern.id.clone(),
            pattern_type: pattern.pattern_type,
            group_key: pattern.group_key.clone(),
            confidence: pattern.confidence,
            reason,
        });
    }

    eval
}

/// Scheduled pass, run from heartbeats: a cron rule fires when a tick landed
/// inside the window since the previous run and the cooldown allows it.
/// Patterns with unparseable cron expressions are skipped with a warning
/// rather than failing the cycle.
pub fn evaluate_scheduled_triggers(
    active_patterns: &[Pattern],
    window_minutes: i64,
    now: DateTime<Utc>,
) -> TriggerEvaluation {
    let mut eval = TriggerEvaluation::default();

    for pattern in active_patterns {
        let TriggerRule::Schedule { cron } = &pattern.condition_rules.trigger else {
            continue;
        };
        let schedule = match CronSchedule::parse(cron) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(
                    pattern_id = %pattern.id,
                    cron = %cron,
                    error = %e,
                    "Skipping pattern with invalid schedule"
                );
                continue;
            }
        };
        let Some(tick) = schedule.due_within(now, window_minutes) else {
            continue;
        };
        if !cooldown_elapsed(pattern, now) {
            eval.suppressed_by_cooldown += 1;
            continue;
        }
        eval.fired.push(TriggerFire {
            pattern_id: pattern.id.clone(),
            pattern_type: pattern.pattern_type,
            group_key: pattern.group_key.clone(),
            confidence: pattern.confidence,
            reason: format!(
                "schedule '{}' due at {} (confidence {:.2})",
                cron,
                tick.format("%H:%M"),
                pattern.confidence,
            ),
        });
    }

    eval
}

/// Task-completion wrapper: builds the context with the right event type so
/// callers cannot mislabel the event.
pub fn evaluate_task_completion(
    agent_id: &str,
    payload: Value,
    stats: AgentStats,
    pending_suggestions: i64,
    now: DateTime<Utc>,
    active_patterns: &[Pattern],
) -> TriggerEvaluation {
    let ctx = TriggerContext::new(
        agent_id,
        TriggerEventType::TaskComplete,
        payload,
        stats,
        pending_suggestions,
        now,
    );
    evaluate_triggers(&ctx, active_patterns)
}

pub fn evaluate_workflow_completion(
    agent_id: &str,
    payload: Value,
    stats: AgentStats,
    pending_suggestions: i64,
    now: DateTime<Utc>,
    active_patterns: &[Pattern],
) -> TriggerEvaluation {
    let ctx = TriggerContext::new(
        agent_id,
        TriggerEventType::WorkflowComplete,
        payload,
        stats,
        pending_suggestions,
        now,
    );
    evaluate_triggers(&ctx, active_patterns)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::ConditionRules;
    use chrono::TimeZone;
    use serde_json::json;

    fn make_pattern(trigger: TriggerRule, conditions: Vec<Condition>) -> Pattern {
        let now = Utc::now();
        Pattern {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: "agent-a".into(),
            pattern_type: PatternType::RecurringTask,
            group_key: "q3_budget".into(),
            condition_rules: ConditionRules {
                trigger,
                conditions,
                cooldown_minutes: 60,
            },
            confidence: 0.76,
            observation_count: 3,
            active: true,
            last_observed_at: now.to_rfc3339(),
            last_triggered_at: None,
            expires_at: (now + Duration::days(30)).to_rfc3339(),
            created_at: now.to_rfc3339(),
            updated_at: now.to_rfc3339(),
        }
    }

    fn make_ctx(event_type: TriggerEventType, payload: Value) -> TriggerContext {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let mut stats = AgentStats::empty("agent-a", &now.to_rfc3339());
        stats.success_rate = 0.65;
        stats.failed_tasks = 7;
        TriggerContext::new("agent-a", event_type, payload, stats, 2, now)
    }

    // --- evaluate_triggers ---

    #[test]
    fn test_event_trigger_matches_event_type() {
        let pattern = make_pattern(
            TriggerRule::Event {
                event_type: TriggerEventType::TaskComplete,
            },
            vec![],
        );
        let ctx = make_ctx(TriggerEventType::TaskComplete, json!({}));
        let eval = evaluate_triggers(&ctx, std::slice::from_ref(&pattern));
        assert_eq!(eval.fired.len(), 1);
        assert_eq!(eval.fired[0].pattern_id, pattern.id);

        let other = make_ctx(TriggerEventType::MemorySaved, json!({}));
        assert!(evaluate_triggers(&other, &[pattern]).fired.is_empty());
    }

    #[test]
    fn test_conditions_gate_firing() {
        let pattern = make_pattern(
            TriggerRule::Event {
                event_type: TriggerEventType::TaskComplete,
            },
            vec![Condition {
                field: "task_title".into(),
                op: ConditionOp::Contains,
                value: json!("report"),
            }],
        );

        let hit = make_ctx(
            TriggerEventType::TaskComplete,
            json!({"task_title": "Weekly Report draft"}),
        );
        assert_eq!(evaluate_triggers(&hit, std::slice::from_ref(&pattern)).fired.len(), 1);

        let miss = make_ctx(
            TriggerEventType::TaskComplete,
            json!({"task_title": "Standup notes"}),
        );
        let eval = evaluate_triggers(&miss, &[pattern]);
        assert!(eval.fired.is_empty());
        assert_eq!(eval.suppressed_by_conditions, 1);
    }

    #[test]
    fn test_missing_field_fails_all_but_not_exists() {
        let ctx = make_ctx(TriggerEventType::TaskComplete, json!({"a": 1}));
        let missing = |op| Condition {
            field: "nope".into(),
            op,
            value: json!(1),
        };
        assert!(!condition_met(&ctx, &missing(ConditionOp::Eq)));
        assert!(!condition_met(&ctx, &missing(ConditionOp::Gt)));
        assert!(!condition_met(&ctx, &missing(ConditionOp::Exists)));
        assert!(condition_met(&ctx, &missing(ConditionOp::NotExists)));
        assert!(condition_met(
            &ctx,
            &Condition {
                field: "a".into(),
                op: ConditionOp::Exists,
                value: Value::Null,
            }
        ));
    }

    #[test]
    fn test_nested_and_stats_paths() {
        let ctx = make_ctx(
            TriggerEventType::TaskComplete,
            json!({"result": {"status": "failed"}}),
        );
        assert!(condition_met(
            &ctx,
            &Condition {
                field: "result.status".into(),
                op: ConditionOp::Eq,
                value: json!("failed"),
            }
        ));
        // Snapshot fields resolve under the stats prefix.
        assert!(condition_met(
            &ctx,
            &Condition {
                field: "stats.success_rate".into(),
                op: ConditionOp::Lt,
                value: json!(0.7),
            }
        ));
        assert!(condition_met(
            &ctx,
            &Condition {
                field: "stats.pending_suggestions".into(),
                op: ConditionOp::Lte,
                value: json!(2),
            }
        ));
    }

    #[test]
    fn test_threshold_trigger_reads_snapshot() {
        let pattern = make_pattern(
            TriggerRule::Threshold {
                metric: StatsMetric::SuccessRate,
                op: ConditionOp::Lt,
                value: 0.7,
            },
            vec![],
        );
        let ctx = make_ctx(TriggerEventType::TaskComplete, json!({}));
        let eval = evaluate_triggers(&ctx, std::slice::from_ref(&pattern));
        assert_eq!(eval.fired.len(), 1);
        assert!(eval.fired[0].reason.contains("success_rate"));

        let healthy_pattern = make_pattern(
            TriggerRule::Threshold {
                metric: StatsMetric::FailedTasks,
                op: ConditionOp::Gt,
                value: 10.0,
            },
            vec![],
        );
        assert!(evaluate_triggers(&ctx, &[healthy_pattern]).fired.is_empty());
    }

    #[test]
    fn test_metric_resolution_and_non_numeric_threshold_ops() {
        let ctx = make_ctx(TriggerEventType::TaskComplete, json!({}));
        assert_eq!(
            metric_value(StatsMetric::FailedTasks, &ctx.stats, ctx.pending_suggestions),
            7.0
        );
        assert_eq!(
            metric_value(StatsMetric::PendingSuggestions, &ctx.stats, ctx.pending_suggestions),
            2.0
        );
        assert!(
            (metric_value(StatsMetric::SuccessRate, &ctx.stats, 0) - 0.65).abs() < 1e-9
        );

        // A string operator on a numeric metric can never match.
        let nonsense = make_pattern(
            TriggerRule::Threshold {
                metric: StatsMetric::FailedTasks,
                op: ConditionOp::Contains,
                value: 7.0,
            },
            vec![],
        );
        assert!(evaluate_triggers(&ctx, &[nonsense]).fired.is_empty());
    }

    #[test]
    fn test_cooldown_suppression() {
        let mut pattern = make_pattern(
            TriggerRule::Event {
                event_type: TriggerEventType::TaskComplete,
            },
            vec![],
        );
        let ctx = make_ctx(TriggerEventType::TaskComplete, json!({}));

        pattern.last_triggered_at = Some((ctx.now - Duration::minutes(10)).to_rfc3339());
        let eval = evaluate_triggers(&ctx, std::slice::from_ref(&pattern));
        assert!(eval.fired.is_empty());
        assert_eq!(eval.suppressed_by_cooldown, 1);

        pattern.last_triggered_at = Some((ctx.now - Duration::minutes(61)).to_rfc3339());
        assert_eq!(evaluate_triggers(&ctx, &[pattern]).fired.len(), 1);
    }

    #[test]
    fn test_empty_pattern_list_is_quiet() {
        let ctx = make_ctx(TriggerEventType::TaskComplete, json!({}));
        let eval = evaluate_triggers(&ctx, &[]);
        assert!(eval.fired.is_empty());
        assert_eq!(eval.suppressed_by_cooldown, 0);
        assert_eq!(eval.suppressed_by_conditions, 0);
    }

    // --- evaluate_scheduled_triggers ---

    #[test]
    fn test_scheduled_fires_within_window() {
        let pattern = make_pattern(
            TriggerRule::Schedule {
                cron: "0 9 * * *".into(),
            },
            vec![],
        );
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 9, 7, 0).unwrap();
        let eval = evaluate_scheduled_triggers(std::slice::from_ref(&pattern), 15, now);
        assert_eq!(eval.fired.len(), 1);
        assert!(eval.fired[0].reason.contains("09:00"));

        let late = Utc.with_ymd_and_hms(2026, 3, 2, 9, 20, 0).unwrap();
        assert!(evaluate_scheduled_triggers(&[pattern], 15, late).fired.is_empty());
    }

    #[test]
    fn test_scheduled_skips_invalid_cron_and_respects_cooldown() {
        let bad = make_pattern(
            TriggerRule::Schedule {
                cron: "not a cron".into(),
            },
            vec![],
        );
        let mut cooling = make_pattern(
            TriggerRule::Schedule {
                cron: "*/5 * * * *".into(),
            },
            vec![],
        );
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 9, 5, 0).unwrap();
        cooling.last_triggered_at = Some((now - Duration::minutes(5)).to_rfc3339());

        let eval = evaluate_scheduled_triggers(&[bad, cooling], 15, now);
        assert!(eval.fired.is_empty());
        assert_eq!(eval.suppressed_by_cooldown, 1);
    }

    // --- wrappers ---

    #[test]
    fn test_completion_wrappers_set_event_type() {
        let task_pattern = make_pattern(
            TriggerRule::Event {
                event_type: TriggerEventType::TaskComplete,
            },
            vec![],
        );
        let wf_pattern = make_pattern(
            TriggerRule::Event {
                event_type: TriggerEventType::WorkflowComplete,
            },
            vec![],
        );
        let now = Utc::now();
        let stats = AgentStats::empty("agent-a", &now.to_rfc3339());
        let patterns = vec![task_pattern.clone(), wf_pattern.clone()];

        let task_eval =
            evaluate_task_completion("agent-a", json!({}), stats.clone(), 0, now, &patterns);
        assert_eq!(task_eval.fired.len(), 1);
        assert_eq!(task_eval.fired[0].pattern_id, task_pattern.id);

        let wf_eval =
            evaluate_workflow_completion("agent-a", json!({}), stats, 0, now, &patterns);
        assert_eq!(wf_eval.fired.len(), 1);
        assert_eq!(wf_eval.fired[0].pattern_id, wf_pattern.id);
    }
}
