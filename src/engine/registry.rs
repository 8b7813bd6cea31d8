//! Healing action registry: the catalog of remediations the executor may run.
//!
//! Pure functions and static data — no DB or async dependencies.

use serde_json::Value;

use crate::db::models::{ActionType, HealingAction, HealingStat, RiskLevel};
use crate::error::AppError;

/// Static metadata for one action type.
#[derive(Debug, Clone, Copy)]
pub struct ActionSpec {
    pub action_type: ActionType,
    pub risk: RiskLevel,
    /// Baseline success estimate used until enough real outcomes accumulate.
    pub base_success_rate: f64,
    /// How many times the executor may re-run this action within one session.
    pub max_attempts: i64,
    /// Minimum spacing between two runs of this action on the same agent.
    pub cooldown_secs: i64,
    /// Safe to re-run when the previous outcome was lost (restart recovery).
    pub idempotent: bool,
    pub description: &'static str,
}

/// Outcomes below this sample size fall back to the baseline estimate.
pub const MIN_STAT_SAMPLES: i64 = 3;

const CATALOG: [ActionSpec; 7] = [
    ActionSpec {
        action_type: ActionType::Retry,
        risk: RiskLevel::Safe,
        base_success_rate: 0.70,
        max_attempts: 3,
        cooldown_secs: 60,
        idempotent: false,
        description: "Re-run the failed operation with exponential backoff",
    },
    ActionSpec {
        action_type: ActionType::RefreshConnection,
        risk: RiskLevel::Safe,
        base_success_rate: 0.80,
        max_attempts: 2,
        cooldown_secs: 120,
        idempotent: true,
        description: "Tear down and re-establish upstream connections",
    },
    ActionSpec {
        action_type: ActionType::ClearCache,
        risk: RiskLevel::Safe,
        base_success_rate: 0.60,
        max_attempts: 2,
        cooldown_secs: 300,
        idempotent: true,
        description: "Drop cached state that may have gone stale",
    },
    ActionSpec {
        action_type: ActionType::ResetState,
        risk: RiskLevel::Moderate,
        base_success_rate: 0.50,
        max_attempts: 1,
        cooldown_secs: 600,
        idempotent: true,
        description: "Reset the agent's working state to a known-good baseline",
    },
    ActionSpec {
        action_type: ActionType::UseFallback,
        risk: RiskLevel::Moderate,
        base_success_rate: 0.55,
        max_attempts: 2,
        cooldown_secs: 300,
        idempotent: true,
        description: "Route work through a fallback provider or capability",
    },
    ActionSpec {
        action_type: ActionType::NotifyAdmin,
        risk: RiskLevel::Safe,
        base_success_rate: 0.99,
        max_attempts: 3,
        cooldown_secs: 300,
        idempotent: true,
        description: "Alert a human operator with the diagnosis summary",
    },
    ActionSpec {
        action_type: ActionType::AutoRestart,
        risk: RiskLevel::Risky,
        base_success_rate: 0.75,
        max_attempts: 1,
        cooldown_secs: 900,
        idempotent: false,
        description: "Restart the agent process, losing in-flight work",
    },
];

pub fn spec(action_type: ActionType) -> &'static ActionSpec {
    // CATALOG covers every variant; the iterator always finds a match.
    CATALOG
        .iter()
        .find(|s| s.action_type == action_type)
        .unwrap_or(&CATALOG[0])
}

pub fn all_specs() -> &'static [ActionSpec] {
    &CATALOG
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Check an action's parameters against its schema.
///
/// The executor refuses to enqueue anything that fails here, so downstream
/// code can assume well-formed params.
pub fn validate(action: &HealingAction) -> Result<(), AppError> {
    let params = match &action.params {
        Value::Object(map) => map,
        Value::Null => {
            return required_params_present(action.action_type, None);
        }
        other => {
            return Err(AppError::validation(format!(
                "{} params must be a JSON object, got {}",
                action.action_type.as_str(),
                json_kind(other)
            )));
        }
    };

    match action.action_type {
        ActionType::Retry => {
            if let Some(v) = params.get("max_retries") {
                let n = as_int(v, "max_retries")?;
                if !(1..=10).contains(&n) {
                    return Err(AppError::validation(format!(
                        "max_retries must be between 1 and 10, got {n}"
                    )));
                }
            }
            let initial = opt_positive_int(params.get("initial_delay_ms"), "initial_delay_ms")?;
            let max = opt_positive_int(params.get("max_delay_ms"), "max_delay_ms")?;
            if let (Some(i), Some(m)) = (initial, max) {
                if m < i {
                    return Err(AppError::validation(
                        "max_delay_ms must be >= initial_delay_ms",
                    ));
                }
            }
            Ok(())
        }
        ActionType::RefreshConnection => opt_nonempty_str(params.get("target"), "target"),
        ActionType::ClearCache => opt_nonempty_str(params.get("scope"), "scope"),
        ActionType::ResetState => {
            let scope = require_str(params.get("scope"), "scope", action.action_type)?;
            match scope {
                "current_task" | "agent" | "all" => Ok(()),
                other => Err(AppError::validation(format!(
                    "reset_state scope must be current_task, agent, or all, got '{other}'"
                ))),
            }
        }
        ActionType::UseFallback => {
            let target =
                require_str(params.get("fallback_target"), "fallback_target", action.action_type)?;
            if target.is_empty() {
                return Err(AppError::validation("fallback_target must not be empty"));
            }
            Ok(())
        }
        ActionType::NotifyAdmin => {
            let message = require_str(params.get("message"), "message", action.action_type)?;
            if message.is_empty() {
                return Err(AppError::validation("message must not be empty"));
            }
            if let Some(v) = params.get("severity") {
                let s = as_str(v, "severity")?;
                if !matches!(s, "low" | "medium" | "high" | "critical") {
                    return Err(AppError::validation(format!(
                        "severity must be low, medium, high, or critical, got '{s}'"
                    )));
                }
            }
            Ok(())
        }
        ActionType::AutoRestart => {
            if let Some(v) = params.get("mode") {
                let mode = as_str(v, "mode")?;
                if !matches!(mode, "graceful" | "forced") {
                    return Err(AppError::validation(format!(
                        "auto_restart mode must be graceful or forced, got '{mode}'"
                    )));
                }
            }
            Ok(())
        }
    }
}

fn required_params_present(
    action_type: ActionType,
    _params: Option<&serde_json::Map<String, Value>>,
) -> Result<(), AppError> {
    // Null params are fine for actions whose fields are all optional.
    match action_type {
        ActionType::ResetState => Err(AppError::validation("reset_state requires a scope param")),
        ActionType::UseFallback => {
            Err(AppError::validation("use_fallback requires a fallback_target param"))
        }
        ActionType::NotifyAdmin => Err(AppError::validation("notify_admin requires a message param")),
        _ => Ok(()),
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn as_int(v: &Value, field: &str) -> Result<i64, AppError> {
    v.as_i64()
        .ok_or_else(|| AppError::validation(format!("{field} must be an integer")))
}

fn as_str<'a>(v: &'a Value, field: &str) -> Result<&'a str, AppError> {
    v.as_str()
        .ok_or_else(|| AppError::validation(format!("{field} must be a string")))
}

fn opt_positive_int(v: Option<&Value>, field: &str) -> Result<Option<i64>, AppError> {
    match v {
        None => Ok(None),
        Some(v) => {
            let n = as_int(v, field)?;
            if n <= 0 {
                return Err(AppError::validation(format!("{field} must be positive")));
            }
            Ok(Some(n))
        }
    }
}

fn opt_nonempty_str(v: Option<&Value>, field: &str) -> Result<(), AppError> {
    if let Some(v) = v {
        let s = as_str(v, field)?;
        if s.is_empty() {
            return Err(AppError::validation(format!("{field} must not be empty")));
        }
    }
    Ok(())
}

fn require_str<'a>(
    v: Option<&'a Value>,
    field: &str,
    action_type: ActionType,
) -> Result<&'a str, AppError> {
    match v {
        Some(v) => as_str(v, field),
        None => Err(AppError::validation(format!(
            "{} requires a {field} param",
            action_type.as_str()
        ))),
    }
}

// ---------------------------------------------------------------------------
// Approval gating and prioritization
// ---------------------------------------------------------------------------

/// Whether the executor may run this action without a human in the loop.
///
/// True only for safe actions with attempt budget left. Moderate and risky
/// actions always go through the approval gate.
pub fn can_execute_without_approval(action_type: ActionType, attempts_so_far: i64) -> bool {
    let s = spec(action_type);
    s.risk == RiskLevel::Safe && attempts_so_far < s.max_attempts
}

/// Expected success rate for an action: real outcome history when the sample
/// is large enough, baseline otherwise.
pub fn expected_success(action_type: ActionType, stats: &[HealingStat]) -> f64 {
    let historical = stats
        .iter()
        .find(|s| s.action_type == action_type)
        .filter(|s| s.success_count + s.failure_count >= MIN_STAT_SAMPLES)
        .and_then(|s| s.success_rate());
    historical.unwrap_or_else(|| spec(action_type).base_success_rate)
}

/// Order candidate actions by ascending risk, then descending expected
/// success. The executor walks the result front to back.
pub fn prioritize_actions(actions: &mut [HealingAction], stats: &[HealingStat]) {
    actions.sort_by(|a, b| {
        let risk_a = spec(a.action_type).risk;
        let risk_b = spec(b.action_type).risk;
        risk_a.cmp(&risk_b).then_with(|| {
            let sa = expected_success(a.action_type, stats);
            let sb = expected_success(b.action_type, stats);
            sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
        })
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    // --- catalog ---

    #[test]
    fn test_catalog_covers_every_action() {
        for at in ActionType::ALL {
            assert_eq!(spec(at).action_type, at);
        }
        assert_eq!(all_specs().len(), ActionType::ALL.len());
    }

    #[test]
    fn test_risk_assignments() {
        assert_eq!(spec(ActionType::Retry).risk, RiskLevel::Safe);
        assert_eq!(spec(ActionType::RefreshConnection).risk, RiskLevel::Safe);
        assert_eq!(spec(ActionType::ClearCache).risk, RiskLevel::Safe);
        assert_eq!(spec(ActionType::NotifyAdmin).risk, RiskLevel::Safe);
        assert_eq!(spec(ActionType::ResetState).risk, RiskLevel::Moderate);
        assert_eq!(spec(ActionType::UseFallback).risk, RiskLevel::Moderate);
        assert_eq!(spec(ActionType::AutoRestart).risk, RiskLevel::Risky);
    }

    // --- validate ---

    #[test]
    fn test_validate_retry_bounds() {
        let ok = HealingAction::new(ActionType::Retry, json!({"max_retries": 3}));
        assert!(validate(&ok).is_ok());

        let zero = HealingAction::new(ActionType::Retry, json!({"max_retries": 0}));
        assert!(validate(&zero).is_err());

        let eleven = HealingAction::new(ActionType::Retry, json!({"max_retries": 11}));
        assert!(validate(&eleven).is_err());

        let bad_type = HealingAction::new(ActionType::Retry, json!({"max_retries": "three"}));
        assert!(validate(&bad_type).is_err());

        let inverted = HealingAction::new(
            ActionType::Retry,
            json!({"initial_delay_ms": 5000, "max_delay_ms": 1000}),
        );
        assert!(validate(&inverted).is_err());

        // All fields optional: empty object is valid.
        let empty = HealingAction::new(ActionType::Retry, json!({}));
        assert!(validate(&empty).is_ok());
    }

    #[test]
    fn test_validate_required_params() {
        let no_scope = HealingAction::new(ActionType::ResetState, json!({}));
        assert!(validate(&no_scope).is_err());
        let bad_scope = HealingAction::new(ActionType::ResetState, json!({"scope": "universe"}));
        assert!(validate(&bad_scope).is_err());
        let ok_scope = HealingAction::new(ActionType::ResetState, json!({"scope": "agent"}));
        assert!(validate(&ok_scope).is_ok());

        let no_target = HealingAction::new(ActionType::UseFallback, json!({}));
        assert!(validate(&no_target).is_err());
        let ok_target =
            HealingAction::new(ActionType::UseFallback, json!({"fallback_target": "backup-llm"}));
        assert!(validate(&ok_target).is_ok());

        let no_message = HealingAction::new(ActionType::NotifyAdmin, json!({"severity": "high"}));
        assert!(validate(&no_message).is_err());
        let bad_severity = HealingAction::new(
            ActionType::NotifyAdmin,
            json!({"message": "check agent", "severity": "catastrophic"}),
        );
        assert!(validate(&bad_severity).is_err());
    }

    #[test]
    fn test_validate_rejects_non_object_params() {
        let arr = HealingAction::new(ActionType::Retry, json!([1, 2, 3]));
        assert!(validate(&arr).is_err());
        // Null is accepted when every field is optional.
        let null = HealingAction::new(ActionType::Retry, Value::Null);
        assert!(validate(&null).is_ok());
        let null_required = HealingAction::new(ActionType::UseFallback, Value::Null);
        assert!(validate(&null_required).is_err());
    }

    // --- approval gating ---

    #[test]
    fn test_approval_gating() {
        assert!(can_execute_without_approval(ActionType::Retry, 0));
        assert!(can_execute_without_approval(ActionType::Retry, 2));
        // Attempt budget spent.
        assert!(!can_execute_without_approval(ActionType::Retry, 3));
        // Non-safe actions never qualify, even on the first attempt.
        for at in ActionType::ALL {
            if spec(at).risk != RiskLevel::Safe {
                assert!(!can_execute_without_approval(at, 0), "{:?} must gate", at);
            }
        }
    }

    // --- prioritization ---

    fn action(at: ActionType) -> HealingAction {
        HealingAction::new(at, json!({}))
    }

    #[test]
    fn test_prioritize_risk_then_success() {
        let mut actions = vec![
            action(ActionType::AutoRestart),
            action(ActionType::Retry),
            action(ActionType::RefreshConnection),
        ];
        prioritize_actions(&mut actions, &[]);
        let order: Vec<ActionType> = actions.iter().map(|a| a.action_type).collect();
        // Safe before risky; refresh_connection (0.80) before retry (0.70).
        assert_eq!(
            order,
            vec![
                ActionType::RefreshConnection,
                ActionType::Retry,
                ActionType::AutoRestart,
            ]
        );
    }

    #[test]
    fn test_prioritize_uses_history_when_sampled() {
        let stats = vec![HealingStat {
            issue_type: crate::db::models::IssueType::Connectivity,
            action_type: ActionType::Retry,
            success_count: 9,
            failure_count: 1,
            last_outcome_at: "2026-01-01T00:00:00Z".into(),
        }];
        // Retry's historical 0.9 now beats refresh_connection's baseline 0.8.
        let mut actions = vec![action(ActionType::RefreshConnection), action(ActionType::Retry)];
        prioritize_actions(&mut actions, &stats);
        assert_eq!(actions[0].action_type, ActionType::Retry);

        // Under the sample floor the baseline still applies.
        let thin = vec![HealingStat {
            issue_type: crate::db::models::IssueType::Connectivity,
            action_type: ActionType::Retry,
            success_count: 2,
            failure_count: 0,
            last_outcome_at: "2026-01-01T00:00:00Z".into(),
        }];
        let mut actions = vec![action(ActionType::RefreshConnection), action(ActionType::Retry)];
        prioritize_actions(&mut actions, &thin);
        assert_eq!(actions[0].action_type, ActionType::RefreshConnection);
    }

    proptest! {
        /// Risk never decreases along a prioritized list, whatever the input
        /// order or the outcome history.
        #[test]
        fn prioritized_risk_is_monotonic(
            picks in prop::collection::vec(0_usize..7, 1..12),
            successes in prop::collection::vec(0_i64..20, 7),
            failures in prop::collection::vec(0_i64..20, 7),
        ) {
            let mut actions: Vec<HealingAction> = picks
                .iter()
                .map(|&i| action(ActionType::ALL[i]))
                .collect();
            let stats: Vec<HealingStat> = ActionType::ALL
                .iter()
                .enumerate()
                .map(|(i, &at)| HealingStat {
                    issue_type: crate::db::models::IssueType::Unknown,
                    action_type: at,
                    success_count: successes[i],
                    failure_count: failures[i],
                    last_outcome_at: "2026-01-01T00:00:00Z".into(),
                })
                .collect();

            prioritize_actions(&mut actions, &stats);

            for pair in actions.windows(2) {
                prop_assert!(
                    spec(pair[0].action_type).risk <= spec(pair[1].action_type).risk,
                    "risk decreased: {:?} before {:?}",
                    pair[0].action_type,
                    pair[1].action_type,
                );
            }
        }
    }
}
