//! Diagnosis engine: classifies observed failures into a fixed issue taxonomy,
//! grades severity from frequency and blast radius, and recommends ordered
//! remediation actions from the registry catalog.
//!
//! Classification and severity are pure functions; the `diagnose_agent` /
//! `diagnose_potential_issues` entry points add the heartbeat-log scanning.

use serde_json::json;

use crate::db::models::{
    ActionType, DiagnosisResult, HealingAction, HeartbeatResult, IssueSeverity, IssueType,
};
use crate::db::repos::heartbeats;
use crate::db::DbPool;
use crate::error::AppError;

/// How far back failure scanning looks.
pub const DIAGNOSIS_WINDOW_MINUTES: i64 = 10;
/// Failures at or above this count within the window bump severity one step.
pub const FREQUENCY_BUMP_THRESHOLD: usize = 5;
/// Distinct affected agents at or above this count bump severity one step.
pub const BLAST_RADIUS_BUMP_THRESHOLD: usize = 3;

/// Pre-emptive scanning looks at a wider window than failure scanning.
const PREEMPTIVE_WINDOW_MINUTES: i64 = 60;
const PREEMPTIVE_SCAN_LOGS: usize = 12;
/// Newer-half average latency must exceed older-half by this factor.
const LATENCY_TREND_FACTOR: f64 = 1.5;
/// Latency trends below this absolute level are noise.
const LATENCY_FLOOR_MS: f64 = 1000.0;
/// Degraded heartbeats at or above this count flag a leading indicator.
const DEGRADED_COUNT_THRESHOLD: usize = 3;

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Classify one failure message into the issue taxonomy.
///
/// Rate-limit signatures are checked before connectivity because provider
/// 429 bodies often mention requests and retries too.
pub fn determine_issue_type(message: &str) -> IssueType {
    let lower = message.to_lowercase();

    if lower.contains("rate limit")
        || lower.contains("too many requests")
        || lower.contains("429")
        || lower.contains("quota")
    {
        return IssueType::RateLimit;
    }

    if lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("connection")
        || lower.contains("network")
        || lower.contains("unreachable")
        || lower.contains("econnrefused")
        || lower.contains("dns")
    {
        return IssueType::Connectivity;
    }

    if lower.contains("corrupt")
        || lower.contains("invalid state")
        || lower.contains("inconsistent")
        || lower.contains("stuck")
        || lower.contains("deadlock")
    {
        return IssueType::StateCorruption;
    }

    if lower.contains("unknown tool")
        || lower.contains("unsupported")
        || lower.contains("not implemented")
        || lower.contains("missing capability")
        || lower.contains("no such capability")
    {
        return IssueType::CapabilityGap;
    }

    IssueType::Unknown
}

// ---------------------------------------------------------------------------
// Severity
// ---------------------------------------------------------------------------

pub fn base_severity(issue: IssueType) -> IssueSeverity {
    match issue {
        IssueType::Connectivity => IssueSeverity::Medium,
        IssueType::RateLimit => IssueSeverity::Medium,
        IssueType::StateCorruption => IssueSeverity::High,
        IssueType::CapabilityGap => IssueSeverity::Low,
        IssueType::Unknown => IssueSeverity::Low,
    }
}

/// Severity = base for the issue type, bumped once for high frequency and
/// once more for fleet-wide blast radius. Saturates at critical.
pub fn determine_severity(
    issue: IssueType,
    frequency: usize,
    affected_agents: usize,
) -> IssueSeverity {
    let mut severity = base_severity(issue);
    if frequency >= FREQUENCY_BUMP_THRESHOLD {
        severity = severity.bumped();
    }
    if affected_agents >= BLAST_RADIUS_BUMP_THRESHOLD {
        severity = severity.bumped();
    }
    severity
}

// ---------------------------------------------------------------------------
// Recommendations
// ---------------------------------------------------------------------------

/// Candidate actions per issue type, with resolved params. The executor
/// prioritizes these through the registry before running them.
///
/// notify_admin is deliberately absent: it is appended on escalation only,
/// after every candidate here has been exhausted.
pub fn recommended_actions(issue: IssueType) -> Vec<HealingAction> {
    match issue {
        IssueType::Connectivity => vec![
            HealingAction::new(ActionType::RefreshConnection, json!({"target": "all"})),
            HealingAction::new(
                ActionType::Retry,
                json!({"max_retries": 3, "initial_delay_ms": 1000, "max_delay_ms": 10000}),
            ),
            HealingAction::new(ActionType::AutoRestart, json!({"mode": "graceful"})),
        ],
        IssueType::RateLimit => vec![
            HealingAction::new(
                ActionType::Retry,
                json!({"max_retries": 3, "initial_delay_ms": 5000, "max_delay_ms": 60000}),
            ),
            HealingAction::new(ActionType::UseFallback, json!({"fallback_target": "secondary"})),
        ],
        IssueType::StateCorruption => vec![
            HealingAction::new(ActionType::ClearCache, json!({"scope": "all"})),
            HealingAction::new(ActionType::ResetState, json!({"scope": "current_task"})),
            HealingAction::new(ActionType::AutoRestart, json!({"mode": "graceful"})),
        ],
        IssueType::CapabilityGap => vec![HealingAction::new(
            ActionType::UseFallback,
            json!({"fallback_target": "secondary"}),
        )],
        IssueType::Unknown => vec![
            HealingAction::new(
                ActionType::Retry,
                json!({"max_retries": 2, "initial_delay_ms": 1000, "max_delay_ms": 5000}),
            ),
            HealingAction::new(ActionType::UseFallback, json!({"fallback_target": "secondary"})),
        ],
    }
}

/// Pre-registered fast-path signatures for quick healing. Each maps straight
/// to one pre-approved safe action, skipping full diagnosis.
pub fn known_signature(signature: &str) -> Option<(IssueType, HealingAction)> {
    match signature {
        "connection_timeout" => Some((
            IssueType::Connectivity,
            HealingAction::new(ActionType::RefreshConnection, json!({"target": "all"})),
        )),
        "stale_cache" => Some((
            IssueType::StateCorruption,
            HealingAction::new(ActionType::ClearCache, json!({"scope": "all"})),
        )),
        "rate_limited" => Some((
            IssueType::RateLimit,
            HealingAction::new(
                ActionType::Retry,
                json!({"max_retries": 3, "initial_delay_ms": 5000, "max_delay_ms": 60000}),
            ),
        )),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Diagnosis
// ---------------------------------------------------------------------------

/// An observed problem handed to [`diagnose`]. Frequency and blast radius
/// default to a single occurrence on a single agent.
#[derive(Debug, Clone)]
pub struct Symptom {
    pub agent_id: String,
    pub description: String,
    pub occurrences: usize,
    pub affected_agents: usize,
    pub evidence: Vec<String>,
}

impl Symptom {
    pub fn new(agent_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            description: description.into(),
            occurrences: 1,
            affected_agents: 1,
            evidence: Vec::new(),
        }
    }
}

/// Produce a full [`DiagnosisResult`] for one symptom. Pure: no clock, no DB.
pub fn diagnose(symptom: &Symptom) -> DiagnosisResult {
    let issue_type = determine_issue_type(&symptom.description);
    let severity = determine_severity(issue_type, symptom.occurrences, symptom.affected_agents);
    let confidence = classification_confidence(issue_type, symptom.occurrences);

    let evidence = if symptom.evidence.is_empty() {
        vec![symptom.description.clone()]
    } else {
        symptom.evidence.clone()
    };

    DiagnosisResult {
        agent_id: symptom.agent_id.clone(),
        issue_type,
        severity,
        summary: summarize(issue_type, symptom.occurrences, symptom.affected_agents),
        recommended_actions: recommended_actions(issue_type),
        confidence,
        evidence,
    }
}

fn classification_confidence(issue: IssueType, occurrences: usize) -> f64 {
    let base: f64 = match issue {
        IssueType::Unknown => 0.3,
        _ => 0.75,
    };
    let bump = 0.04 * occurrences.saturating_sub(1) as f64;
    (base + bump).min(0.95)
}

fn summarize(issue: IssueType, frequency: usize, affected_agents: usize) -> String {
    let what = match issue {
        IssueType::Connectivity => "connection failures",
        IssueType::RateLimit => "rate limiting",
        IssueType::StateCorruption => "corrupted working state",
        IssueType::CapabilityGap => "missing capability",
        IssueType::Unknown => "unclassified failures",
    };
    if affected_agents > 1 {
        format!(
            "{what}: {frequency} occurrence(s) in the last {DIAGNOSIS_WINDOW_MINUTES} minutes across {affected_agents} agents"
        )
    } else {
        format!("{what}: {frequency} occurrence(s) in the last {DIAGNOSIS_WINDOW_MINUTES} minutes")
    }
}

// ---------------------------------------------------------------------------
// Heartbeat-log scanning
// ---------------------------------------------------------------------------

/// Failure messages extracted from one log batch: (agent_id, message).
pub fn collect_failures(logs: &[crate::db::models::HeartbeatLog]) -> Vec<(String, String)> {
    let mut failures = Vec::new();
    for log in logs {
        for sub in &log.sub_results {
            if !sub.ok {
                if let Some(detail) = &sub.detail {
                    failures.push((log.agent_id.clone(), detail.clone()));
                }
            }
        }
    }
    failures
}

/// Scan one agent's recent failures and diagnose the dominant issue.
///
/// Returns `Ok(None)` when the window holds no failures at all.
pub fn diagnose_agent(
    pool: &DbPool,
    agent_id: &str,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<Option<DiagnosisResult>, AppError> {
    let since = (now - chrono::Duration::minutes(DIAGNOSIS_WINDOW_MINUTES)).to_rfc3339();
    let own_failures = collect_failures(&heartbeats::recent_for_agent(pool, agent_id, &since)?);
    if own_failures.is_empty() {
        return Ok(None);
    }

    // Dominant issue type by failure count; ties break toward the worse base
    // severity so state corruption outranks an equal number of unknowns.
    let mut counts: Vec<(IssueType, usize)> = Vec::new();
    for (_, message) in &own_failures {
        let issue = determine_issue_type(message);
        match counts.iter_mut().find(|(i, _)| *i == issue) {
            Some((_, n)) => *n += 1,
            None => counts.push((issue, 1)),
        }
    }
    let (dominant, frequency) = counts
        .into_iter()
        .max_by_key(|&(issue, n)| (n, base_severity(issue)))
        .unwrap_or((IssueType::Unknown, own_failures.len()));

    // Cross-agent view of the same issue type.
    let fleet_failures = collect_failures(&heartbeats::recent_all(pool, &since)?);
    let mut affected: Vec<&str> = fleet_failures
        .iter()
        .filter(|(_, m)| determine_issue_type(m) == dominant)
        .map(|(aid, _)| aid.as_str())
        .collect();
    affected.sort_unstable();
    affected.dedup();
    let affected_agents = affected.len().max(1);

    let evidence: Vec<String> = own_failures
        .iter()
        .filter(|(_, m)| determine_issue_type(m) == dominant)
        .take(5)
        .map(|(_, m)| m.clone())
        .collect();
    let total = own_failures.len();
    let confidence = (frequency as f64 / total as f64).clamp(0.3, 0.95);

    tracing::debug!(
        agent_id = %agent_id,
        issue = dominant.as_str(),
        frequency = frequency,
        affected_agents = affected_agents,
        "Diagnosed dominant issue from heartbeat logs"
    );

    Ok(Some(DiagnosisResult {
        agent_id: agent_id.to_string(),
        issue_type: dominant,
        severity: determine_severity(dominant, frequency, affected_agents),
        summary: summarize(dominant, frequency, affected_agents),
        recommended_actions: recommended_actions(dominant),
        confidence,
        evidence,
    }))
}

/// Returns the (older, newer) half averages when latency is trending up hard
/// enough to matter. Input is oldest-first.
fn latency_trend(durations_oldest_first: &[i64]) -> Option<(f64, f64)> {
    if durations_oldest_first.len() < 4 {
        return None;
    }
    let mid = durations_oldest_first.len() / 2;
    let (older, newer) = durations_oldest_first.split_at(mid);
    let avg = |xs: &[i64]| xs.iter().sum::<i64>() as f64 / xs.len() as f64;
    let (older_avg, newer_avg) = (avg(older), avg(newer));
    if newer_avg >= LATENCY_FLOOR_MS && newer_avg > older_avg * LATENCY_TREND_FACTOR {
        Some((older_avg, newer_avg))
    } else {
        None
    }
}

/// Pre-emptive scan for leading indicators when no explicit failure fired:
/// a rising latency trend, or a run of degraded heartbeats.
pub fn diagnose_potential_issues(
    pool: &DbPool,
    agent_id: &str,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<Option<DiagnosisResult>, AppError> {
    let since = (now - chrono::Duration::minutes(PREEMPTIVE_WINDOW_MINUTES)).to_rfc3339();
    let mut logs = heartbeats::recent_for_agent(pool, agent_id, &since)?;
    logs.truncate(PREEMPTIVE_SCAN_LOGS);
    logs.reverse(); // oldest first

    let durations: Vec<i64> = logs.iter().filter_map(|l| l.duration_ms).collect();
    if let Some((older_avg, newer_avg)) = latency_trend(&durations) {
        return Ok(Some(DiagnosisResult {
            agent_id: agent_id.to_string(),
            issue_type: IssueType::Connectivity,
            severity: IssueSeverity::Low,
            summary: format!(
                "heartbeat latency rising: {older_avg:.0}ms -> {newer_avg:.0}ms over the last {} runs",
                durations.len()
            ),
            recommended_actions: recommended_actions(IssueType::Connectivity),
            confidence: 0.4,
            evidence: vec![format!(
                "average duration_ms rose from {older_avg:.0} to {newer_avg:.0}"
            )],
        }));
    }

    let degraded: Vec<&crate::db::models::HeartbeatLog> = logs
        .iter()
        .filter(|l| l.result == HeartbeatResult::Degraded)
        .collect();
    if degraded.len() >= DEGRADED_COUNT_THRESHOLD {
        let evidence: Vec<String> = degraded
            .iter()
            .flat_map(|l| l.sub_results.iter())
            .filter(|s| !s.ok)
            .take(5)
            .map(|s| {
                format!(
                    "{}: {}",
                    s.step,
                    s.detail.as_deref().unwrap_or("no detail")
                )
            })
            .collect();
        return Ok(Some(DiagnosisResult {
            agent_id: agent_id.to_string(),
            issue_type: IssueType::Unknown,
            severity: IssueSeverity::Low,
            summary: format!(
                "{} of the last {} heartbeats degraded",
                degraded.len(),
                logs.len()
            ),
            recommended_actions: recommended_actions(IssueType::Unknown),
            confidence: 0.4,
            evidence,
        }));
    }

    Ok(None)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
