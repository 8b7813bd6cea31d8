//! Suggestion generator: converts fired patterns and diagnoses into
//! operator-facing suggestion drafts, then batch-persists them under dedup,
//! cooldown, and volume caps.
//!
//! The `generate_*` builders are pure; only [`generate_batch_suggestions`]
//! touches the store. Publishing feed events for the persisted rows is the
//! orchestrator's job.

use chrono::{DateTime, Duration, Timelike, Utc};
use serde_json::json;

use crate::db::models::{
    AgentStats, DiagnosisResult, IssueSeverity, Pattern, PatternType, SuggestedActionKind,
    Suggestion, SuggestionPriority, SuggestionStatus, SuggestionType,
};
use crate::config::EngineConfig;
use crate::db::repos::suggestions as suggestion_repo;
use crate::db::DbPool;
use crate::error::AppError;

/// Pattern confidence required before a full suggestion is produced.
pub const SUGGESTION_CONFIDENCE_THRESHOLD: f64 = 0.7;
/// Lower bound of the mid-confidence band that yields a reverse prompt
/// instead of a suggestion.
pub const REVERSE_PROMPT_MIN_CONFIDENCE: f64 = 0.5;
/// Minimum gap between two suggestions derived from the same pattern.
pub const SUGGESTION_COOLDOWN_MINUTES: i64 = 60;
/// At most this many new suggestions per generation cycle per agent.
pub const MAX_SUGGESTIONS_PER_CYCLE: usize = 3;
/// Hard ceiling on unresolved suggestions per agent.
pub const MAX_PENDING_PER_AGENT: i64 = 20;

/// Volume and cooldown knobs for one generation cycle. The orchestrator
/// builds this from [`EngineConfig`]; [`Default`] mirrors the shipped config
/// defaults for direct callers and tests.
#[derive(Debug, Clone, Copy)]
pub struct BatchLimits {
    pub per_cycle: usize,
    pub max_pending: i64,
    pub cooldown_minutes: i64,
}

impl BatchLimits {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            per_cycle: config.suggestions_per_cycle,
            max_pending: config.max_pending_suggestions as i64,
            cooldown_minutes: config.suggestion_cooldown_minutes,
        }
    }
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            per_cycle: MAX_SUGGESTIONS_PER_CYCLE,
            max_pending: MAX_PENDING_PER_AGENT,
            cooldown_minutes: SUGGESTION_COOLDOWN_MINUTES,
        }
    }
}
/// Days without interaction before a quiet-agent nudge.
pub const QUIET_DAYS_FOR_NUDGE: i64 = 5;
/// Share of a milestone at which the approach nudge fires.
pub const MILESTONE_APPROACH_RATIO: f64 = 0.9;

/// How long each suggestion type stays actionable before expiry.
pub fn expiry_hours(suggestion_type: SuggestionType) -> i64 {
    match suggestion_type {
        SuggestionType::ErrorAlert => 24,
        SuggestionType::SkillSuggestion => 72,
        SuggestionType::RelationshipNudge => 168,
        _ => 48,
    }
}

/// Priority scales with confidence; severity overrides come from the error
/// alert path.
pub fn priority_for_confidence(confidence: f64) -> SuggestionPriority {
    if confidence >= 0.9 {
        SuggestionPriority::High
    } else if confidence >= SUGGESTION_CONFIDENCE_THRESHOLD {
        SuggestionPriority::Medium
    } else {
        SuggestionPriority::Low
    }
}

fn draft(
    agent_id: &str,
    source_pattern_id: Option<&str>,
    suggestion_type: SuggestionType,
    priority: SuggestionPriority,
    title: String,
    body: String,
    action_type: SuggestedActionKind,
    action_params: serde_json::Value,
    confidence: f64,
    now: DateTime<Utc>,
) -> Suggestion {
    Suggestion {
        id: uuid::Uuid::new_v4().to_string(),
        agent_id: agent_id.to_string(),
        source_pattern_id: source_pattern_id.map(|s| s.to_string()),
        suggestion_type,
        priority,
        title,
        body,
        action_type,
        action_params,
        confidence,
        status: SuggestionStatus::Pending,
        created_at: now.to_rfc3339(),
        expires_at: (now + Duration::hours(expiry_hours(suggestion_type))).to_rfc3339(),
        resolved_at: None,
    }
}

fn humanize(group_key: &str) -> String {
    group_key.replace('_', " ")
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// Main pattern-to-suggestion dispatch. Returns `None` below the confidence
/// bar; the caller may fall back to [`generate_reverse_prompt`].
pub fn generate_from_pattern(pattern: &Pattern, now: DateTime<Utc>) -> Option<Suggestion> {
    if pattern.confidence < SUGGESTION_CONFIDENCE_THRESHOLD {
        return None;
    }
    let priority = priority_for_confidence(pattern.confidence);
    let topic = humanize(&pattern.group_key);

    let suggestion = match pattern.pattern_type {
        PatternType::RecurringTask => {
            let hour = DateTime::parse_from_rfc3339(&pattern.last_observed_at)
                .map(|d| d.with_timezone(&Utc).hour())
                .unwrap_or(9);
            draft(
                &pattern.agent_id,
                Some(&pattern.id),
                SuggestionType::AutomateRecurringTask,
                priority,
                format!("Automate \"{topic}\""),
                format!(
                    "\"{topic}\" came up {} times. Want a standing automation for it?",
                    pattern.observation_count
                ),
                SuggestedActionKind::CreateAutomation,
                json!({
                    "task_title": pattern.group_key,
                    "cron": format!("0 {hour} * * *"),
                }),
                pattern.confidence,
                now,
            )
        }
        PatternType::TimePreference => draft(
            &pattern.agent_id,
            Some(&pattern.id),
            SuggestionType::ScheduleOptimization,
            priority,
            "Shift work into your active hours".to_string(),
            format!(
                "Most activity lands in the {topic} slot ({} observations). Scheduled jobs could move there.",
                pattern.observation_count
            ),
            SuggestedActionKind::AdjustSchedule,
            json!({ "bucket": pattern.group_key }),
            pattern.confidence,
            now,
        ),
        PatternType::UserBehavior => draft(
            &pattern.agent_id,
            Some(&pattern.id),
            SuggestionType::BehaviorInsight,
            priority,
            format!("Recurring theme: {topic}"),
            format!(
                "The \"{topic}\" theme recurred {} times; worth folding into the agent profile.",
                pattern.observation_count
            ),
            SuggestedActionKind::None,
            json!({ "group": pattern.group_key }),
            pattern.confidence,
            now,
        ),
        PatternType::ErrorPattern => draft(
            &pattern.agent_id,
            Some(&pattern.id),
            SuggestionType::ErrorAlert,
            priority,
            format!("Repeated failure: {topic}"),
            format!(
                "The same failure signature appeared {} times. A diagnostic run can pin it down.",
                pattern.observation_count
            ),
            SuggestedActionKind::RunDiagnostic,
            json!({ "signature": pattern.group_key }),
            pattern.confidence,
            now,
        ),
        PatternType::RelationshipMilestone => draft(
            &pattern.agent_id,
            Some(&pattern.id),
            SuggestionType::RelationshipNudge,
            priority,
            format!("Milestone reached: {topic}"),
            format!("You crossed {topic} together. A thank-you note may land well."),
            SuggestedActionKind::SendMessage,
            json!({ "milestone": pattern.group_key }),
            pattern.confidence,
            now,
        ),
        PatternType::SkillGap => return generate_skill_suggestion(pattern, now),
    };
    Some(suggestion)
}

/// Mid-confidence band: instead of a half-certain suggestion, ask the user
/// whether the hunch is right.
pub fn generate_reverse_prompt(pattern: &Pattern, now: DateTime<Utc>) -> Option<Suggestion> {
    if pattern.confidence < REVERSE_PROMPT_MIN_CONFIDENCE
        || pattern.confidence >= SUGGESTION_CONFIDENCE_THRESHOLD
    {
        return None;
    }
    let topic = humanize(&pattern.group_key);
    Some(draft(
        &pattern.agent_id,
        Some(&pattern.id),
        SuggestionType::ReversePrompt,
        SuggestionPriority::Low,
        format!("Am I seeing a pattern in \"{topic}\"?"),
        format!(
            "\"{topic}\" showed up {} times ({} confidence {:.0}%). Is this something to track?",
            pattern.observation_count,
            pattern.pattern_type.as_str(),
            pattern.confidence * 100.0
        ),
        SuggestedActionKind::AskUser,
        json!({ "pattern_id": pattern.id, "group": pattern.group_key }),
        pattern.confidence,
        now,
    ))
}

/// Stats-driven nudge: a quiet agent or an approaching interaction milestone.
/// Milestones actually crossed arrive via the pattern path instead.
pub fn generate_relationship_nudge(
    agent_id: &str,
    stats: &AgentStats,
    now: DateTime<Utc>,
) -> Option<Suggestion> {
    if let Some(last) = stats
        .last_interaction_at
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
    {
        let quiet_days = (now - last.with_timezone(&Utc)).num_days();
        if quiet_days >= QUIET_DAYS_FOR_NUDGE {
            return Some(draft(
                agent_id,
                None,
                SuggestionType::RelationshipNudge,
                SuggestionPriority::Low,
                "It has been a while".to_string(),
                format!("{quiet_days} days since the last interaction. A check-in may help."),
                SuggestedActionKind::SendMessage,
                json!({ "quiet_days": quiet_days }),
                0.75,
                now,
            ));
        }
    }

    for milestone in crate::engine::patterns::INTERACTION_MILESTONES {
        let approach = (milestone as f64 * MILESTONE_APPROACH_RATIO).ceil() as i64;
        if stats.total_interactions >= approach && stats.total_interactions < milestone {
            return Some(draft(
                agent_id,
                None,
                SuggestionType::RelationshipNudge,
                SuggestionPriority::Low,
                format!("Almost at {milestone} interactions"),
                format!(
                    "{} of {milestone} interactions so far. Something to mark when it lands?",
                    stats.total_interactions
                ),
                SuggestedActionKind::SendMessage,
                json!({ "milestone": milestone, "current": stats.total_interactions }),
                0.75,
                now,
            ));
        }
    }
    None
}

/// Diagnosis-driven alert. Severity, not confidence, sets the priority here;
/// a critical issue is urgent even when the classifier is unsure.
pub fn generate_error_alert(
    agent_id: &str,
    diagnosis: &DiagnosisResult,
    now: DateTime<Utc>,
) -> Suggestion {
    let priority = match diagnosis.severity {
        IssueSeverity::Critical => SuggestionPriority::Urgent,
        IssueSeverity::High => SuggestionPriority::High,
        IssueSeverity::Medium => SuggestionPriority::Medium,
        IssueSeverity::Low => SuggestionPriority::Low,
    };
    let recommended = diagnosis
        .recommended_actions
        .first()
        .map(|a| a.action_type.as_str())
        .unwrap_or("none");
    draft(
        agent_id,
        None,
        SuggestionType::ErrorAlert,
        priority,
        format!(
            "{} issue detected ({})",
            diagnosis.issue_type.as_str(),
            diagnosis.severity.as_str()
        ),
        diagnosis.summary.clone(),
        SuggestedActionKind::RunDiagnostic,
        json!({
            "issue_type": diagnosis.issue_type.as_str(),
            "severity": diagnosis.severity.as_str(),
            "recommended_action": recommended,
            "evidence": diagnosis.evidence,
        }),
        diagnosis.confidence,
        now,
    )
}

/// Skill-gap pattern to acquisition proposal.
pub fn generate_skill_suggestion(pattern: &Pattern, now: DateTime<Utc>) -> Option<Suggestion> {
    if pattern.pattern_type != PatternType::SkillGap
        || pattern.confidence < SUGGESTION_CONFIDENCE_THRESHOLD
    {
        return None;
    }
    let capability = pattern
        .group_key
        .strip_prefix("skill_")
        .unwrap_or(&pattern.group_key);
    Some(draft(
        &pattern.agent_id,
        Some(&pattern.id),
        SuggestionType::SkillSuggestion,
        priority_for_confidence(pattern.confidence),
        format!("Missing capability: {}", humanize(capability)),
        format!(
            "{} attempts needed \"{}\" and could not proceed. Adding that capability unblocks them.",
            pattern.observation_count,
            humanize(capability)
        ),
        SuggestedActionKind::AcquireSkill,
        json!({ "capability": capability }),
        pattern.confidence,
        now,
    ))
}

// ---------------------------------------------------------------------------
// Batch persistence
// ---------------------------------------------------------------------------

/// Filter a cycle's candidate drafts through dedup, per-pattern cooldown, and
/// volume caps, then persist the survivors. Returns the rows actually written,
/// highest priority first.
pub fn generate_batch_suggestions(
    pool: &DbPool,
    agent_id: &str,
    mut candidates: Vec<Suggestion>,
    limits: BatchLimits,
    now: DateTime<Utc>,
) -> Result<Vec<Suggestion>, AppError> {
    if candidates.is_empty() {
        return Ok(vec![]);
    }

    let pending = suggestion_repo::count_pending(pool, agent_id)?;
    if pending >= limits.max_pending {
        tracing::debug!(
            agent_id = %agent_id,
            pending,
            "Suggestion backlog full, dropping cycle candidates"
        );
        return Ok(vec![]);
    }
    let headroom = (limits.max_pending - pending) as usize;

    let existing = suggestion_repo::get_pending(pool, agent_id)?;
    candidates.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal))
    });

    let mut persisted = Vec::new();
    let mut taken_keys: Vec<(SuggestionType, Option<String>)> = Vec::new();

    for candidate in candidates {
        if persisted.len() >= limits.per_cycle.min(headroom) {
            break;
        }

        let key = (candidate.suggestion_type, candidate.source_pattern_id.clone());
        if taken_keys.contains(&key) {
            continue;
        }

        // An open suggestion of the same type for the same pattern (or with
        // the same title, for stats-driven ones) makes this a duplicate.
        let duplicate = existing.iter().any(|s| {
            s.suggestion_type == candidate.suggestion_type
                && match (&s.source_pattern_id, &candidate.source_pattern_id) {
                    (Some(a), Some(b)) => a == b,
                    (None, None) => s.title == candidate.title,
                    _ => false,
                }
        });
        if duplicate {
            continue;
        }

        if let Some(pattern_id) = candidate.source_pattern_id.as_deref() {
            if let Some(latest) = suggestion_repo::latest_for_pattern(pool, pattern_id)? {
                if let Ok(latest) = DateTime::parse_from_rfc3339(&latest) {
                    if now - latest.with_timezone(&Utc)
                        < Duration::minutes(limits.cooldown_minutes)
                    {
                        continue;
                    }
                }
            }
        }

        suggestion_repo::insert(pool, &candidate)?;
        tracing::info!(
            agent_id = %agent_id,
            suggestion_type = candidate.suggestion_type.as_str(),
            priority = candidate.priority.as_str(),
            title = %candidate.title,
            "Suggestion created"
        );
        taken_keys.push(key);
        persisted.push(candidate);
    }

    Ok(persisted)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
