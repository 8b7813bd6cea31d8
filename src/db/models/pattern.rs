use serde::{Deserialize, Serialize};
use ts_rs::TS;

// ============================================================================
// Pattern type & declarative detection rules
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum PatternType {
    RecurringTask,
    TimePreference,
    UserBehavior,
    ErrorPattern,
    RelationshipMilestone,
    SkillGap,
}

impl PatternType {
    pub const ALL: [PatternType; 6] = [
        PatternType::RecurringTask,
        PatternType::TimePreference,
        PatternType::UserBehavior,
        PatternType::ErrorPattern,
        PatternType::RelationshipMilestone,
        PatternType::SkillGap,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PatternType::RecurringTask => "recurring_task",
            PatternType::TimePreference => "time_preference",
            PatternType::UserBehavior => "user_behavior",
            PatternType::ErrorPattern => "error_pattern",
            PatternType::RelationshipMilestone => "relationship_milestone",
            PatternType::SkillGap => "skill_gap",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "recurring_task" => Some(PatternType::RecurringTask),
            "time_preference" => Some(PatternType::TimePreference),
            "user_behavior" => Some(PatternType::UserBehavior),
            "error_pattern" => Some(PatternType::ErrorPattern),
            "relationship_milestone" => Some(PatternType::RelationshipMilestone),
            "skill_gap" => Some(PatternType::SkillGap),
            _ => None,
        }
    }
}

/// Lifecycle event kinds the trigger evaluator understands. `Scheduled` marks
/// contexts synthesized by the heartbeat timer rather than a live event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum TriggerEventType {
    ConversationComplete,
    TaskComplete,
    WorkflowComplete,
    MemorySaved,
    LearningCreated,
    Scheduled,
}

impl TriggerEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerEventType::ConversationComplete => "conversation_complete",
            TriggerEventType::TaskComplete => "task_complete",
            TriggerEventType::WorkflowComplete => "workflow_complete",
            TriggerEventType::MemorySaved => "memory_saved",
            TriggerEventType::LearningCreated => "learning_created",
            TriggerEventType::Scheduled => "scheduled",
        }
    }
}

/// Comparison operators for declarative conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum ConditionOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    NotContains,
    Exists,
    NotExists,
}

/// One declarative condition over a context/payload field.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Condition {
    /// Field path into the trigger context payload (e.g. "task_title",
    /// "stats.success_rate").
    pub field: String,
    pub op: ConditionOp,
    #[ts(type = "unknown")]
    pub value: serde_json::Value,
}

/// Stats metrics a threshold trigger may compare against. Evaluated purely
/// from the snapshot embedded in the trigger context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum StatsMetric {
    SuccessRate,
    FailedTasks,
    FailedWorkflows,
    TotalInteractions,
    PendingSuggestions,
}

impl StatsMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatsMetric::SuccessRate => "success_rate",
            StatsMetric::FailedTasks => "failed_tasks",
            StatsMetric::FailedWorkflows => "failed_workflows",
            StatsMetric::TotalInteractions => "total_interactions",
            StatsMetric::PendingSuggestions => "pending_suggestions",
        }
    }
}

/// What fires a pattern: a matching live event, a due cron schedule, or a
/// stats metric crossing a threshold.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[ts(export)]
pub enum TriggerRule {
    Event { event_type: TriggerEventType },
    Schedule { cron: String },
    Threshold { metric: StatsMetric, op: ConditionOp, value: f64 },
}

/// Declarative detection rules attached to a pattern, stored as JSON.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ConditionRules {
    pub trigger: TriggerRule,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub cooldown_minutes: i64,
}

// ============================================================================
// Pattern
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Pattern {
    pub id: String,
    pub agent_id: String,
    pub pattern_type: PatternType,
    /// Grouping/similarity key: normalized task title + weekday, hour bucket,
    /// error signature, milestone value, etc.
    pub group_key: String,
    pub condition_rules: ConditionRules,
    /// In [0,1]; updated only via exponential smoothing.
    pub confidence: f64,
    pub observation_count: i64,
    pub active: bool,
    pub last_observed_at: String,
    pub last_triggered_at: Option<String>,
    pub expires_at: String,
    pub created_at: String,
    pub updated_at: String,
}
