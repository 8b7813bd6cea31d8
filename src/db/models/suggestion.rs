use serde::{Deserialize, Serialize};
use ts_rs::TS;

// ============================================================================
// Suggestions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum SuggestionType {
    AutomateRecurringTask,
    ScheduleOptimization,
    BehaviorInsight,
    ErrorAlert,
    RelationshipNudge,
    SkillSuggestion,
    ReversePrompt,
}

impl SuggestionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionType::AutomateRecurringTask => "automate_recurring_task",
            SuggestionType::ScheduleOptimization => "schedule_optimization",
            SuggestionType::BehaviorInsight => "behavior_insight",
            SuggestionType::ErrorAlert => "error_alert",
            SuggestionType::RelationshipNudge => "relationship_nudge",
            SuggestionType::SkillSuggestion => "skill_suggestion",
            SuggestionType::ReversePrompt => "reverse_prompt",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "automate_recurring_task" => Some(SuggestionType::AutomateRecurringTask),
            "schedule_optimization" => Some(SuggestionType::ScheduleOptimization),
            "behavior_insight" => Some(SuggestionType::BehaviorInsight),
            "error_alert" => Some(SuggestionType::ErrorAlert),
            "relationship_nudge" => Some(SuggestionType::RelationshipNudge),
            "skill_suggestion" => Some(SuggestionType::SkillSuggestion),
            "reverse_prompt" => Some(SuggestionType::ReversePrompt),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum SuggestionPriority {
    Low,
    Medium,
    High,
    Urgent,
}

impl SuggestionPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionPriority::Low => "low",
            SuggestionPriority::Medium => "medium",
            SuggestionPriority::High => "high",
            SuggestionPriority::Urgent => "urgent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(SuggestionPriority::Low),
            "medium" => Some(SuggestionPriority::Medium),
            "high" => Some(SuggestionPriority::High),
            "urgent" => Some(SuggestionPriority::Urgent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum SuggestionStatus {
    Pending,
    Accepted,
    Dismissed,
    Expired,
}

impl SuggestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionStatus::Pending => "pending",
            SuggestionStatus::Accepted => "accepted",
            SuggestionStatus::Dismissed => "dismissed",
            SuggestionStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SuggestionStatus::Pending),
            "accepted" => Some(SuggestionStatus::Accepted),
            "dismissed" => Some(SuggestionStatus::Dismissed),
            "expired" => Some(SuggestionStatus::Expired),
            _ => None,
        }
    }
}

/// The concrete operator-facing action a suggestion proposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum SuggestedActionKind {
    CreateAutomation,
    AdjustSchedule,
    SendMessage,
    RunDiagnostic,
    AcquireSkill,
    AskUser,
    None,
}

impl SuggestedActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestedActionKind::CreateAutomation => "create_automation",
            SuggestedActionKind::AdjustSchedule => "adjust_schedule",
            SuggestedActionKind::SendMessage => "send_message",
            SuggestedActionKind::RunDiagnostic => "run_diagnostic",
            SuggestedActionKind::AcquireSkill => "acquire_skill",
            SuggestedActionKind::AskUser => "ask_user",
            SuggestedActionKind::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create_automation" => Some(SuggestedActionKind::CreateAutomation),
            "adjust_schedule" => Some(SuggestedActionKind::AdjustSchedule),
            "send_message" => Some(SuggestedActionKind::SendMessage),
            "run_diagnostic" => Some(SuggestedActionKind::RunDiagnostic),
            "acquire_skill" => Some(SuggestedActionKind::AcquireSkill),
            "ask_user" => Some(SuggestedActionKind::AskUser),
            "none" => Some(SuggestedActionKind::None),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Suggestion {
    pub id: String,
    pub agent_id: String,
    pub source_pattern_id: Option<String>,
    pub suggestion_type: SuggestionType,
    pub priority: SuggestionPriority,
    pub title: String,
    pub body: String,
    pub action_type: SuggestedActionKind,
    #[ts(type = "Record<string, unknown>")]
    pub action_params: serde_json::Value,
    pub confidence: f64,
    pub status: SuggestionStatus,
    pub created_at: String,
    pub expires_at: String,
    pub resolved_at: Option<String>,
}
