use serde::{Deserialize, Serialize};
use ts_rs::TS;

// ============================================================================
// Remediation actions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum ActionType {
    Retry,
    RefreshConnection,
    ClearCache,
    ResetState,
    UseFallback,
    NotifyAdmin,
    AutoRestart,
}

impl ActionType {
    pub const ALL: [ActionType; 7] = [
        ActionType::Retry,
        ActionType::RefreshConnection,
        ActionType::ClearCache,
        ActionType::ResetState,
        ActionType::UseFallback,
        ActionType::NotifyAdmin,
        ActionType::AutoRestart,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Retry => "retry",
            ActionType::RefreshConnection => "refresh_connection",
            ActionType::ClearCache => "clear_cache",
            ActionType::ResetState => "reset_state",
            ActionType::UseFallback => "use_fallback",
            ActionType::NotifyAdmin => "notify_admin",
            ActionType::AutoRestart => "auto_restart",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "retry" => Some(ActionType::Retry),
            "refresh_connection" => Some(ActionType::RefreshConnection),
            "clear_cache" => Some(ActionType::ClearCache),
            "reset_state" => Some(ActionType::ResetState),
            "use_fallback" => Some(ActionType::UseFallback),
            "notify_admin" => Some(ActionType::NotifyAdmin),
            "auto_restart" => Some(ActionType::AutoRestart),
            _ => None,
        }
    }
}

/// Risk classification driving the approval gate. Ordered: safe actions may
/// auto-execute, moderate actions need standing or explicit approval, risky
/// actions always need explicit approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum RiskLevel {
    Safe,
    Moderate,
    Risky,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Safe => "safe",
            RiskLevel::Moderate => "moderate",
            RiskLevel::Risky => "risky",
        }
    }
}

/// One resolved action instance inside a healing record: the registry
/// primitive plus concrete parameters for this occurrence.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct HealingAction {
    pub action_type: ActionType,
    #[ts(type = "Record<string, unknown>")]
    pub params: serde_json::Value,
}

impl HealingAction {
    pub fn new(action_type: ActionType, params: serde_json::Value) -> Self {
        Self { action_type, params }
    }
}

// ============================================================================
// Diagnosis
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum IssueType {
    Connectivity,
    RateLimit,
    StateCorruption,
    CapabilityGap,
    Unknown,
}

impl IssueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueType::Connectivity => "connectivity",
            IssueType::RateLimit => "rate_limit",
            IssueType::StateCorruption => "state_corruption",
            IssueType::CapabilityGap => "capability_gap",
            IssueType::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "connectivity" => Some(IssueType::Connectivity),
            "rate_limit" => Some(IssueType::RateLimit),
            "state_corruption" => Some(IssueType::StateCorruption),
            "capability_gap" => Some(IssueType::CapabilityGap),
            "unknown" => Some(IssueType::Unknown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum IssueSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl IssueSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueSeverity::Low => "low",
            IssueSeverity::Medium => "medium",
            IssueSeverity::High => "high",
            IssueSeverity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(IssueSeverity::Low),
            "medium" => Some(IssueSeverity::Medium),
            "high" => Some(IssueSeverity::High),
            "critical" => Some(IssueSeverity::Critical),
        _ => None,
        }
    }

    /// One step worse, saturating at critical.
    pub fn bumped(&self) -> Self {
        match self {
            IssueSeverity::Low => IssueSeverity::Medium,
            IssueSeverity::Medium => IssueSeverity::High,
            IssueSeverity::High | IssueSeverity::Critical => IssueSeverity::Critical,
        }
    }
}

/// Output of the diagnosis engine, persisted verbatim on the healing record.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct DiagnosisResult {
    pub agent_id: String,
    pub issue_type: IssueType,
    pub severity: IssueSeverity,
    pub summary: String,
    pub recommended_actions: Vec<HealingAction>,
    /// How sure the classifier is about the issue type, in [0,1].
    pub confidence: f64,
    /// Error signatures / log excerpts supporting the classification.
    pub evidence: Vec<String>,
}

// ============================================================================
// Healing record state machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum HealingStatus {
    Diagnosed,
    AwaitingApproval,
    AutoApproved,
    Executing,
    Succeeded,
    Failed,
    Escalated,
    Rejected,
}

impl HealingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealingStatus::Diagnosed => "diagnosed",
            HealingStatus::AwaitingApproval => "awaiting_approval",
            HealingStatus::AutoApproved => "auto_approved",
            HealingStatus::Executing => "executing",
            HealingStatus::Succeeded => "succeeded",
            HealingStatus::Failed => "failed",
            HealingStatus::Escalated => "escalated",
            HealingStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "diagnosed" => Some(HealingStatus::Diagnosed),
            "awaiting_approval" => Some(HealingStatus::AwaitingApproval),
            "auto_approved" => Some(HealingStatus::AutoApproved),
            "executing" => Some(HealingStatus::Executing),
            "succeeded" => Some(HealingStatus::Succeeded),
            "failed" => Some(HealingStatus::Failed),
            "escalated" => Some(HealingStatus::Escalated),
            "rejected" => Some(HealingStatus::Rejected),
            _ => None,
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HealingStatus::Succeeded | HealingStatus::Escalated | HealingStatus::Rejected
        )
    }
}

/// Outcome tag for one audit-trail entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum AuditOutcome {
    Started,
    Succeeded,
    Failed,
    Skipped,
    ApprovalRequested,
    Approved,
    Rejected,
    Escalated,
    Rediagnosed,
    SelfResolved,
}

/// One ordered entry in a healing record's audit trail. Every state-machine
/// advance appends here before the status changes.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct AuditEntry {
    pub action: Option<ActionType>,
    pub outcome: AuditOutcome,
    pub detail: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct HealingRecord {
    pub id: String,
    pub agent_id: String,
    pub issue_type: IssueType,
    pub severity: IssueSeverity,
    pub diagnosis: DiagnosisResult,
    /// Priority-ordered candidate actions with resolved params.
    pub actions: Vec<HealingAction>,
    /// Index into `actions` of the next/currently executing candidate.
    pub current_action: i64,
    pub status: HealingStatus,
    pub attempt_count: i64,
    pub audit_trail: Vec<AuditEntry>,
    pub approved_at: Option<String>,
    pub resolved_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl HealingRecord {
    /// The action the record is waiting on or about to execute, if any.
    pub fn pending_action(&self) -> Option<&HealingAction> {
        self.actions.get(self.current_action as usize)
    }
}

// ============================================================================
// Healing outcome stats
// ============================================================================

/// Aggregated success/failure counts per (issue type, action), feeding the
/// historical half of action prioritization.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct HealingStat {
    pub issue_type: IssueType,
    pub action_type: ActionType,
    pub success_count: i64,
    pub failure_count: i64,
    pub last_outcome_at: String,
}

impl HealingStat {
    /// Observed success share; `None` until at least one outcome exists.
    pub fn success_rate(&self) -> Option<f64> {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            return None;
        }
        Some(self.success_count as f64 / total as f64)
    }
}
