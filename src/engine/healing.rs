//! Healing executor: drives a [`HealingRecord`] through its state machine.
//!
//! One open record exists per (agent, issue type); a re-diagnosis while one
//! is open merges into it instead of duplicating. Safe actions auto-execute
//! down the prioritized chain, moderate actions need standing or explicit
//! approval, risky actions always wait for an operator. Every advance appends
//! to the audit trail before the status changes, and exhausting the chain
//! escalates with a `notify_admin` append.
//!
//! `attempt_count` on the record counts diagnosis rounds folded into it;
//! per-action invocation attempts are derived from `Started` audit entries.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use crate::config::EngineConfig;
use crate::db::models::{
    ActionType, AuditEntry, AuditOutcome, DiagnosisResult, HealingAction, HealingRecord,
    HealingStatus, RiskLevel,
};
use crate::db::repos::{healing as healing_repo, heartbeats as heartbeat_repo};
use crate::db::DbPool;
use crate::engine::runtime::{ActionOutcome, AgentRuntime};
use crate::engine::{diagnosis, registry};
use crate::error::AppError;

/// An `awaiting_approval` record with no new failure signal for this long is
/// considered self-resolved.
pub const SELF_RESOLVE_QUIET_MINUTES: i64 = 30;
/// An `executing` non-idempotent action with no completion signal for this
/// long is written off as failed.
pub const EXECUTING_STALE_MINUTES: i64 = 10;

pub struct HealingExecutor {
    pool: DbPool,
    config: EngineConfig,
    runtime: Arc<dyn AgentRuntime>,
}

/// Invocations of one action so far in this record's lifetime.
fn attempts_of(record: &HealingRecord, action_type: ActionType) -> i64 {
    record
        .audit_trail
        .iter()
        .filter(|e| e.action == Some(action_type) && e.outcome == AuditOutcome::Started)
        .count() as i64
}

fn audit(action: Option<ActionType>, outcome: AuditOutcome, detail: impl Into<String>) -> AuditEntry {
    AuditEntry {
        action,
        outcome,
        detail: Some(detail.into()),
        timestamp: Utc::now().to_rfc3339(),
    }
}

impl HealingExecutor {
    pub fn new(pool: DbPool, config: EngineConfig, runtime: Arc<dyn AgentRuntime>) -> Self {
        Self {
            pool,
            config,
            runtime,
        }
    }

    // -----------------------------------------------------------------------
    // Session lifecycle
    // -----------------------------------------------------------------------

    /// Open a healing session from a diagnosis, or fold the diagnosis into
    /// the already-open record for the same (agent, issue type). The new or
    /// merged record is driven as far as the approval gates allow before it
    /// is returned.
    pub async fn start_healing_session(
        &self,
        diagnosis: DiagnosisResult,
    ) -> Result<HealingRecord, AppError> {
        let mut actions: Vec<HealingAction> = diagnosis
            .recommended_actions
            .iter()
            .filter(|a| match registry::validate(a) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(
                        agent_id = %diagnosis.agent_id,
                        action = a.action_type.as_str(),
                        error = %e,
                        "Dropping invalid recommended action"
                    );
                    false
                }
            })
            .cloned()
            .collect();
        if actions.is_empty() {
            return Err(AppError::Validation(
                "Diagnosis carries no valid remediation actions".into(),
            ));
        }

        let stats = healing_repo::get_stats_for_issue(&self.pool, diagnosis.issue_type)?;
        registry::prioritize_actions(&mut actions, &stats);

        if let Some(open) =
            healing_repo::get_open_for(&self.pool, &diagnosis.agent_id, diagnosis.issue_type)?
        {
            return self.merge_into_open(open, diagnosis).await;
        }

        let now = Utc::now().to_rfc3339();
        let mut record = HealingRecord {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: diagnosis.agent_id.clone(),
            issue_type: diagnosis.issue_type,
            severity: diagnosis.severity,
            diagnosis,
            actions,
            current_action: 0,
            status: HealingStatus::Diagnosed,
            attempt_count: 1,
            audit_trail: vec![],
            approved_at: None,
            resolved_at: None,
            created_at: now.clone(),
            updated_at: now,
        };

        match healing_repo::insert(&self.pool, &record) {
            Ok(()) => {}
            Err(AppError::ConcurrencyConflict(_)) => {
                // Another writer opened a record for the same key first.
                let open =
                    healing_repo::get_open_for(&self.pool, &record.agent_id, record.issue_type)?
                        .ok_or_else(|| {
                            AppError::Internal("Open healing record vanished during merge".into())
                        })?;
                return self.merge_into_open(open, record.diagnosis).await;
            }
            Err(e) => return Err(e),
        }

        tracing::info!(
            agent_id = %record.agent_id,
            issue_type = record.issue_type.as_str(),
            severity = record.severity.as_str(),
            candidates = record.actions.len(),
            "Healing session opened"
        );
        self.drive(&mut record, false).await?;
        Ok(record)
    }

    async fn merge_into_open(
        &self,
        mut open: HealingRecord,
        diagnosis: DiagnosisResult,
    ) -> Result<HealingRecord, AppError> {
        open.attempt_count += 1;
        if diagnosis.severity > open.severity {
            open.severity = diagnosis.severity;
        }
        open.audit_trail.push(audit(
            None,
            AuditOutcome::Rediagnosed,
            format!(
                "round {}: {} (severity {})",
                open.attempt_count,
                diagnosis.summary,
                diagnosis.severity.as_str()
            ),
        ));
        open.diagnosis = diagnosis;
        open.updated_at = Utc::now().to_rfc3339();
        healing_repo::update(&self.pool, &open)?;
        tracing::debug!(
            record_id = %open.id,
            attempt_count = open.attempt_count,
            "Diagnosis merged into open healing record"
        );

        // A freshly diagnosed record may still have executable candidates.
        if open.status == HealingStatus::Diagnosed {
            self.drive(&mut open, false).await?;
        }
        Ok(open)
    }

    /// Known failure signature: skip the full diagnosis and open a session
    /// with the mapped single remediation.
    pub async fn quick_heal(
        &self,
        agent_id: &str,
        signature: &str,
    ) -> Result<HealingRecord, AppError> {
        let (issue_type, action) = diagnosis::known_signature(signature).ok_or_else(|| {
            AppError::Validation(format!("Unknown quick-heal signature '{signature}'"))
        })?;
        let diagnosis = DiagnosisResult {
            agent_id: agent_id.to_string(),
            issue_type,
            severity: diagnosis::base_severity(issue_type),
            summary: format!("Known signature '{signature}'"),
            recommended_actions: vec![action],
            confidence: 0.75,
            evidence: vec![signature.to_string()],
        };
        self.start_healing_session(diagnosis).await
    }

    // -----------------------------------------------------------------------
    // Operator surface
    // -----------------------------------------------------------------------

    /// Approve the pending action. Replays and races are idempotent: any
    /// record not sitting in `awaiting_approval` is returned unchanged.
    pub async fn approve(&self, record_id: &str) -> Result<HealingRecord, AppError> {
        let mut record = healing_repo::get_by_id(&self.pool, record_id)?;
        if record.status != HealingStatus::AwaitingApproval {
            return Ok(record);
        }
        let action = record
            .pending_action()
            .map(|a| a.action_type)
            .ok_or_else(|| AppError::Internal("Awaiting approval with no pending action".into()))?;
        record.approved_at = Some(Utc::now().to_rfc3339());
        record
            .audit_trail
            .push(audit(Some(action), AuditOutcome::Approved, "operator approval"));
        record.status = HealingStatus::AutoApproved;
        healing_repo::update(&self.pool, &record)?;
        self.drive(&mut record, true).await?;
        Ok(record)
    }

    /// Reject the pending action and close the record. Idempotent the same
    /// way as [`Self::approve`]: a second rejection returns the record as-is
    /// without touching the audit trail.
    pub async fn reject(
        &self,
        record_id: &str,
        reason: Option<&str>,
    ) -> Result<HealingRecord, AppError> {
        let mut record = healing_repo::get_by_id(&self.pool, record_id)?;
        if record.status != HealingStatus::AwaitingApproval {
            return Ok(record);
        }
        let action = record.pending_action().map(|a| a.action_type);
        let now = Utc::now().to_rfc3339();
        record.audit_trail.push(audit(
            action,
            AuditOutcome::Rejected,
            reason.unwrap_or("rejected by operator"),
        ));
        record.status = HealingStatus::Rejected;
        record.resolved_at = Some(now.clone());
        record.updated_at = now;
        healing_repo::update(&self.pool, &record)?;
        tracing::info!(record_id = %record.id, "Healing record rejected");
        Ok(record)
    }

    pub fn get_healing_status(&self, record_id: &str) -> Result<HealingRecord, AppError> {
        healing_repo::get_by_id(&self.pool, record_id)
    }

    pub fn get_active_healing_sessions(
        &self,
        agent_id: Option<&str>,
    ) -> Result<Vec<HealingRecord>, AppError> {
        healing_repo::get_active(&self.pool, agent_id)
    }

    // -----------------------------------------------------------------------
    // State machine core
    // -----------------------------------------------------------------------

    /// Advance the record until it is terminal, waiting on approval, or
    /// waiting on an in-progress action. `approval_granted` lets one gated
    /// action through (the one the operator just approved).
    async fn drive(
        &self,
        record: &mut HealingRecord,
        mut approval_granted: bool,
    ) -> Result<(), AppError> {
        loop {
            if record.status.is_terminal() {
                return Ok(());
            }
            let Some(action) = record.pending_action().cloned() else {
                return self.escalate(record).await;
            };
            let spec = registry::spec(action.action_type);
            let attempts = attempts_of(record, action.action_type);

            if attempts >= spec.max_attempts {
                record.audit_trail.push(audit(
                    Some(action.action_type),
                    AuditOutcome::Skipped,
                    format!("attempt budget exhausted ({attempts}/{})", spec.max_attempts),
                ));
                record.current_action += 1;
                record.updated_at = Utc::now().to_rfc3339();
                healing_repo::update(&self.pool, record)?;
                continue;
            }

            let auto = registry::can_execute_without_approval(action.action_type, attempts);
            let standing = self.config.auto_approve_moderate && spec.risk == RiskLevel::Moderate;
            if !(auto || standing || approval_granted) {
                record.status = HealingStatus::AwaitingApproval;
                record.audit_trail.push(audit(
                    Some(action.action_type),
                    AuditOutcome::ApprovalRequested,
                    format!("{} risk, operator approval required", spec.risk.as_str()),
                ));
                record.updated_at = Utc::now().to_rfc3339();
                healing_repo::update(&self.pool, record)?;
                tracing::info!(
                    record_id = %record.id,
                    action = action.action_type.as_str(),
                    "Healing paused for approval"
                );
                return Ok(());
            }
            if approval_granted {
                approval_granted = false;
            } else if standing && !auto {
                record.audit_trail.push(audit(
                    Some(action.action_type),
                    AuditOutcome::Approved,
                    "standing approval for moderate-risk actions",
                ));
            }

            if !self.execute_current(record, &action).await? {
                // In progress; resume on a later poll.
                return Ok(());
            }
        }
    }

    /// Run the pending action once. Returns `false` when the action is still
    /// in progress and the drive loop must yield.
    async fn execute_current(
        &self,
        record: &mut HealingRecord,
        action: &HealingAction,
    ) -> Result<bool, AppError> {
        record.status = HealingStatus::Executing;
        record.audit_trail.push(audit(
            Some(action.action_type),
            AuditOutcome::Started,
            action.params.to_string(),
        ));
        record.updated_at = Utc::now().to_rfc3339();
        healing_repo::update(&self.pool, record)?;

        let outcome = self
            .runtime
            .execute_action(&record.agent_id, action)
            .await
            .unwrap_or_else(|e| ActionOutcome::Failed(format!("runtime unavailable: {e}")));
        self.apply_outcome(record, action, outcome)
    }

    /// Fold one runtime outcome into the record. Shared by the drive loop,
    /// the executing-poll, and restart recovery.
    fn apply_outcome(
        &self,
        record: &mut HealingRecord,
        action: &HealingAction,
        outcome: ActionOutcome,
    ) -> Result<bool, AppError> {
        let now = Utc::now().to_rfc3339();
        match outcome {
            ActionOutcome::Resolved(detail) => {
                record
                    .audit_trail
                    .push(audit(Some(action.action_type), AuditOutcome::Succeeded, detail));
                record.status = HealingStatus::Succeeded;
                record.resolved_at = Some(now.clone());
                record.updated_at = now;
                healing_repo::update(&self.pool, record)?;
                healing_repo::record_outcome(&self.pool, record.issue_type, action.action_type, true)?;
                tracing::info!(
                    record_id = %record.id,
                    action = action.action_type.as_str(),
                    "Healing succeeded"
                );
                Ok(true)
            }
            ActionOutcome::InProgress(detail) => {
                tracing::debug!(
                    record_id = %record.id,
                    action = action.action_type.as_str(),
                    detail = %detail,
                    "Healing action in progress"
                );
                Ok(false)
            }
            ActionOutcome::Failed(detail) => {
                record
                    .audit_trail
                    .push(audit(Some(action.action_type), AuditOutcome::Failed, detail));
                record.status = HealingStatus::Failed;
                record.current_action += 1;
                record.updated_at = now;
                healing_repo::update(&self.pool, record)?;
                healing_repo::record_outcome(&self.pool, record.issue_type, action.action_type, false)?;
                Ok(true)
            }
        }
    }

    /// Candidate list exhausted: notify an admin and close as escalated. The
    /// notification is itself a registry action, so its outcome lands in the
    /// audit trail and the stats like any other.
    async fn escalate(&self, record: &mut HealingRecord) -> Result<(), AppError> {
        let notify = HealingAction::new(
            ActionType::NotifyAdmin,
            json!({
                "message": format!(
                    "Healing for {} on agent {} exhausted all candidates: {}",
                    record.issue_type.as_str(),
                    record.agent_id,
                    record.diagnosis.summary
                ),
                "severity": record.severity.as_str(),
            }),
        );
        record.actions.push(notify.clone());
        record.current_action = record.actions.len() as i64 - 1;
        record.audit_trail.push(audit(
            Some(ActionType::NotifyAdmin),
            AuditOutcome::Started,
            "escalation notice",
        ));

        let outcome = self
            .runtime
            .execute_action(&record.agent_id, &notify)
            .await
            .unwrap_or_else(|e| ActionOutcome::Failed(format!("runtime unavailable: {e}")));
        let (entry_outcome, detail, notified) = match outcome {
            ActionOutcome::Resolved(d) | ActionOutcome::InProgress(d) => {
                (AuditOutcome::Succeeded, d, true)
            }
            ActionOutcome::Failed(d) => (AuditOutcome::Failed, d, false),
        };
        record
            .audit_trail
            .push(audit(Some(ActionType::NotifyAdmin), entry_outcome, detail));
        healing_repo::record_outcome(&self.pool, record.issue_type, ActionType::NotifyAdmin, notified)?;

        let now = Utc::now().to_rfc3339();
        record.audit_trail.push(audit(
            None,
            AuditOutcome::Escalated,
            "all remediation candidates exhausted",
        ));
        record.status = HealingStatus::Escalated;
        record.resolved_at = Some(now.clone());
        record.updated_at = now;
        healing_repo::update(&self.pool, record)?;
        tracing::warn!(
            record_id = %record.id,
            agent_id = %record.agent_id,
            issue_type = record.issue_type.as_str(),
            "Healing escalated to admin"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Periodic maintenance (called from heartbeats / startup)
    // -----------------------------------------------------------------------

    /// Re-check records stuck in `executing`. Idempotent actions are invoked
    /// again; non-idempotent ones past the stale window are written off as
    /// failed and the chain advances. Returns the records that moved.
    pub async fn poll_executing_sessions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<HealingRecord>, AppError> {
        let mut advanced = Vec::new();
        for mut record in healing_repo::get_active(&self.pool, None)? {
            if record.status != HealingStatus::Executing {
                continue;
            }
            let Some(action) = record.pending_action().cloned() else {
                continue;
            };
            let spec = registry::spec(action.action_type);
            if spec.idempotent {
                let outcome = self
                    .runtime
                    .execute_action(&record.agent_id, &action)
                    .await
                    .unwrap_or_else(|e| ActionOutcome::Failed(format!("runtime unavailable: {e}")));
                if self.apply_outcome(&mut record, &action, outcome)? {
                    self.drive(&mut record, false).await?;
                    advanced.push(record);
                }
            } else {
                let started = record
                    .audit_trail
                    .iter()
                    .rev()
                    .find(|e| {
                        e.action == Some(action.action_type) && e.outcome == AuditOutcome::Started
                    })
                    .and_then(|e| DateTime::parse_from_rfc3339(&e.timestamp).ok())
                    .map(|d| d.with_timezone(&Utc));
                let stale = started
                    .map(|s| now - s >= Duration::minutes(EXECUTING_STALE_MINUTES))
                    .unwrap_or(true);
                if stale {
                    self.apply_outcome(
                        &mut record,
                        &action,
                        ActionOutcome::Failed("no completion signal before stale deadline".into()),
                    )?;
                    self.drive(&mut record, false).await?;
                    advanced.push(record);
                }
            }
        }
        Ok(advanced)
    }

    /// Startup recovery: sessions left `executing` by a crash either re-queue
    /// (idempotent actions) or count the interrupted attempt as failed.
    pub async fn recover_stale_sessions(&self) -> Result<usize, AppError> {
        let mut recovered = 0;
        for mut record in healing_repo::get_active(&self.pool, None)? {
            if record.status != HealingStatus::Executing {
                continue;
            }
            let Some(action) = record.pending_action().cloned() else {
                continue;
            };
            let spec = registry::spec(action.action_type);
            recovered += 1;
            if spec.idempotent {
                record.audit_trail.push(audit(
                    Some(action.action_type),
                    AuditOutcome::Skipped,
                    "interrupted by restart, re-queued",
                ));
                record.status = HealingStatus::Diagnosed;
                record.updated_at = Utc::now().to_rfc3339();
                healing_repo::update(&self.pool, &record)?;
                self.drive(&mut record, false).await?;
            } else {
                tracing::warn!(
                    record_id = %record.id,
                    action = action.action_type.as_str(),
                    "Interrupted non-idempotent action counted as failed"
                );
                self.apply_outcome(
                    &mut record,
                    &action,
                    ActionOutcome::Failed("interrupted by restart, cannot verify".into()),
                )?;
                self.drive(&mut record, false).await?;
            }
        }
        if recovered > 0 {
            tracing::info!(count = recovered, "Recovered stale healing sessions");
        }
        Ok(recovered)
    }

    /// An `awaiting_approval` record whose agent produced no new failures for
    /// the quiet window closes as self-resolved; the operator never needs to
    /// answer a question the fleet already answered.
    pub fn check_self_resolution(
        &self,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<HealingRecord>, AppError> {
        let mut resolved = Vec::new();
        for mut record in healing_repo::get_active(&self.pool, Some(agent_id))? {
            if record.status != HealingStatus::AwaitingApproval {
                continue;
            }
            let Some(updated) = DateTime::parse_from_rfc3339(&record.updated_at)
                .ok()
                .map(|d| d.with_timezone(&Utc))
            else {
                continue;
            };
            if now - updated < Duration::minutes(SELF_RESOLVE_QUIET_MINUTES) {
                continue;
            }
            let logs = heartbeat_repo::recent_for_agent(&self.pool, agent_id, &record.updated_at)?;
            if !diagnosis::collect_failures(&logs).is_empty() {
                continue;
            }
            let now_str = now.to_rfc3339();
            record.audit_trail.push(audit(
                None,
                AuditOutcome::SelfResolved,
                format!("no recurrence for {SELF_RESOLVE_QUIET_MINUTES} minutes"),
            ));
            record.status = HealingStatus::Succeeded;
            record.resolved_at = Some(now_str.clone());
            record.updated_at = now_str;
            healing_repo::update(&self.pool, &record)?;
            tracing::info!(record_id = %record.id, "Healing record self-resolved");
            resolved.push(record);
        }
        Ok(resolved)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
