//! Seam to the agent-execution runtime. The engine decides *which* healing
//! action to run; this trait is the only place that actually runs one, so
//! tests substitute a scripted fake and the shipped default is a logging
//! no-op until a real runtime is wired in.

use async_trait::async_trait;

use crate::db::models::HealingAction;
use crate::error::AppError;

/// What became of one action invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// The action completed and the issue is considered addressed.
    Resolved(String),
    /// The action ran and did not help, or could not run.
    Failed(String),
    /// The action was started but has no completion signal yet; the executor
    /// polls it again on a later cycle.
    InProgress(String),
}

#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Execute one remediation against one agent. Implementations should
    /// return [`ActionOutcome::Failed`] for remediations that ran and did
    /// not work, and `Err` only for transport-level trouble reaching the
    /// runtime itself.
    async fn execute_action(
        &self,
        agent_id: &str,
        action: &HealingAction,
    ) -> Result<ActionOutcome, AppError>;
}

/// Default runtime: logs the request and reports success. Keeps the engine
/// fully operable in environments where no execution backend is attached.
pub struct NoopRuntime;

#[async_trait]
impl AgentRuntime for NoopRuntime {
    async fn execute_action(
        &self,
        agent_id: &str,
        action: &HealingAction,
    ) -> Result<ActionOutcome, AppError> {
        tracing::info!(
            agent_id = %agent_id,
            action = action.action_type.as_str(),
            params = %action.params,
            "No runtime attached, treating action as applied"
        );
        Ok(ActionOutcome::Resolved(format!(
            "{} acknowledged (no runtime attached)",
            action.action_type.as_str()
        )))
    }
}
