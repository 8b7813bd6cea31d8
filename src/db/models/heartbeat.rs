use serde::{Deserialize, Serialize};
use ts_rs::TS;

// ============================================================================
// Heartbeat logs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum HeartbeatType {
    Scheduled,
    Event,
    Realtime,
}

impl HeartbeatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HeartbeatType::Scheduled => "scheduled",
            HeartbeatType::Event => "event",
            HeartbeatType::Realtime => "realtime",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(HeartbeatType::Scheduled),
            "event" => Some(HeartbeatType::Event),
            "realtime" => Some(HeartbeatType::Realtime),
            _ => None,
        }
    }
}

/// Tri-state outcome of one heartbeat pass. `Degraded` means the pipeline
/// partially completed (some steps errored, others ran).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum HeartbeatResult {
    Ok,
    Degraded,
    Error,
}

impl HeartbeatResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            HeartbeatResult::Ok => "ok",
            HeartbeatResult::Degraded => "degraded",
            HeartbeatResult::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ok" => Some(HeartbeatResult::Ok),
            "degraded" => Some(HeartbeatResult::Degraded),
            "error" => Some(HeartbeatResult::Error),
            _ => None,
        }
    }
}

/// Outcome of one pipeline step inside a heartbeat run.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct HeartbeatSubResult {
    pub step: String,
    pub ok: bool,
    pub detail: Option<String>,
}

impl HeartbeatSubResult {
    pub fn ok(step: &str, detail: impl Into<Option<String>>) -> Self {
        Self {
            step: step.to_string(),
            ok: true,
            detail: detail.into(),
        }
    }

    pub fn failed(step: &str, detail: impl Into<String>) -> Self {
        Self {
            step: step.to_string(),
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

/// Append-only record of one orchestrator run for one agent.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct HeartbeatLog {
    pub id: String,
    pub agent_id: String,
    pub heartbeat_type: HeartbeatType,
    pub result: HeartbeatResult,
    pub sub_results: Vec<HeartbeatSubResult>,
    pub duration_ms: Option<i64>,
    pub triggered_at: String,
}
