use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Operational knobs for the engine, loaded from `proactive.toml` in the
/// data directory. Every field has a default so a missing or partial file
/// still yields a working config. Detection constants (EMA alpha, promotion
/// thresholds, pattern and suggestion expiry windows) are fixed in the
/// engine modules, not configurable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Scheduled heartbeat cadence for the background loop.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_minutes: u64,

    /// Max agents processed concurrently by a batch heartbeat.
    #[serde(default = "default_worker_pool")]
    pub batch_worker_pool: usize,

    /// A single agent's pipeline is aborted after this long and recorded
    /// as an `error` result.
    #[serde(default = "default_agent_timeout")]
    pub per_agent_timeout_secs: u64,

    /// Standing approval for moderate-risk healing actions. Risky actions
    /// always require an explicit operator approval regardless.
    #[serde(default)]
    pub auto_approve_moderate: bool,

    /// Hard cap on pending suggestions per agent.
    #[serde(default = "default_max_pending")]
    pub max_pending_suggestions: usize,

    /// Minimum gap between two suggestions derived from the same pattern.
    #[serde(default = "default_cooldown")]
    pub suggestion_cooldown_minutes: i64,

    /// Cap on suggestions emitted for one agent in one heartbeat cycle.
    #[serde(default = "default_per_cycle_cap")]
    pub suggestions_per_cycle: usize,

    /// Heartbeat logs and pattern observations older than this are pruned
    /// by the cleanup loop.
    #[serde(default = "default_retention")]
    pub retention_days: i64,
}

fn default_heartbeat_interval() -> u64 {
    15
}
fn default_worker_pool() -> usize {
    4
}
fn default_agent_timeout() -> u64 {
    30
}
fn default_max_pending() -> usize {
    20
}
fn default_cooldown() -> i64 {
    60
}
fn default_per_cycle_cap() -> usize {
    3
}
fn default_retention() -> i64 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_minutes: default_heartbeat_interval(),
            batch_worker_pool: default_worker_pool(),
            per_agent_timeout_secs: default_agent_timeout(),
            auto_approve_moderate: false,
            max_pending_suggestions: default_max_pending(),
            suggestion_cooldown_minutes: default_cooldown(),
            suggestions_per_cycle: default_per_cycle_cap(),
            retention_days: default_retention(),
        }
    }
}

impl EngineConfig {
    /// Load from `<dir>/proactive.toml`. A missing file yields defaults; a
    /// malformed file logs a warning and yields defaults rather than
    /// refusing to start.
    pub fn load(dir: &Path) -> Self {
        let path = dir.join("proactive.toml");
        match std::fs::read_to_string(&path) {
            Ok(raw) => match toml::from_str(&raw) {
                Ok(cfg) => {
                    tracing::info!(path = %path.display(), "Loaded engine config");
                    cfg
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Invalid config, using defaults");
                    Self::default()
                }
            },
            Err(_) => {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                Self::default()
            }
        }
    }
}

/// Resolve the engine data directory (`<platform data dir>/proactive-engine`),
/// creating it if needed. Falls back to the current directory when the
/// platform dir cannot be determined.
pub fn data_dir() -> PathBuf {
    let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
    let dir = base.join("proactive-engine");
    let _ = std::fs::create_dir_all(&dir);
    dir
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.heartbeat_interval_minutes, 15);
        assert_eq!(cfg.batch_worker_pool, 4);
        assert_eq!(cfg.per_agent_timeout_secs, 30);
        assert!(!cfg.auto_approve_moderate);
        assert_eq!(cfg.suggestion_cooldown_minutes, 60);
        assert_eq!(cfg.max_pending_suggestions, 20);
    }

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = EngineConfig::load(dir.path());
        assert_eq!(cfg.suggestions_per_cycle, 3);
    }

    #[test]
    fn test_load_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("proactive.toml"),
            "heartbeat_interval_minutes = 5\nauto_approve_moderate = true\n",
        )
        .unwrap();
        let cfg = EngineConfig::load(dir.path());
        assert_eq!(cfg.heartbeat_interval_minutes, 5);
        assert!(cfg.auto_approve_moderate);
        assert_eq!(cfg.retention_days, 30);
    }

    #[test]
    fn test_load_malformed_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("proactive.toml"), "not valid toml [[[").unwrap();
        let cfg = EngineConfig::load(dir.path());
        assert_eq!(cfg.heartbeat_interval_minutes, 15);
    }
}
