//! Self-monitoring and self-remediation engine for deployed AI agents.
//!
//! The engine watches agent lifecycle events, maintains behavioral patterns,
//! raises human-facing suggestions, diagnoses operational problems, and runs
//! remediation actions under an approval gate. Embed it with
//! [`ProactiveEngine`], or run the `proactive-engine` binary as a standalone
//! service.
//!
//! [`bootstrap`] does not install a tracing subscriber: embedders that want
//! one call [`logging::init`] (console only) or [`logging::init_service`]
//! (console plus a rolling JSON file), as the binary does.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod logging;

pub use config::EngineConfig;
pub use engine::feed::{ProactiveEvent, SubscriptionId};
pub use engine::runtime::{ActionOutcome, AgentRuntime, NoopRuntime};
pub use engine::ProactiveEngine;
pub use error::AppError;

use std::sync::Arc;

/// Build a ready-to-start engine over the data directory: open the store,
/// run migrations, load config, rebuild the projection, and recover any
/// healing sessions interrupted by the previous process.
pub async fn bootstrap(
    data_dir: &std::path::Path,
    runtime: Arc<dyn AgentRuntime>,
) -> Result<ProactiveEngine, AppError> {
    let config = EngineConfig::load(data_dir);
    let pool = db::init_db(data_dir)?;
    let engine = ProactiveEngine::new(pool, config, runtime);
    engine.recover().await?;
    Ok(engine)
}
