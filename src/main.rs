use std::sync::Arc;

use proactive_engine::{config, logging, NoopRuntime};

#[tokio::main]
async fn main() {
    let data_dir = config::data_dir();
    logging::init_service(&data_dir);
    logging::install_crash_hook(&data_dir);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        "Starting proactive engine"
    );

    // Standalone mode has no agent runtime attached; healing actions resolve
    // as no-ops. Embedders wire a real runtime through `bootstrap`.
    let engine = match proactive_engine::bootstrap(&data_dir, Arc::new(NoopRuntime)).await {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!(error = %e, "Engine startup failed");
            std::process::exit(1);
        }
    };

    engine.start();

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Signal handler failed");
    }
    tracing::info!("Shutdown signal received");
    engine.stop();

    let stats = engine.loop_stats();
    tracing::info!(
        batches_run = stats.batches_run,
        agents_ok = stats.agents_ok,
        agents_degraded = stats.agents_degraded,
        agents_failed = stats.agents_failed,
        "Proactive engine stopped"
    );
}
