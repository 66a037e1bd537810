// =============================================================================
// Meridian -- Main Entry Point
// =============================================================================
//
// Configuration comes from the environment (see EngineConfig::from_env).
// The process exits non-zero on startup failure and never exits voluntarily
// during steady-state operation; the supervisor restarts it on fatal faults.
// =============================================================================

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use meridian::api;
use meridian::config::EngineConfig;
use meridian::lifecycle::Engine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -- 1. Environment & logging ----------------------------------------
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = EngineConfig::from_env();
    let storage_label = if cfg.storage_url.is_empty() {
        "memory:"
    } else {
        cfg.storage_url.as_str()
    };
    info!(
        paper_trading = cfg.paper_trading,
        storage = %storage_label,
        bind_addr = %cfg.bind_addr,
        "meridian starting"
    );

    // -- 2. Engine startup (dependency order, abort on failure) -----------
    let engine = Engine::start(cfg.clone())
        .await
        .context("engine startup failed")?;

    // -- 3. Admin surface --------------------------------------------------
    let app = api::router(engine.clone());
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr)
        .await
        .with_context(|| format!("failed to bind admin listener on {}", cfg.bind_addr))?;
    info!(addr = %cfg.bind_addr, "admin surface listening");

    let admin = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    info!("all subsystems running");

    // -- 4. Graceful shutdown ---------------------------------------------
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    warn!("shutdown signal received");

    engine.shutdown().await;
    admin.abort();

    info!("meridian shut down complete");
    Ok(())
}
