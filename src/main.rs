// =============================================================================
// Fusion Oracle — Service Entry Point
// =============================================================================
//
// Loads the engine config and persisted trust state, serves the HTTP/WS API
// and rolls the risk period at UTC midnight. Config and trust are written
// back atomically on Ctrl+C.
// =============================================================================

mod api;
mod app_state;

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use fusion_oracle::{EngineConfig, ReflectionSnapshot};

use crate::app_state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Fusion Oracle starting up");

    let config_path =
        std::env::var("FUSION_CONFIG_PATH").unwrap_or_else(|_| "engine_config.json".into());
    let trust_path =
        std::env::var("FUSION_TRUST_PATH").unwrap_or_else(|_| "trust_state.json".into());

    let config = EngineConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, path = %config_path, "Failed to load config, using defaults");
        EngineConfig::default()
    });

    let trust = match ReflectionSnapshot::load(&trust_path) {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            warn!(error = %e, path = %trust_path, "No trust state restored, starting from prior");
            None
        }
    };

    info!(
        veto_threshold = config.fusion.veto_threshold,
        max_drawdown_limit = config.breaker.max_drawdown_limit,
        simulations = config.monte_carlo.n_simulations,
        sources = config.fusion.roster.len(),
        "Engine configured"
    );

    // ── 2. Build shared state ────────────────────────────────────────────
    let state = Arc::new(AppState::new(config, trust).context("invalid engine configuration")?);

    // ── 3. Start the API server ──────────────────────────────────────────
    let bind_addr =
        std::env::var("FUSION_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");

    let app = api::rest::router(state.clone());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    // ── 4. Period rollover loop ──────────────────────────────────────────
    let roll_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            if roll_state.roll_period_if_needed() {
                info!("Risk period rolled over");
            }
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received, persisting state");

    if let Err(e) = state.engine.config().save(&config_path) {
        error!(error = %e, "Failed to save engine config on shutdown");
    }
    if let Err(e) = state.export_trust().save(&trust_path) {
        error!(error = %e, "Failed to save trust state on shutdown");
    }

    info!("Fusion Oracle shut down complete.");
    Ok(())
}
