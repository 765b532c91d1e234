#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use parley_server::{AppState, ParleyConfig, build_router, logging};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = ParleyConfig::load()?;
    logging::init_tracing(&config.logging)?;

    info!(
        provider = %config.generation.provider,
        degrade_on_retrieval_failure = config.turn.degrade_on_retrieval_failure,
        "Starting parley dialogue server"
    );

    let addr = config.bind_address();
    let state = AppState::from_config(config)?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    info!("parley running on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("parley stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
