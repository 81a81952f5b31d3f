mod commit;
mod handlers;
mod monitor;
mod state;

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use commit_protocol::{CommitProtocolRegistry, LocalFileSystem};

use crate::state::{AppState, DriverConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("driver=debug,commit_protocol=debug,tower_http=info")
            }),
        )
        .init();

    let config = DriverConfig::from_env();
    let registry = CommitProtocolRegistry::with_defaults(Arc::new(LocalFileSystem));
    info!(
        "protocolos disponibles: {:?}, max_task_attempts={}",
        registry.names(),
        config.max_task_attempts
    );
    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(config, registry);

    // router HTTP
    let app = handlers::build_router(state.clone());

    // monitor de heartbeats en segundo plano
    let monitor_state = state.clone();
    tokio::spawn(async move {
        monitor::monitor_executors(monitor_state).await;
    });

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("no se pudo escuchar en {bind_addr}"))?;
    info!("driver escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
