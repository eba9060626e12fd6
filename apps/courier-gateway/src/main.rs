mod config;
mod metrics;
mod routes;
mod state;
mod telemetry;

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use config::{Cli, GatewayConfig};
use courier_remote::HttpDocumentService;
use courier_transfer::MemoryDocumentService;
use routes::build_router;
use state::AppState;
use tokio::{net::TcpListener, signal, sync::oneshot};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init()?;

    let cfg = GatewayConfig::try_from(Cli::parse())?;
    let listen_addr = cfg.listen_addr;
    let shutdown_grace = cfg.shutdown_grace;
    let environment = cfg.environment;

    let state = match cfg.remote.clone() {
        Some(remote) => {
            let base_url = remote.base_url.clone();
            let service = HttpDocumentService::new(remote)
                .with_context(|| format!("invalid remote configuration for {base_url}"))?;
            info!(base_url = %service.base_url(), "using remote document service");
            AppState::with_remote(cfg, service)
        }
        None => {
            info!("COURIER_REMOTE_API_KEY not set; running in in-memory mode");
            AppState::in_memory(cfg, Arc::new(MemoryDocumentService::new()))
        }
    };

    let app = build_router(state);
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;
    info!(
        %listen_addr,
        %environment,
        build = env!("COURIER_BUILD_ID"),
        "starting courier gateway"
    );

    let (stopping_tx, stopping_rx) = oneshot::channel();
    let server = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            stopping_tx.send(()).ok();
        });
    tokio::select! {
        result = server.into_future() => result.context("server error")?,
        _ = grace_expired(stopping_rx, shutdown_grace) => {
            warn!(grace_ms = shutdown_grace.as_millis() as u64, "open connections outlived the shutdown grace period");
        }
    }
    info!("courier gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received; draining connections");
}

/// Resolves `grace` after shutdown begins, and never if it does not.
async fn grace_expired(stopping: oneshot::Receiver<()>, grace: Duration) {
    match stopping.await {
        Ok(()) => tokio::time::sleep(grace).await,
        Err(_) => std::future::pending().await,
    }
}
