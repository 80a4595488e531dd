//! HTTP server for the assist pipeline.
//!
//! Reads configuration from the environment (and `.env`), serves the API
//! routes and, on SIGINT/SIGTERM, drains deferred work and flushes telemetry
//! before exiting.

use tower_assist::config::AssistConfig;
use tower_assist::server::{router, AppState, Backends};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tower_assist=debug")),
        )
        .init();

    let config = AssistConfig::from_env();
    let backends = Backends::from_config(&config);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(
        addr = %config.bind_addr,
        telemetry_regions = config.telemetry.len(),
        voice = config.livekit.credentials().is_some(),
        "listening"
    );

    let state = AppState::new(config, backends);
    let finalizer = state.finalizer.clone();
    let recorder = state.recorder.clone();

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!(pending = finalizer.pending(), "draining deferred work");
    finalizer.drain().await;
    recorder.flush().await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
