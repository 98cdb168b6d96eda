use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use delivery_coordinator::api;
use delivery_coordinator::config::{Config, LogFormat};
use delivery_coordinator::engine::assignment::run_dispatch_worker;
use delivery_coordinator::engine::reconcile::run_reconciler;
use delivery_coordinator::error::AppError;
use delivery_coordinator::state::AppState;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::from_env()?;

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .with_target(false);
    match config.log_format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Compact => subscriber.compact().init(),
    }

    let http_port = config.http_port;
    let (app_state, dispatch_rx) = AppState::new(config);
    let shared_state = Arc::new(app_state);

    let app = api::rest::router(shared_state.clone());

    tokio::spawn(run_dispatch_worker(shared_state.clone(), dispatch_rx));
    tokio::spawn(run_reconciler(shared_state.clone()));

    let bind_addr = format!("0.0.0.0:{http_port}");
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(http_port, "http server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::Internal(format!("server error: {err}")))?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
