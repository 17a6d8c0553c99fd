use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use shipper_sync::api;
use shipper_sync::config::Config;
use shipper_sync::engine::coordinator::run_delivery_coordinator;
use shipper_sync::error::AppError;
use shipper_sync::state::AppState;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .with_target(false)
        .compact()
        .init();

    let (app_state, sync_events) = AppState::new(&config)?;
    let shared_state = Arc::new(app_state);

    tokio::spawn(run_delivery_coordinator(
        shared_state.coordinator.clone(),
        shared_state.sync.clone(),
        sync_events,
    ));

    if let (Some(email), Some(password)) = (&config.shipper_email, &config.shipper_password) {
        match shared_state.gateway.login(email, password).await {
            Ok(_) => tracing::info!(email = %email, "signed in"),
            Err(err) => tracing::error!(error = %err, "sign-in failed"),
        }
    }

    if shared_state.tokens.access_token().is_some() {
        let sync = shared_state.sync.clone();
        tokio::spawn(async move {
            if let Err(err) = sync.refresh_all().await {
                tracing::warn!(error = %err, "initial order load failed");
            }
        });
    }

    let app = api::rest::router(shared_state.clone());

    let bind_addr = format!("127.0.0.1:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(
        http_port = config.http_port,
        backend = %config.api_base_url,
        "courier control api started"
    );

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
