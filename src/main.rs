use std::net::SocketAddr;

use hospital::{app, initialize_state, telemetry};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    telemetry::init_tracing();

    let state = match initialize_state().await {
        Ok(state) => state,
        Err(error) => {
            tracing::error!(%error, "failed to initialize application state");
            std::process::exit(1);
        },
    };

    let state = match telemetry::setup_metrics_recorder() {
        Ok(handle) => state.with_metrics(handle),
        Err(error) => {
            tracing::warn!(%error, "prometheus recorder not installed, `/metrics` disabled");
            state
        },
    };

    let listener = TcpListener::bind(&state.config.address).await?;
    tracing::info!(
        address = %state.config.address,
        version = state.config.version(),
        "server started"
    );

    axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "failed to listen for shutdown signal");
    }
    tracing::info!("shutting down");
}
