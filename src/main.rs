//! fedcourier binary entry point

use fedcourier::{AppState, config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application entry point
///
/// # Setup
/// 1. Initialize tracing/logging
/// 2. Load configuration from file and environment
/// 3. Initialize AppState
/// 4. Start the delivery coordinator
/// 5. Serve the admin API until Ctrl-C, then drain workers
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize tracing/logging
    let log_format =
        std::env::var("FEDCOURIER__LOGGING__FORMAT").unwrap_or_else(|_| "pretty".to_string());

    if log_format == "json" {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "fedcourier=info,tower_http=info".into()),
            )
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "fedcourier=info,tower_http=info".into()),
            )
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    tracing::info!("Starting fedcourier...");

    // 2. Initialize metrics
    fedcourier::metrics::init_metrics();

    // 3. Load configuration
    let config = config::AppConfig::load()?;
    tracing::info!(
        workers = config.delivery.workers,
        max_attempts = config.delivery.max_attempts,
        "Configuration loaded"
    );

    // 4. Initialize application state
    let state = AppState::new(config.clone()).await?;

    // 5. Start delivery workers
    let workers = state.coordinator.spawn();
    let shutdown = state.coordinator.shutdown_token();

    // 6. Build Axum router and start HTTP server
    let app = fedcourier::build_router(state.clone());
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::error!(%error, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown requested");
            server_shutdown.cancel();
        })
        .await?;

    // Workers finish their in-flight record before exiting
    shutdown.cancel();
    for handle in workers {
        if let Err(error) = handle.await {
            tracing::error!(%error, "Delivery task panicked");
        }
    }

    tracing::info!("fedcourier stopped");
    Ok(())
}
