//! fedcourier - durable outbound ActivityPub delivery
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - Enqueue / inspect deliveries                             │
//! │  - Signing key provisioning                                 │
//! │  - Health and Prometheus metrics                            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Service Layer                            │
//! │  - Delivery coordinator (poll, claim, dispatch, persist)    │
//! │  - Retry policy and delivery lifecycle                      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │               Federation / Data Layer                        │
//! │  - HTTP Signatures + signed POST to remote inboxes          │
//! │  - SQLite (sqlx) delivery store                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers for the admin API
//! - `service`: Coordinator, retry policy and producer services
//! - `federation`: Request signing and inbox dispatch
//! - `data`: Delivery store
//! - `clock`: Time source
//! - `config`: Configuration management
//! - `error`: Error types

pub mod api;
pub mod clock;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;
pub mod service;

use std::sync::Arc;

use axum::{Router, middleware, routing::get};
use tower_http::trace::TraceLayer;

use crate::clock::{Clock, SystemClock};
use crate::data::Database;
use crate::federation::{DispatcherOptions, HttpDispatcher};
use crate::service::{
    CoordinatorOptions, DeliveryCoordinator, DeliveryService, KeyService, RetryPolicy,
};

/// Coordinator wired to the SQLite store and the HTTP dispatcher
pub type Coordinator = DeliveryCoordinator<Database, HttpDispatcher>;

/// Application state shared across all handlers
///
/// This struct is cloned for each request and contains
/// shared resources like the database pool and the coordinator.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<Database>,

    /// Producer-side delivery operations
    pub deliveries: Arc<DeliveryService>,

    /// Actor signing key provisioning
    pub keys: Arc<KeyService>,

    /// Delivery engine; its loops are started by the binary
    pub coordinator: Arc<Coordinator>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database (runs migrations)
    /// 2. Build the HTTP dispatcher
    /// 3. Build the coordinator and the services sharing its wake-up handle
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        Self::with_clock(config, Arc::new(SystemClock)).await
    }

    /// Same as [`AppState::new`] with an explicit time source
    pub async fn with_clock(
        config: config::AppConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        // 1. Connect to SQLite database
        let db = Arc::new(
            Database::connect_with(
                &config.database.path,
                config.database.max_connections,
                std::time::Duration::from_millis(config.database.busy_timeout_ms),
            )
            .await?,
        );
        tracing::info!(path = %config.database.path.display(), "Database connected");

        // 2. Initialize HTTP dispatcher
        let dispatcher = Arc::new(HttpDispatcher::new(
            DispatcherOptions::from_config(&config.delivery),
            clock.clone(),
        )?);

        // 3. Coordinator and services
        let coordinator = Arc::new(DeliveryCoordinator::new(
            db.clone(),
            dispatcher,
            RetryPolicy::from_config(&config.delivery),
            CoordinatorOptions::from_config(&config.delivery),
            clock.clone(),
        ));
        let deliveries = Arc::new(DeliveryService::new(
            db.clone(),
            coordinator.notifier(),
            clock.clone(),
        ));
        let keys = Arc::new(KeyService::new(
            db.clone(),
            clock,
            config.delivery.signing_key_bits,
        ));

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            db,
            deliveries,
            keys,
            coordinator,
        })
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", api::api_router(state.clone()))
        .layer(middleware::from_fn(api::track_http_requests))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
        .merge(api::metrics_router())
}

async fn health_check() -> &'static str {
    "OK"
}
