//! API layer
//!
//! HTTP handlers for:
//! - Delivery producer and inspection endpoints
//! - Signing key provisioning
//! - Metrics (Prometheus)

mod auth;
mod deliveries;
mod keys;
pub mod metrics;

use axum::{Router, middleware};

use crate::AppState;

pub use auth::require_api_token;
pub use deliveries::{EnqueueBody, EnqueueResponse, ListQuery, deliveries_router};
pub use keys::{ProvisionKeyBody, PublicKeyResponse, keys_router};
pub use metrics::{metrics_router, track_http_requests};

/// Admin API routes, nested under `/api/v1`
///
/// Every route requires the bearer token when `server.api_token` is set.
pub fn api_router(state: AppState) -> Router<AppState> {
    Router::new()
        .merge(deliveries_router())
        .merge(keys_router())
        .layer(middleware::from_fn_with_state(state, require_api_token))
}
