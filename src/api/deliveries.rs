//! Delivery API endpoints
//!
//! Producer enqueue plus inspection of the delivery queue and dead letters.

use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::get,
};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::data::{DeliveryRecord, DeliveryStats, DeliveryStatus};
use crate::error::AppError;
use crate::service::EnqueueRequest;

const DEFAULT_LIST_LIMIT: u32 = 50;

/// Create deliveries router
///
/// Routes:
/// - POST /deliveries - Enqueue an activity for a set of inboxes
/// - GET /deliveries - List records (`?status=dead_lettered&limit=20`)
/// - GET /deliveries/stats - Record counts per status
/// - GET /deliveries/:id - Single record
/// - DELETE /deliveries/:id - Soft-delete a record
pub fn deliveries_router() -> Router<AppState> {
    Router::new()
        .route("/deliveries", get(list_deliveries).post(enqueue_deliveries))
        .route("/deliveries/stats", get(delivery_stats))
        .route(
            "/deliveries/:id",
            get(get_delivery).delete(delete_delivery),
        )
}

/// Enqueue request body
#[derive(Debug, Deserialize)]
pub struct EnqueueBody {
    pub activity_id: String,
    pub activity_type: String,
    pub actor_uri: String,
    pub payload: serde_json::Value,
    pub inbox_uris: Vec<String>,
}

/// Enqueue response
#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    /// Newly created records; existing (activity, inbox) pairs are not repeated
    pub created: Vec<DeliveryRecord>,
}

/// List query parameters
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub limit: Option<u32>,
}

/// POST /api/v1/deliveries
async fn enqueue_deliveries(
    State(state): State<AppState>,
    Json(body): Json<EnqueueBody>,
) -> Result<(StatusCode, Json<EnqueueResponse>), AppError> {
    if !body.payload.is_object() {
        return Err(AppError::Validation(
            "payload must be a JSON object".to_string(),
        ));
    }

    let created = state
        .deliveries
        .enqueue(EnqueueRequest {
            activity_id: body.activity_id,
            activity_type: body.activity_type,
            actor_uri: body.actor_uri,
            payload: body.payload,
            inbox_uris: body.inbox_uris,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(EnqueueResponse { created })))
}

/// GET /api/v1/deliveries
async fn list_deliveries(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<DeliveryRecord>>, AppError> {
    let status = query
        .status
        .as_deref()
        .map(|value| {
            DeliveryStatus::parse(value)
                .ok_or_else(|| AppError::Validation(format!("unknown status: {}", value)))
        })
        .transpose()?;

    let records = state
        .deliveries
        .list(status, query.limit.unwrap_or(DEFAULT_LIST_LIMIT))
        .await?;

    Ok(Json(records))
}

/// GET /api/v1/deliveries/stats
async fn delivery_stats(State(state): State<AppState>) -> Result<Json<DeliveryStats>, AppError> {
    Ok(Json(state.deliveries.stats().await?))
}

/// GET /api/v1/deliveries/:id
async fn get_delivery(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeliveryRecord>, AppError> {
    Ok(Json(state.deliveries.get(&id).await?))
}

/// DELETE /api/v1/deliveries/:id
async fn delete_delivery(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.deliveries.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
