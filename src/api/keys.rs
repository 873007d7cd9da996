//! Signing key provisioning endpoint

use axum::{Router, extract::State, http::StatusCode, response::Json, routing::post};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::AppError;

pub fn keys_router() -> Router<AppState> {
    Router::new().route("/keys", post(provision_key))
}

#[derive(Debug, Deserialize)]
pub struct ProvisionKeyBody {
    pub actor_uri: String,
}

/// Public half only; the private key never leaves the store
#[derive(Debug, Serialize)]
pub struct PublicKeyResponse {
    pub actor_uri: String,
    pub key_id: String,
    pub public_key_pem: String,
    pub created_at: DateTime<Utc>,
}

/// POST /api/v1/keys
async fn provision_key(
    State(state): State<AppState>,
    Json(body): Json<ProvisionKeyBody>,
) -> Result<(StatusCode, Json<PublicKeyResponse>), AppError> {
    let key = state.keys.provision(&body.actor_uri).await?;

    Ok((
        StatusCode::CREATED,
        Json(PublicKeyResponse {
            actor_uri: key.actor_uri,
            key_id: key.key_id,
            public_key_pem: key.public_key_pem,
            created_at: key.created_at,
        }),
    ))
}
