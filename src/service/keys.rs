//! Key service
//!
//! Provisions signing keypairs for local actors.

use std::sync::Arc;

use crate::clock::Clock;
use crate::data::{Database, SigningKeyPair};
use crate::error::AppError;
use crate::federation::{generate_pem_keypair, key_id_for_actor};

/// Key service
pub struct KeyService {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
    key_bits: usize,
}

impl KeyService {
    pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>, key_bits: usize) -> Self {
        Self {
            db,
            clock,
            key_bits,
        }
    }

    /// Generate and store a keypair for an actor
    ///
    /// # Errors
    /// - `Validation` if the actor URI is not an absolute HTTP(S) URL
    /// - `Conflict` if the actor already has a key
    pub async fn provision(&self, actor_uri: &str) -> Result<SigningKeyPair, AppError> {
        let actor_uri = actor_uri.trim();
        let parsed = url::Url::parse(actor_uri)
            .map_err(|e| AppError::Validation(format!("Invalid actor URI: {}", e)))?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            return Err(AppError::Validation(
                "actor URI must be an http(s) URL with a host".to_string(),
            ));
        }

        // Fast-path guard before expensive key generation.
        if self.db.get_signing_key(actor_uri).await?.is_some() {
            return Err(AppError::Conflict(format!(
                "signing key already exists for {}",
                actor_uri
            )));
        }

        let bits = self.key_bits;
        let (private_key_pem, public_key_pem) =
            tokio::task::spawn_blocking(move || generate_pem_keypair(bits))
                .await
                .map_err(|e| AppError::Internal(e.into()))??;

        let now = self.clock.now();
        let key = SigningKeyPair {
            actor_uri: actor_uri.to_string(),
            key_id: key_id_for_actor(actor_uri),
            private_key_pem,
            public_key_pem,
            created_at: now,
            updated_at: now,
        };
        self.db.upsert_signing_key(&key).await?;

        tracing::info!(actor_uri = %key.actor_uri, key_id = %key.key_id, "Signing key provisioned");
        Ok(key)
    }
}
