//! Data models
//!
//! Rust structs representing database entities.
//! All models use ULID for IDs and chrono for timestamps.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Delivery records
// =============================================================================

/// Lifecycle state of a delivery record
///
/// `Sent` and `DeadLettered` are terminal. `Failed` is a readable state for
/// reporting; the engine itself re-arms retryable failures as `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sending,
    Sent,
    Failed,
    DeadLettered,
}

impl DeliveryStatus {
    pub const ALL: [DeliveryStatus; 5] = [
        Self::Pending,
        Self::Sending,
        Self::Sent,
        Self::Failed,
        Self::DeadLettered,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::DeadLettered => "dead_lettered",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(value.trim()))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::DeadLettered)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One delivery lineage for a single (activity, inbox) pair
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryRecord {
    pub id: String,
    /// Source activity identifier (opaque)
    pub activity_id: String,
    /// Activity type tag, e.g. "Create"
    pub activity_type: String,
    /// Destination inbox
    pub inbox_uri: String,
    /// Local actor used as the signing identity
    pub actor_uri: String,
    pub status: DeliveryStatus,
    /// Attempts made so far, including the first
    pub retry_count: i64,
    /// Last failure description
    pub error_message: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    /// Last observed remote HTTP status, as text
    pub response_status_code: Option<String>,
    /// When the current `sending` claim was taken
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Producer input: one activity fanned out to many inboxes
#[derive(Debug, Clone)]
pub struct NewActivity {
    pub activity_id: String,
    pub activity_type: String,
    pub actor_uri: String,
    /// Serialized activity document
    pub payload: String,
}

/// Opaque activity document stored once per activity
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FederationActivity {
    pub activity_id: String,
    pub activity_type: String,
    pub actor_uri: String,
    /// Serialized JSON document, sent verbatim as the request body
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

/// Count of records per status
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryStats {
    pub pending: i64,
    pub sending: i64,
    pub sent: i64,
    pub failed: i64,
    pub dead_lettered: i64,
}

impl DeliveryStats {
    pub fn set(&mut self, status: DeliveryStatus, count: i64) {
        match status {
            DeliveryStatus::Pending => self.pending = count,
            DeliveryStatus::Sending => self.sending = count,
            DeliveryStatus::Sent => self.sent = count,
            DeliveryStatus::Failed => self.failed = count,
            DeliveryStatus::DeadLettered => self.dead_lettered = count,
        }
    }
}

// =============================================================================
// Signing keys
// =============================================================================

/// A local actor's RSA keypair (PEM format)
///
/// The private half is only read by the signer; `Debug` never prints it.
#[derive(Clone, sqlx::FromRow)]
pub struct SigningKeyPair {
    pub actor_uri: String,
    /// Public key URL advertised in the Signature header (actor#main-key)
    pub key_id: String,
    pub private_key_pem: String,
    pub public_key_pem: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKeyPair")
            .field("actor_uri", &self.actor_uri)
            .field("key_id", &self.key_id)
            .field("private_key_pem", &"<redacted>")
            .field("public_key_pem", &self.public_key_pem)
            .field("created_at", &self.created_at)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}
