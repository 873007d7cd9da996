//! Store seam used by the delivery coordinator.
//!
//! The coordinator only needs a handful of narrow operations, so they are
//! collected here instead of handing it the whole [`Database`].
//!
//! [`Database`]: super::Database

use std::future::Future;

use chrono::{DateTime, Utc};

use super::models::{DeliveryRecord, SigningKeyPair};
use crate::error::AppError;

/// Result of one attempt, ready to be written back onto a `sending` record.
///
/// Every variant carries the incremented `retry_count`.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryUpdate {
    Sent {
        attempted_at: DateTime<Utc>,
        retry_count: i64,
        status_code: u16,
    },
    /// Back to `pending` with a future due time
    Rescheduled {
        attempted_at: DateTime<Utc>,
        retry_count: i64,
        error: String,
        status_code: Option<u16>,
        next_retry_at: DateTime<Utc>,
    },
    DeadLettered {
        attempted_at: DateTime<Utc>,
        retry_count: i64,
        error: String,
        status_code: Option<u16>,
    },
}

impl DeliveryUpdate {
    pub fn retry_count(&self) -> i64 {
        match self {
            Self::Sent { retry_count, .. }
            | Self::Rescheduled { retry_count, .. }
            | Self::DeadLettered { retry_count, .. } => *retry_count,
        }
    }

    pub fn status_label(&self) -> &'static str {
        match self {
            Self::Sent { .. } => "sent",
            Self::Rescheduled { .. } => "pending",
            Self::DeadLettered { .. } => "dead_lettered",
        }
    }
}

/// Durable operations the coordinator performs against the record store.
pub trait DeliveryStore: Send + Sync + 'static {
    /// Pending, non-deleted records whose due time has passed, oldest due first.
    fn fetch_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<DeliveryRecord>, AppError>> + Send;

    /// Atomically move a due `pending` record to `sending`.
    ///
    /// Returns the claim timestamp, or `None` when another worker got there
    /// first.
    fn claim(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Option<DateTime<Utc>>, AppError>> + Send;

    fn load_activity_payload(
        &self,
        activity_id: &str,
    ) -> impl Future<Output = Result<Option<String>, AppError>> + Send;

    fn load_signing_key(
        &self,
        actor_uri: &str,
    ) -> impl Future<Output = Result<Option<SigningKeyPair>, AppError>> + Send;

    /// Persist the outcome of an attempt on a record this worker holds.
    ///
    /// `claimed_at` is the value returned by [`DeliveryStore::claim`]. Fails
    /// with `NotFound` if the record is gone and `Conflict` if it is no longer
    /// in flight under that claim.
    fn apply_update(
        &self,
        id: &str,
        claimed_at: DateTime<Utc>,
        update: &DeliveryUpdate,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Return `sending` records claimed at or before `cutoff` to `pending`.
    fn reset_stale_claims(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;
}
