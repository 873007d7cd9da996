//! Delivery service
//!
//! Producer entry point plus the read/maintenance operations behind the
//! admin API.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Notify;

use crate::clock::Clock;
use crate::data::{Database, DeliveryRecord, DeliveryStats, DeliveryStatus, NewActivity};
use crate::error::AppError;
use crate::metrics;

/// Upper bound on `list` page size
pub const MAX_LIST_LIMIT: u32 = 500;

/// Producer request: one activity to fan out
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub activity_id: String,
    pub activity_type: String,
    pub actor_uri: String,
    /// Activity document; stored and sent as-is
    pub payload: serde_json::Value,
    pub inbox_uris: Vec<String>,
}

/// Deduplicate identical inbox URIs while keeping distinct personal inboxes.
///
/// This preserves recipients on the same domain that use different inbox paths.
fn unique_inbox_targets(inbox_uris: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut targets = Vec::new();

    for inbox_uri in inbox_uris {
        let inbox_uri = inbox_uri.trim().to_string();
        if inbox_uri.is_empty() || !seen.insert(inbox_uri.clone()) {
            continue;
        }
        targets.push(inbox_uri);
    }

    targets
}

fn required(value: &str, field: &str) -> Result<String, AppError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation(format!("{} cannot be empty", field)));
    }
    Ok(trimmed.to_string())
}

/// Delivery service
pub struct DeliveryService {
    db: Arc<Database>,
    notify: Arc<Notify>,
    clock: Arc<dyn Clock>,
}

impl DeliveryService {
    /// Create new delivery service
    ///
    /// `notify` wakes an idle coordinator worker after an enqueue.
    pub fn new(db: Arc<Database>, notify: Arc<Notify>, clock: Arc<dyn Clock>) -> Self {
        Self { db, notify, clock }
    }

    /// Create one pending record per unique inbox
    ///
    /// Re-enqueueing an (activity, inbox) pair that already exists is a
    /// no-op; only newly created records are returned.
    ///
    /// # Errors
    /// `Validation` for empty identifiers or an empty inbox list
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<Vec<DeliveryRecord>, AppError> {
        let activity = NewActivity {
            activity_id: required(&request.activity_id, "activity_id")?,
            activity_type: required(&request.activity_type, "activity_type")?,
            actor_uri: required(&request.actor_uri, "actor_uri")?,
            payload: serde_json::to_string(&request.payload)
                .map_err(|e| AppError::Validation(format!("invalid payload: {}", e)))?,
        };

        let total_targets = request.inbox_uris.len();
        let targets = unique_inbox_targets(request.inbox_uris);
        if targets.is_empty() {
            return Err(AppError::Validation(
                "inbox_uris must contain at least one inbox".to_string(),
            ));
        }

        let created = self
            .db
            .enqueue_activity(&activity, &targets, self.clock.now())
            .await?;

        metrics::DELIVERIES_ENQUEUED_TOTAL
            .with_label_values(&[activity.activity_type.as_str()])
            .inc_by(created.len() as u64);

        tracing::info!(
            activity_id = %activity.activity_id,
            activity_type = %activity.activity_type,
            created = created.len(),
            unique_targets = targets.len(),
            total_targets,
            "Activity enqueued for delivery"
        );

        if !created.is_empty() {
            self.notify.notify_one();
        }

        Ok(created)
    }

    pub async fn get(&self, id: &str) -> Result<DeliveryRecord, AppError> {
        self.db.get_delivery(id).await?.ok_or(AppError::NotFound)
    }

    /// List records, optionally by status; `limit` is clamped to [1, MAX_LIST_LIMIT]
    pub async fn list(
        &self,
        status: Option<DeliveryStatus>,
        limit: u32,
    ) -> Result<Vec<DeliveryRecord>, AppError> {
        self.db
            .list_deliveries(status, limit.clamp(1, MAX_LIST_LIMIT))
            .await
    }

    /// Counts per status; also refreshes the records gauge
    pub async fn stats(&self) -> Result<DeliveryStats, AppError> {
        let stats = self.db.count_by_status().await?;

        for (status, count) in [
            (DeliveryStatus::Pending, stats.pending),
            (DeliveryStatus::Sending, stats.sending),
            (DeliveryStatus::Sent, stats.sent),
            (DeliveryStatus::Failed, stats.failed),
            (DeliveryStatus::DeadLettered, stats.dead_lettered),
        ] {
            metrics::DELIVERY_RECORDS
                .with_label_values(&[status.as_str()])
                .set(count);
        }

        Ok(stats)
    }

    /// Soft-delete a record so it is never picked up again
    pub async fn delete(&self, id: &str) -> Result<(), AppError> {
        if !self.db.soft_delete_delivery(id, self.clock.now()).await? {
            return Err(AppError::NotFound);
        }

        tracing::info!(delivery_id = %id, "Delivery record deleted");
        Ok(())
    }
}
