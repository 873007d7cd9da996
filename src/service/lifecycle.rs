//! Delivery record state transitions.
//!
//! ```text
//! Pending --claim--> Sending --Success--------------------> Sent
//!                            --Retryable, budget left------> Pending (re-armed)
//!                            --Retryable, budget spent-----> DeadLettered
//!                            --Terminal--------------------> DeadLettered
//! ```
//!
//! Claiming happens in the store. This module only decides where a record
//! that is `Sending` goes next; it never touches storage or the network.

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::data::{DeliveryRecord, DeliveryUpdate};
use crate::federation::AttemptOutcome;
use crate::service::retry::RetryPolicy;

pub const RETRIES_EXHAUSTED: &str = "retries exhausted";

/// Map an attempt outcome on a claimed record to the update to persist.
pub fn resolve_attempt<R: Rng + ?Sized>(
    record: &DeliveryRecord,
    outcome: &AttemptOutcome,
    policy: &RetryPolicy,
    attempted_at: DateTime<Utc>,
    rng: &mut R,
) -> DeliveryUpdate {
    let retry_count = record.retry_count.saturating_add(1);

    match outcome {
        AttemptOutcome::Success { status_code } => DeliveryUpdate::Sent {
            attempted_at,
            retry_count,
            status_code: *status_code,
        },
        AttemptOutcome::RetryableFailure {
            reason,
            status_code,
        } if policy.is_exhausted(retry_count) => DeliveryUpdate::DeadLettered {
            attempted_at,
            retry_count,
            error: format!("{RETRIES_EXHAUSTED}: {reason}"),
            status_code: *status_code,
        },
        AttemptOutcome::RetryableFailure {
            reason,
            status_code,
        } => DeliveryUpdate::Rescheduled {
            attempted_at,
            retry_count,
            error: reason.clone(),
            status_code: *status_code,
            next_retry_at: policy.next_retry_at_with(attempted_at, retry_count, rng),
        },
        AttemptOutcome::TerminalFailure {
            reason,
            status_code,
        } => DeliveryUpdate::DeadLettered {
            attempted_at,
            retry_count,
            error: reason.clone(),
            status_code: *status_code,
        },
    }
}
