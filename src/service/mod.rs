//! Service layer
//!
//! Contains the delivery engine and the business logic behind the admin API.
//! Services orchestrate database and federation operations.

mod coordinator;
mod delivery;
mod keys;
pub mod lifecycle;
pub mod retry;

pub use coordinator::{CoordinatorOptions, DeliveryCoordinator, PollSummary};
pub use delivery::{DeliveryService, EnqueueRequest, MAX_LIST_LIMIT};
pub use keys::KeyService;
pub use lifecycle::resolve_attempt;
pub use retry::RetryPolicy;
