//! Data layer module
//!
//! Handles all data persistence:
//! - SQLite database operations
//! - Delivery record, activity payload and signing key storage
//! - The narrow store seam the coordinator runs against

mod database;
mod models;
mod store;

pub use database::Database;
pub use models::*;
pub use store::{DeliveryStore, DeliveryUpdate};
