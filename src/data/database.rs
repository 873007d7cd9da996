//! SQLite database operations
//!
//! All database access goes through this module.
//! Uses SQLx with a WAL-mode pool shared by the workers and the admin API.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;
use std::time::Duration;

use super::models::*;
use super::store::{DeliveryStore, DeliveryUpdate};
use crate::error::AppError;

const DEFAULT_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database connection pool wrapper.
#[derive(Debug, Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Open (creating if needed) the database file and run migrations.
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        Self::connect_with(path, DEFAULT_MAX_CONNECTIONS, DEFAULT_BUSY_TIMEOUT).await
    }

    /// Open with explicit pool sizing and lock wait.
    pub async fn connect_with(
        path: &Path,
        max_connections: u32,
        busy_timeout: Duration,
    ) -> Result<Self, AppError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        // Run migrations
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Migration(e.to_string())
            })?;

        tracing::info!(path = %path.display(), "Database connected and migrated successfully");

        Ok(Self { pool })
    }

    // =========================================================================
    // Producer
    // =========================================================================

    /// Store the activity payload once and create one pending record per inbox.
    ///
    /// Pairs that already exist are left untouched; only newly created
    /// records are returned.
    pub async fn enqueue_activity(
        &self,
        activity: &NewActivity,
        inbox_uris: &[String],
        now: DateTime<Utc>,
    ) -> Result<Vec<DeliveryRecord>, AppError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO federation_activities (
                activity_id, activity_type, actor_uri, payload, created_at
            ) VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&activity.activity_id)
        .bind(&activity.activity_type)
        .bind(&activity.actor_uri)
        .bind(&activity.payload)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let mut created = Vec::new();
        for inbox_uri in inbox_uris {
            let record = DeliveryRecord {
                id: EntityId::new().0,
                activity_id: activity.activity_id.clone(),
                activity_type: activity.activity_type.clone(),
                inbox_uri: inbox_uri.clone(),
                actor_uri: activity.actor_uri.clone(),
                status: DeliveryStatus::Pending,
                retry_count: 0,
                error_message: None,
                last_attempt_at: None,
                next_retry_at: Some(now),
                sent_at: None,
                response_status_code: None,
                claimed_at: None,
                created_at: now,
                updated_at: now,
                deleted_at: None,
            };

            let result = sqlx::query(
                r#"
                INSERT INTO delivery_records (
                    id, activity_id, activity_type, inbox_uri, actor_uri,
                    status, retry_count, next_retry_at, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?, ?)
                ON CONFLICT (activity_id, inbox_uri) DO NOTHING
                "#,
            )
            .bind(&record.id)
            .bind(&record.activity_id)
            .bind(&record.activity_type)
            .bind(&record.inbox_uri)
            .bind(&record.actor_uri)
            .bind(record.status)
            .bind(record.next_retry_at)
            .bind(record.created_at)
            .bind(record.updated_at)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 1 {
                created.push(record);
            }
        }

        tx.commit().await?;
        Ok(created)
    }

    /// Get the stored activity document
    pub async fn get_activity(
        &self,
        activity_id: &str,
    ) -> Result<Option<FederationActivity>, AppError> {
        let activity = sqlx::query_as::<_, FederationActivity>(
            "SELECT * FROM federation_activities WHERE activity_id = ?",
        )
        .bind(activity_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(activity)
    }

    // =========================================================================
    // Delivery records
    // =========================================================================

    /// Get a delivery record by ID (soft-deleted records are hidden)
    pub async fn get_delivery(&self, id: &str) -> Result<Option<DeliveryRecord>, AppError> {
        let record = sqlx::query_as::<_, DeliveryRecord>(
            "SELECT * FROM delivery_records WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// List records, newest first, optionally filtered by status
    pub async fn list_deliveries(
        &self,
        status: Option<DeliveryStatus>,
        limit: u32,
    ) -> Result<Vec<DeliveryRecord>, AppError> {
        let records = match status {
            Some(status) => {
                sqlx::query_as::<_, DeliveryRecord>(
                    r#"
                    SELECT * FROM delivery_records
                    WHERE status = ? AND deleted_at IS NULL
                    ORDER BY updated_at DESC, id DESC
                    LIMIT ?
                    "#,
                )
                .bind(status)
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, DeliveryRecord>(
                    r#"
                    SELECT * FROM delivery_records
                    WHERE deleted_at IS NULL
                    ORDER BY updated_at DESC, id DESC
                    LIMIT ?
                    "#,
                )
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(records)
    }

    /// Count non-deleted records per status
    pub async fn count_by_status(&self) -> Result<DeliveryStats, AppError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS count FROM delivery_records
            WHERE deleted_at IS NULL
            GROUP BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = DeliveryStats::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("count")?;
            if let Some(status) = DeliveryStatus::parse(&status) {
                stats.set(status, count);
            }
        }

        Ok(stats)
    }

    /// Soft-delete a record, removing it from further processing
    ///
    /// # Returns
    /// `false` if the record does not exist or is already deleted
    pub async fn soft_delete_delivery(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_records
            SET deleted_at = ?, updated_at = ?
            WHERE id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn fetch_due_records(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<DeliveryRecord>, AppError> {
        // SQLite sorts NULL first in ascending order
        let records = sqlx::query_as::<_, DeliveryRecord>(
            r#"
            SELECT * FROM delivery_records
            WHERE status = 'pending'
              AND deleted_at IS NULL
              AND (next_retry_at IS NULL OR next_retry_at <= ?)
            ORDER BY next_retry_at ASC, created_at ASC
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Move a due Pending record to Sending
    ///
    /// Returns the claim timestamp when this caller won the record. The
    /// write-back must present it so that a claim recovered and re-taken by
    /// another worker cannot be overwritten.
    pub async fn claim_delivery(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_records
            SET status = 'sending', claimed_at = ?, next_retry_at = NULL, updated_at = ?
            WHERE id = ?
              AND status = 'pending'
              AND deleted_at IS NULL
              AND (next_retry_at IS NULL OR next_retry_at <= ?)
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok((result.rows_affected() == 1).then_some(now))
    }

    pub async fn update_delivery(
        &self,
        id: &str,
        claimed_at: DateTime<Utc>,
        update: &DeliveryUpdate,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let (status, error, status_code, next_retry_at, sent_at, attempted_at) = match update {
            DeliveryUpdate::Sent {
                attempted_at,
                status_code,
                ..
            } => (
                DeliveryStatus::Sent,
                None,
                Some(*status_code),
                None,
                Some(*attempted_at),
                *attempted_at,
            ),
            DeliveryUpdate::Rescheduled {
                attempted_at,
                error,
                status_code,
                next_retry_at,
                ..
            } => (
                DeliveryStatus::Pending,
                Some(error.as_str()),
                *status_code,
                Some(*next_retry_at),
                None,
                *attempted_at,
            ),
            DeliveryUpdate::DeadLettered {
                attempted_at,
                error,
                status_code,
                ..
            } => (
                DeliveryStatus::DeadLettered,
                Some(error.as_str()),
                *status_code,
                None,
                None,
                *attempted_at,
            ),
        };
        let retry_count = update.retry_count();

        // Conditional on this claim still being held and on exactly one
        // attempt having been added since it was taken. Sent clears the
        // error text; the other outcomes replace it.
        let result = sqlx::query(
            r#"
            UPDATE delivery_records
            SET status = ?,
                retry_count = ?,
                error_message = ?,
                last_attempt_at = ?,
                next_retry_at = ?,
                sent_at = ?,
                response_status_code = COALESCE(?, response_status_code),
                claimed_at = NULL,
                updated_at = ?
            WHERE id = ? AND status = 'sending' AND claimed_at = ? AND retry_count = ?
            "#,
        )
        .bind(status)
        .bind(retry_count)
        .bind(error)
        .bind(attempted_at)
        .bind(next_retry_at)
        .bind(sent_at)
        .bind(status_code.map(|code| code.to_string()))
        .bind(now)
        .bind(id)
        .bind(claimed_at)
        .bind(retry_count - 1)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        let current = sqlx::query(
            "SELECT status, retry_count, claimed_at FROM delivery_records WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match current {
            None => Err(AppError::NotFound),
            Some(row) => {
                let status: String = row.try_get("status")?;
                let stored_count: i64 = row.try_get("retry_count")?;
                let stored_claim: Option<DateTime<Utc>> = row.try_get("claimed_at")?;
                let holder = stored_claim
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "none".to_string());
                Err(AppError::Conflict(format!(
                    "delivery {id} is {status} with retry_count {stored_count} (claim {holder}), \
                     expected sending with {} under claim {}",
                    retry_count - 1,
                    claimed_at.to_rfc3339()
                )))
            }
        }
    }

    pub async fn release_stale_claims(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_records
            SET status = 'pending',
                claimed_at = NULL,
                next_retry_at = COALESCE(next_retry_at, ?),
                updated_at = ?
            WHERE status = 'sending'
              AND (claimed_at IS NULL OR claimed_at <= ?)
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // =========================================================================
    // Signing keys
    // =========================================================================

    /// Create or replace an actor's signing keypair
    pub async fn upsert_signing_key(&self, key: &SigningKeyPair) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO signing_keys (
                actor_uri, key_id, private_key_pem, public_key_pem, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (actor_uri) DO UPDATE SET
                key_id = excluded.key_id,
                private_key_pem = excluded.private_key_pem,
                public_key_pem = excluded.public_key_pem,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&key.actor_uri)
        .bind(&key.key_id)
        .bind(&key.private_key_pem)
        .bind(&key.public_key_pem)
        .bind(key.created_at)
        .bind(key.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get an actor's signing keypair
    pub async fn get_signing_key(
        &self,
        actor_uri: &str,
    ) -> Result<Option<SigningKeyPair>, AppError> {
        let key = sqlx::query_as::<_, SigningKeyPair>(
            "SELECT * FROM signing_keys WHERE actor_uri = ?",
        )
        .bind(actor_uri)
        .fetch_optional(&self.pool)
        .await?;

        Ok(key)
    }
}

impl DeliveryStore for Database {
    async fn fetch_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<DeliveryRecord>, AppError> {
        self.fetch_due_records(now, limit).await
    }

    async fn claim(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, AppError> {
        self.claim_delivery(id, now).await
    }

    async fn load_activity_payload(&self, activity_id: &str) -> Result<Option<String>, AppError> {
        Ok(self
            .get_activity(activity_id)
            .await?
            .map(|activity| activity.payload))
    }

    async fn load_signing_key(&self, actor_uri: &str) -> Result<Option<SigningKeyPair>, AppError> {
        self.get_signing_key(actor_uri).await
    }

    async fn apply_update(
        &self,
        id: &str,
        claimed_at: DateTime<Utc>,
        update: &DeliveryUpdate,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        self.update_delivery(id, claimed_at, update, now).await
    }

    async fn reset_stale_claims(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        self.release_stale_claims(cutoff, now).await
    }
}
