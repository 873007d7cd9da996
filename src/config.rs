//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::{path::PathBuf, time::Duration};

use crate::error::AppError;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub delivery: DeliveryConfig,
    pub logging: LoggingConfig,
}

/// Admin API server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "127.0.0.1")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Bearer token required on `/api` routes when set
    pub api_token: Option<String>,
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
    /// Pool size shared by workers and the admin API
    pub max_connections: u32,
    /// How long a writer waits on a locked database, in milliseconds
    pub busy_timeout_ms: u64,
}

/// Delivery engine configuration
///
/// Every knob the retry policy, dispatcher and coordinator read lives here.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Attempt ceiling before a retryable failure is dead-lettered
    pub max_attempts: u32,
    /// First retry delay in seconds
    pub base_delay_seconds: u64,
    /// Upper bound on the un-jittered retry delay in seconds
    pub cap_delay_seconds: u64,
    /// Jitter as a fraction of the delay, in [0, 1)
    pub jitter_fraction: f64,
    /// Due records fetched per poll
    pub batch_size: u32,
    /// Age after which a `sending` claim is considered abandoned
    pub claim_lease_timeout_seconds: u64,
    /// Outbound request timeout in seconds
    pub request_timeout_seconds: u64,
    /// Number of concurrent polling workers
    pub workers: usize,
    /// Idle wait between polls in milliseconds
    pub poll_interval_ms: u64,
    /// Interval between stale claim recovery passes
    pub recovery_interval_seconds: u64,
    /// Extra write attempts after a failed state write-back
    pub store_write_retries: u32,
    /// First backoff between write-back retries in milliseconds
    pub store_write_backoff_ms: u64,
    /// User-Agent header for outbound requests
    pub user_agent: String,
    /// Permit inboxes on loopback/private addresses (tests, LAN setups)
    pub allow_private_destinations: bool,
    /// RSA modulus size for keys provisioned through the API
    pub signing_key_bits: usize,
}

impl DeliveryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_secs(self.base_delay_seconds)
    }

    pub fn cap_delay(&self) -> Duration {
        Duration::from_secs(self.cap_delay_seconds)
    }

    pub fn claim_lease_timeout(&self) -> Duration {
        Duration::from_secs(self.claim_lease_timeout_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_interval_seconds)
    }

    pub fn store_write_backoff(&self) -> Duration {
        Duration::from_millis(self.store_write_backoff_ms)
    }

    /// Longest a worker can spend persisting one outcome after its request
    /// returns: every write attempt may wait out the busy timeout, and the
    /// backoff doubles between attempts.
    pub fn write_back_budget(&self, busy_timeout_ms: u64) -> Duration {
        let retries = u64::from(self.store_write_retries);
        let backoff_total = self.store_write_backoff_ms.saturating_mul(
            1u64.checked_shl(self.store_write_retries)
                .unwrap_or(u64::MAX)
                .saturating_sub(1),
        );
        let busy_total = busy_timeout_ms.saturating_mul(retries.saturating_add(1));
        Duration::from_millis(backoff_total.saturating_add(busy_total))
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.max_attempts == 0 {
            return Err(AppError::Config(
                "delivery.max_attempts must be at least 1".to_string(),
            ));
        }

        if !(0.0..1.0).contains(&self.jitter_fraction) {
            return Err(AppError::Config(
                "delivery.jitter_fraction must be in [0, 1)".to_string(),
            ));
        }

        if self.cap_delay_seconds < self.base_delay_seconds {
            return Err(AppError::Config(
                "delivery.cap_delay_seconds must not be smaller than delivery.base_delay_seconds"
                    .to_string(),
            ));
        }

        if self.batch_size == 0 || self.workers == 0 {
            return Err(AppError::Config(
                "delivery.batch_size and delivery.workers must be greater than 0".to_string(),
            ));
        }

        if self.signing_key_bits < 1024 {
            return Err(AppError::Config(
                "delivery.signing_key_bits must be at least 1024".to_string(),
            ));
        }

        if self.request_timeout_seconds == 0 {
            return Err(AppError::Config(
                "delivery.request_timeout_seconds must be greater than 0".to_string(),
            ));
        }

        if self.poll_interval_ms == 0 {
            return Err(AppError::Config(
                "delivery.poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.recovery_interval_seconds == 0 {
            return Err(AppError::Config(
                "delivery.recovery_interval_seconds must be greater than 0".to_string(),
            ));
        }

        // A claim that can expire while its request is still running would
        // let the recovery pass hand the record to a second worker.
        if self.claim_lease_timeout_seconds <= self.request_timeout_seconds {
            return Err(AppError::Config(
                "delivery.claim_lease_timeout_seconds must exceed delivery.request_timeout_seconds"
                    .to_string(),
            ));
        }

        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (FEDCOURIER__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("database.path", "data/fedcourier.db")?
            .set_default("database.max_connections", 8)?
            .set_default("database.busy_timeout_ms", 5000)?
            .set_default("delivery.max_attempts", 10)?
            .set_default("delivery.base_delay_seconds", 30)?
            .set_default("delivery.cap_delay_seconds", 21600)?
            .set_default("delivery.jitter_fraction", 0.2)?
            .set_default("delivery.batch_size", 50)?
            .set_default("delivery.claim_lease_timeout_seconds", 300)?
            .set_default("delivery.request_timeout_seconds", 30)?
            .set_default("delivery.workers", 4)?
            .set_default("delivery.poll_interval_ms", 1000)?
            .set_default("delivery.recovery_interval_seconds", 60)?
            .set_default("delivery.store_write_retries", 5)?
            .set_default("delivery.store_write_backoff_ms", 200)?
            .set_default("delivery.user_agent", "fedcourier/0.1.0")?
            .set_default("delivery.allow_private_destinations", false)?
            .set_default(
                "delivery.signing_key_bits",
                crate::federation::DEFAULT_KEY_BITS as i64,
            )?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("FEDCOURIER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.database.max_connections == 0 {
            return Err(AppError::Config(
                "database.max_connections must be greater than 0".to_string(),
            ));
        }

        if let Some(token) = &self.server.api_token {
            if token.trim().is_empty() {
                return Err(AppError::Config(
                    "server.api_token must not be blank when set".to_string(),
                ));
            }
        }

        self.delivery.validate()?;

        // The lease also has to outlast the write-back retries that follow
        // the request.
        let in_flight = self.delivery.request_timeout()
            + self
                .delivery
                .write_back_budget(self.database.busy_timeout_ms);
        if self.delivery.claim_lease_timeout() <= in_flight {
            return Err(AppError::Config(format!(
                "delivery.claim_lease_timeout_seconds must exceed the request timeout plus the \
                 store write-back budget ({}ms)",
                in_flight.as_millis()
            )));
        }

        Ok(())
    }
}
