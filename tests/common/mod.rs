//! Common test utilities for E2E tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, StatusCode, Uri},
};
use chrono::Utc;
use fedcourier::data::SigningKeyPair;
use fedcourier::{AppState, config};
use tempfile::TempDir;
use tokio::net::TcpListener;

pub const API_TOKEN: &str = "test-admin-token";
pub const ACTOR_URI: &str = "https://social.example/users/alice";

/// Shared 1024-bit keypair so each test binary generates it once.
pub fn test_keypair() -> &'static (String, String) {
    static KEYPAIR: OnceLock<(String, String)> = OnceLock::new();
    KEYPAIR.get_or_init(|| fedcourier::federation::generate_pem_keypair(1024).unwrap())
}

/// Request captured by [`MockInbox`]
#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
struct ScriptedReply {
    status: StatusCode,
    delay: Duration,
}

#[derive(Clone, Default)]
struct InboxState {
    received: Arc<Mutex<Vec<ReceivedRequest>>>,
    replies: Arc<Mutex<VecDeque<ScriptedReply>>>,
}

/// Remote inbox stand-in
///
/// Records every request and answers with scripted statuses in order,
/// falling back to 202 Accepted once the script runs out.
pub struct MockInbox {
    pub addr: SocketAddr,
    state: InboxState,
}

impl MockInbox {
    pub async fn start() -> Self {
        let state = InboxState::default();
        let app = Router::new()
            .fallback(record_request)
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    /// Queue the status for the next unanswered request
    pub fn respond_with(&self, status: u16) {
        self.respond_after(status, Duration::ZERO);
    }

    /// Queue a status that is only sent after `delay`
    pub fn respond_after(&self, status: u16, delay: Duration) {
        self.state.replies.lock().unwrap().push_back(ScriptedReply {
            status: StatusCode::from_u16(status).unwrap(),
            delay,
        });
    }

    pub fn inbox_url(&self, user: &str) -> String {
        format!("http://{}/users/{}/inbox", self.addr, user)
    }

    pub fn received(&self) -> Vec<ReceivedRequest> {
        self.state.received.lock().unwrap().clone()
    }
}

async fn record_request(
    State(state): State<InboxState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    state.received.lock().unwrap().push(ReceivedRequest {
        method,
        path: uri.path().to_string(),
        headers,
        body: body.to_vec(),
    });

    let reply = state
        .replies
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or(ScriptedReply {
            status: StatusCode::ACCEPTED,
            delay: Duration::ZERO,
        });

    if !reply.delay.is_zero() {
        tokio::time::sleep(reply.delay).await;
    }
    reply.status
}

/// Configuration for tests: temp database, loopback inboxes allowed,
/// one-second request timeout and a one-minute base retry delay.
pub fn test_config(temp_dir: &TempDir) -> config::AppConfig {
    config::AppConfig {
        server: config::ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0, // Let OS assign port
            api_token: None,
        },
        database: config::DatabaseConfig {
            path: temp_dir.path().join("test.db"),
            max_connections: 4,
            busy_timeout_ms: 1_000,
        },
        delivery: config::DeliveryConfig {
            max_attempts: 3,
            base_delay_seconds: 60,
            cap_delay_seconds: 3_600,
            jitter_fraction: 0.0,
            batch_size: 10,
            claim_lease_timeout_seconds: 5,
            request_timeout_seconds: 1,
            workers: 1,
            poll_interval_ms: 50,
            recovery_interval_seconds: 60,
            store_write_retries: 2,
            store_write_backoff_ms: 10,
            user_agent: "fedcourier-test".to_string(),
            allow_private_destinations: true,
            signing_key_bits: 1024,
        },
        logging: config::LoggingConfig {
            level: "info".to_string(),
            format: "pretty".to_string(),
        },
    }
}

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a new test server instance
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server whose admin API requires [`API_TOKEN`]
    pub async fn with_api_token() -> Self {
        Self::with_config(|config| config.server.api_token = Some(API_TOKEN.to_string())).await
    }

    pub async fn with_config(customize: impl FnOnce(&mut config::AppConfig)) -> Self {
        // Create temporary directory for test database
        let temp_dir = TempDir::new().unwrap();
        let mut config = test_config(&temp_dir);
        customize(&mut config);

        // Initialize app state; workers are not spawned so tests drive polls
        let state = AppState::new(config).await.unwrap();

        // Create HTTP client
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let addr_str = format!("http://{}", addr);

        let app = fedcourier::build_router(state.clone());

        // Spawn server in background
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr: addr_str,
            state,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Get base URL for API requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// Store the shared test keypair for an actor
    pub async fn install_signing_key(&self, actor_uri: &str) -> SigningKeyPair {
        let (private_key_pem, public_key_pem) = test_keypair();
        let now = Utc::now();
        let key = SigningKeyPair {
            actor_uri: actor_uri.to_string(),
            key_id: fedcourier::federation::key_id_for_actor(actor_uri),
            private_key_pem: private_key_pem.clone(),
            public_key_pem: public_key_pem.clone(),
            created_at: now,
            updated_at: now,
        };
        self.state.db.upsert_signing_key(&key).await.unwrap();
        key
    }

    /// Enqueue through the service, bypassing HTTP
    pub async fn enqueue(
        &self,
        activity_id: &str,
        inbox_uris: Vec<String>,
    ) -> Vec<fedcourier::data::DeliveryRecord> {
        self.state
            .deliveries
            .enqueue(fedcourier::service::EnqueueRequest {
                activity_id: activity_id.to_string(),
                activity_type: "Create".to_string(),
                actor_uri: ACTOR_URI.to_string(),
                payload: sample_activity(activity_id),
                inbox_uris,
            })
            .await
            .unwrap()
    }
}

pub fn sample_activity(activity_id: &str) -> serde_json::Value {
    serde_json::json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": activity_id,
        "type": "Create",
        "actor": ACTOR_URI,
        "object": {
            "type": "Note",
            "content": "hello fediverse"
        }
    })
}
