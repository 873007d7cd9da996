//! Delivery coordinator
//!
//! Polls the store for due records, claims each one, hands it to the
//! dispatcher and writes the resulting transition back. The store is the
//! only shared state: any number of coordinators (tasks or processes) may
//! run against it and the conditional claim keeps each record in at most one
//! worker's hands.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::DeliveryConfig;
use crate::data::{DeliveryRecord, DeliveryStore, DeliveryUpdate};
use crate::error::AppError;
use crate::federation::{AttemptOutcome, Dispatch};
use crate::metrics;
use crate::service::lifecycle::resolve_attempt;
use crate::service::retry::RetryPolicy;

/// Coordinator tuning
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Due records fetched per poll
    pub batch_size: u32,
    /// Concurrent worker loops started by [`DeliveryCoordinator::spawn`]
    pub workers: usize,
    /// Idle wait between polls
    pub poll_interval: Duration,
    /// Claims older than this are returned to `pending` by recovery
    pub claim_lease_timeout: Duration,
    pub recovery_interval: Duration,
    /// Extra write-back attempts after the first failure
    pub store_write_retries: u32,
    /// First backoff between write-back attempts; doubles each time
    pub store_write_backoff: Duration,
}

impl CoordinatorOptions {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            workers: config.workers,
            poll_interval: config.poll_interval(),
            claim_lease_timeout: config.claim_lease_timeout(),
            recovery_interval: config.recovery_interval(),
            store_write_retries: config.store_write_retries,
            store_write_backoff: config.store_write_backoff(),
        }
    }
}

/// What one poll did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub fetched: usize,
    pub claimed: usize,
    pub lost_claims: usize,
    pub sent: usize,
    pub rescheduled: usize,
    pub dead_lettered: usize,
    /// Outcomes that could not be persisted
    pub failed_writes: usize,
}

impl PollSummary {
    fn record(&mut self, update: &DeliveryUpdate) {
        match update {
            DeliveryUpdate::Sent { .. } => self.sent += 1,
            DeliveryUpdate::Rescheduled { .. } => self.rescheduled += 1,
            DeliveryUpdate::DeadLettered { .. } => self.dead_lettered += 1,
        }
    }
}

/// Drives records from `pending` to a terminal state.
pub struct DeliveryCoordinator<S, D> {
    store: Arc<S>,
    dispatcher: Arc<D>,
    policy: RetryPolicy,
    options: CoordinatorOptions,
    clock: Arc<dyn Clock>,
    notify: Arc<Notify>,
    shutdown: CancellationToken,
}

impl<S: DeliveryStore, D: Dispatch> DeliveryCoordinator<S, D> {
    pub fn new(
        store: Arc<S>,
        dispatcher: Arc<D>,
        policy: RetryPolicy,
        options: CoordinatorOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            policy,
            options,
            clock,
            notify: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Handle producers use to wake an idle worker.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Token that stops every spawned loop when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run one poll: fetch due records, claim, dispatch, persist.
    ///
    /// Performs no writes when nothing is due. Stops claiming new records
    /// once shutdown has been requested.
    ///
    /// # Errors
    /// Only when the due query itself fails; per-record problems are logged
    /// and counted in the summary.
    pub async fn poll_once(&self) -> Result<PollSummary, AppError> {
        let now = self.clock.now();
        let due = self.store.fetch_due(now, self.options.batch_size).await?;

        let mut summary = PollSummary {
            fetched: due.len(),
            ..PollSummary::default()
        };

        for record in due {
            if self.shutdown.is_cancelled() {
                break;
            }

            let Some(claimed_at) = self.store.claim(&record.id, self.clock.now()).await? else {
                summary.lost_claims += 1;
                metrics::DELIVERY_CLAIMS_LOST_TOTAL.inc();
                tracing::debug!(delivery_id = %record.id, "Claim lost to another worker");
                continue;
            };
            summary.claimed += 1;

            match self.deliver_claimed(&record, claimed_at).await {
                Ok(update) => summary.record(&update),
                Err(error) => {
                    summary.failed_writes += 1;
                    tracing::error!(
                        delivery_id = %record.id,
                        inbox_uri = %record.inbox_uri,
                        error = %error,
                        "Delivery outcome not persisted"
                    );
                }
            }
        }

        if summary.fetched > 0 {
            tracing::debug!(?summary, "Poll finished");
        }

        Ok(summary)
    }

    /// Dispatch a record this worker holds and persist the outcome.
    async fn deliver_claimed(
        &self,
        record: &DeliveryRecord,
        claimed_at: DateTime<Utc>,
    ) -> Result<DeliveryUpdate, AppError> {
        let outcome = match self.load_inputs(record).await? {
            Ok((payload, key)) => {
                self.dispatcher
                    .attempt(record, payload.as_bytes(), &key)
                    .await
            }
            Err(outcome) => {
                metrics::DELIVERY_ATTEMPTS_TOTAL
                    .with_label_values(&[outcome.label()])
                    .inc();
                outcome
            }
        };

        let attempted_at = self.clock.now();
        let update = resolve_attempt(
            record,
            &outcome,
            &self.policy,
            attempted_at,
            &mut rand::thread_rng(),
        );

        self.persist_update(record, claimed_at, &update).await?;
        log_transition(record, &update);
        metrics::DELIVERY_TRANSITIONS_TOTAL
            .with_label_values(&[update.status_label()])
            .inc();

        Ok(update)
    }

    /// Payload and key for a record, or the terminal outcome when either is gone.
    async fn load_inputs(
        &self,
        record: &DeliveryRecord,
    ) -> Result<Result<(String, crate::data::SigningKeyPair), AttemptOutcome>, AppError> {
        let Some(payload) = self.store.load_activity_payload(&record.activity_id).await? else {
            return Ok(Err(AttemptOutcome::terminal(
                format!("activity payload missing for {}", record.activity_id),
                None,
            )));
        };

        let Some(key) = self.store.load_signing_key(&record.actor_uri).await? else {
            return Ok(Err(AttemptOutcome::terminal(
                format!("signing key missing for {}", record.actor_uri),
                None,
            )));
        };

        Ok(Ok((payload, key)))
    }

    /// Write an update back, retrying transient store failures.
    ///
    /// The dispatch is never repeated here; only the write is.
    async fn persist_update(
        &self,
        record: &DeliveryRecord,
        claimed_at: DateTime<Utc>,
        update: &DeliveryUpdate,
    ) -> Result<(), AppError> {
        let mut backoff = self.options.store_write_backoff;
        let mut attempt = 0;

        loop {
            let error = match self
                .store
                .apply_update(&record.id, claimed_at, update, self.clock.now())
                .await
            {
                Ok(()) => return Ok(()),
                Err(error) => error,
            };

            if !error.is_transient_store_error() {
                tracing::warn!(
                    delivery_id = %record.id,
                    error = %error,
                    "Delivery update rejected by store"
                );
                return Err(error);
            }

            if attempt >= self.options.store_write_retries {
                metrics::DELIVERY_DURABILITY_ALARMS_TOTAL.inc();
                tracing::error!(
                    delivery_id = %record.id,
                    inbox_uri = %record.inbox_uri,
                    intended_status = update.status_label(),
                    retry_count = update.retry_count(),
                    attempts = attempt + 1,
                    error = %error,
                    "Durability alarm: delivery outcome could not be persisted"
                );
                return Err(AppError::StoreUnavailable(format!(
                    "failed to persist delivery {} after {} attempts: {}",
                    record.id,
                    attempt + 1,
                    error
                )));
            }

            attempt += 1;
            tracing::warn!(
                delivery_id = %record.id,
                attempt,
                error = %error,
                "Store write failed, retrying"
            );
            tokio::time::sleep(backoff).await;
            backoff = backoff.saturating_mul(2);
        }
    }

    /// Return abandoned `sending` records to `pending`.
    pub async fn recover_stale_claims(&self) -> Result<u64, AppError> {
        let now = self.clock.now();
        let lease = chrono::Duration::from_std(self.options.claim_lease_timeout)
            .map_err(|e| AppError::Config(format!("claim lease timeout out of range: {}", e)))?;
        let cutoff = now - lease;

        let recovered = self.store.reset_stale_claims(cutoff, now).await?;
        if recovered > 0 {
            metrics::DELIVERY_CLAIMS_RECOVERED_TOTAL.inc_by(recovered);
            tracing::warn!(recovered, %cutoff, "Recovered stale delivery claims");
            self.notify.notify_one();
        }

        Ok(recovered)
    }

    /// Start the worker loops and the recovery task.
    ///
    /// All of them stop once [`Self::shutdown_token`] is cancelled; a worker
    /// finishes the record it is processing first.
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.options.workers + 1);

        handles.push(tokio::spawn(self.clone().recovery_loop()));
        for worker_id in 0..self.options.workers {
            handles.push(tokio::spawn(self.clone().worker_loop(worker_id)));
        }

        tracing::info!(
            workers = self.options.workers,
            batch_size = self.options.batch_size,
            "Delivery coordinator started"
        );

        handles
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        tracing::info!(worker_id, "Delivery worker starting");

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match self.poll_once().await {
                // A full batch that made progress: there is probably more due.
                Ok(summary)
                    if summary.claimed > 0
                        && summary.fetched >= self.options.batch_size as usize => {}
                Ok(_) => {
                    tokio::select! {
                        () = tokio::time::sleep(self.options.poll_interval) => {}
                        () = self.notify.notified() => {}
                        () = self.shutdown.cancelled() => break,
                    }
                }
                Err(error) => {
                    tracing::error!(worker_id, error = %error, "Delivery poll failed");
                    tokio::select! {
                        () = tokio::time::sleep(self.options.poll_interval) => {}
                        () = self.shutdown.cancelled() => break,
                    }
                }
            }
        }

        tracing::info!(worker_id, "Delivery worker stopped");
    }

    async fn recovery_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.options.recovery_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            // First tick completes immediately, so recovery also runs at startup
            tokio::select! {
                _ = interval.tick() => {}
                () = self.shutdown.cancelled() => break,
            }

            if let Err(error) = self.recover_stale_claims().await {
                tracing::error!(error = %error, "Stale claim recovery failed");
            }
        }
    }
}

fn log_transition(record: &DeliveryRecord, update: &DeliveryUpdate) {
    match update {
        DeliveryUpdate::Sent {
            status_code,
            retry_count,
            ..
        } => tracing::info!(
            delivery_id = %record.id,
            inbox_uri = %record.inbox_uri,
            activity_type = %record.activity_type,
            status_code,
            retry_count,
            "Delivered"
        ),
        DeliveryUpdate::Rescheduled {
            error,
            retry_count,
            next_retry_at,
            ..
        } => tracing::warn!(
            delivery_id = %record.id,
            inbox_uri = %record.inbox_uri,
            retry_count,
            %next_retry_at,
            error = %error,
            "Delivery failed, rescheduled"
        ),
        DeliveryUpdate::DeadLettered {
            error, retry_count, ..
        } => tracing::warn!(
            delivery_id = %record.id,
            inbox_uri = %record.inbox_uri,
            retry_count,
            error = %error,
            "Delivery dead-lettered"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::data::{Database, DeliveryStatus, NewActivity, SigningKeyPair};
    use chrono::{DateTime, TimeZone, Utc};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use tempfile::TempDir;

    const ACTOR: &str = "https://social.example/users/alice";

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 1, 12, 0, 0).unwrap()
    }

    /// Dispatcher that replays scripted outcomes and records inboxes hit
    #[derive(Default)]
    struct ScriptedDispatcher {
        outcomes: Mutex<VecDeque<AttemptOutcome>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedDispatcher {
        fn with(outcomes: impl IntoIterator<Item = AttemptOutcome>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into_iter().collect()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl Dispatch for ScriptedDispatcher {
        async fn attempt(
            &self,
            record: &DeliveryRecord,
            _payload: &[u8],
            _key: &SigningKeyPair,
        ) -> AttemptOutcome {
            self.calls.lock().unwrap().push(record.inbox_uri.clone());
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(AttemptOutcome::Success { status_code: 200 })
        }
    }

    /// Store wrapper that counts writes and can fail `apply_update`
    struct InstrumentedStore {
        inner: Database,
        writes: AtomicUsize,
        failing_updates: AtomicU32,
        update_attempts: AtomicUsize,
    }

    impl InstrumentedStore {
        fn new(inner: Database) -> Self {
            Self {
                inner,
                writes: AtomicUsize::new(0),
                failing_updates: AtomicU32::new(0),
                update_attempts: AtomicUsize::new(0),
            }
        }
    }

    impl DeliveryStore for InstrumentedStore {
        async fn fetch_due(
            &self,
            now: DateTime<Utc>,
            limit: u32,
        ) -> Result<Vec<DeliveryRecord>, AppError> {
            self.inner.fetch_due(now, limit).await
        }

        async fn claim(
            &self,
            id: &str,
            now: DateTime<Utc>,
        ) -> Result<Option<DateTime<Utc>>, AppError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.claim(id, now).await
        }

        async fn load_activity_payload(
            &self,
            activity_id: &str,
        ) -> Result<Option<String>, AppError> {
            self.inner.load_activity_payload(activity_id).await
        }

        async fn load_signing_key(
            &self,
            actor_uri: &str,
        ) -> Result<Option<SigningKeyPair>, AppError> {
            self.inner.load_signing_key(actor_uri).await
        }

        async fn apply_update(
            &self,
            id: &str,
            claimed_at: DateTime<Utc>,
            update: &DeliveryUpdate,
            now: DateTime<Utc>,
        ) -> Result<(), AppError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.update_attempts.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failing_updates.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failing_updates.store(remaining - 1, Ordering::SeqCst);
                return Err(AppError::Database(sqlx::Error::PoolTimedOut));
            }
            self.inner.apply_update(id, claimed_at, update, now).await
        }

        async fn reset_stale_claims(
            &self,
            cutoff: DateTime<Utc>,
            now: DateTime<Utc>,
        ) -> Result<u64, AppError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.reset_stale_claims(cutoff, now).await
        }
    }

    struct Harness {
        db: Database,
        store: Arc<InstrumentedStore>,
        dispatcher: Arc<ScriptedDispatcher>,
        coordinator: DeliveryCoordinator<InstrumentedStore, ScriptedDispatcher>,
        now: Arc<Mutex<DateTime<Utc>>>,
        _temp_dir: TempDir,
    }

    impl Harness {
        fn set_now(&self, now: DateTime<Utc>) {
            *self.now.lock().unwrap() = now;
        }
    }

    fn options() -> CoordinatorOptions {
        CoordinatorOptions {
            batch_size: 10,
            workers: 1,
            poll_interval: Duration::from_millis(10),
            claim_lease_timeout: Duration::from_secs(300),
            recovery_interval: Duration::from_secs(60),
            store_write_retries: 3,
            store_write_backoff: Duration::from_millis(1),
        }
    }

    /// Zero backoff so a rescheduled record is due again at the same instant
    fn immediate_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::ZERO,
            cap_delay: Duration::ZERO,
            jitter_fraction: 0.0,
        }
    }

    async fn harness(
        policy: RetryPolicy,
        outcomes: impl IntoIterator<Item = AttemptOutcome>,
    ) -> Harness {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::connect(&temp_dir.path().join("test.db"))
            .await
            .unwrap();

        let (private_key_pem, public_key_pem) = crate::federation::keys::test_keypair();
        db.upsert_signing_key(&SigningKeyPair {
            actor_uri: ACTOR.to_string(),
            key_id: crate::federation::key_id_for_actor(ACTOR),
            private_key_pem: private_key_pem.to_string(),
            public_key_pem: public_key_pem.to_string(),
            created_at: t0(),
            updated_at: t0(),
        })
        .await
        .unwrap();

        let now = Arc::new(Mutex::new(t0()));
        let mut clock = MockClock::new();
        let clock_now = now.clone();
        clock
            .expect_now()
            .returning(move || *clock_now.lock().unwrap());

        let store = Arc::new(InstrumentedStore::new(db.clone()));
        let dispatcher = Arc::new(ScriptedDispatcher::with(outcomes));
        let coordinator = DeliveryCoordinator::new(
            store.clone(),
            dispatcher.clone(),
            policy,
            options(),
            Arc::new(clock),
        );

        Harness {
            db,
            store,
            dispatcher,
            coordinator,
            now,
            _temp_dir: temp_dir,
        }
    }

    async fn enqueue(db: &Database, activity_id: &str, inboxes: &[&str]) -> Vec<String> {
        let activity = NewActivity {
            activity_id: activity_id.to_string(),
            activity_type: "Create".to_string(),
            actor_uri: ACTOR.to_string(),
            payload: r#"{"type":"Create"}"#.to_string(),
        };
        let inboxes: Vec<String> = inboxes.iter().map(|s| s.to_string()).collect();
        db.enqueue_activity(&activity, &inboxes, t0())
            .await
            .unwrap()
            .into_iter()
            .map(|record| record.id)
            .collect()
    }

    #[tokio::test]
    async fn poll_with_nothing_due_performs_no_writes() {
        let h = harness(immediate_policy(3), []).await;

        let summary = h.coordinator.poll_once().await.unwrap();

        assert_eq!(summary, PollSummary::default());
        assert_eq!(h.store.writes.load(Ordering::SeqCst), 0);
        assert_eq!(h.dispatcher.call_count(), 0);
    }

    #[tokio::test]
    async fn success_marks_record_sent() {
        let h = harness(
            immediate_policy(3),
            [AttemptOutcome::Success { status_code: 200 }],
        )
        .await;
        let ids = enqueue(&h.db, "act-1", &["https://remote.example/inbox"]).await;

        let summary = h.coordinator.poll_once().await.unwrap();
        assert_eq!(summary.sent, 1);

        let record = h.db.get_delivery(&ids[0]).await.unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::Sent);
        assert_eq!(record.sent_at, Some(t0()));
        assert_eq!(record.response_status_code.as_deref(), Some("200"));
        assert!(record.next_retry_at.is_none());
    }

    #[tokio::test]
    async fn three_timeouts_exhaust_three_attempts() {
        let timeout = AttemptOutcome::retryable("timeout", None);
        let h = harness(immediate_policy(3), vec![timeout; 3]).await;
        let ids = enqueue(&h.db, "act-1", &["https://remote.example/inbox"]).await;

        for _ in 0..3 {
            h.coordinator.poll_once().await.unwrap();
        }

        let record = h.db.get_delivery(&ids[0]).await.unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::DeadLettered);
        assert_eq!(record.retry_count, 3);
        assert!(record.next_retry_at.is_none());
        assert!(record.error_message.unwrap().contains("timeout"));

        // Dead letters are never picked up again
        let summary = h.coordinator.poll_once().await.unwrap();
        assert_eq!(summary.fetched, 0);
        assert_eq!(h.dispatcher.call_count(), 3);
    }

    #[tokio::test]
    async fn gone_dead_letters_on_first_attempt() {
        let h = harness(
            immediate_policy(10),
            [AttemptOutcome::terminal("410 Gone", Some(410))],
        )
        .await;
        let ids = enqueue(&h.db, "act-1", &["https://remote.example/inbox"]).await;

        let summary = h.coordinator.poll_once().await.unwrap();
        assert_eq!(summary.dead_lettered, 1);

        let record = h.db.get_delivery(&ids[0]).await.unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::DeadLettered);
        assert_eq!(record.retry_count, 1);
        assert!(record.next_retry_at.is_none());
        assert_eq!(record.error_message.as_deref(), Some("410 Gone"));
        assert_eq!(record.response_status_code.as_deref(), Some("410"));
    }

    #[tokio::test]
    async fn retryable_failure_is_rescheduled_with_backoff() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(30),
            cap_delay: Duration::from_secs(3600),
            jitter_fraction: 0.0,
        };
        let h = harness(
            policy,
            [AttemptOutcome::retryable("503 Service Unavailable", Some(503))],
        )
        .await;
        let ids = enqueue(&h.db, "act-1", &["https://remote.example/inbox"]).await;

        let summary = h.coordinator.poll_once().await.unwrap();
        assert_eq!(summary.rescheduled, 1);

        let record = h.db.get_delivery(&ids[0]).await.unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::Pending);
        assert_eq!(record.retry_count, 1);
        assert_eq!(record.next_retry_at, Some(t0() + chrono::Duration::seconds(30)));

        // Not due yet
        assert_eq!(h.coordinator.poll_once().await.unwrap().fetched, 0);

        h.set_now(t0() + chrono::Duration::seconds(30));
        let summary = h.coordinator.poll_once().await.unwrap();
        assert_eq!(summary.sent, 1);
    }

    #[tokio::test]
    async fn missing_signing_key_dead_letters() {
        let h = harness(immediate_policy(3), []).await;
        let activity = NewActivity {
            activity_id: "act-1".to_string(),
            activity_type: "Announce".to_string(),
            actor_uri: "https://social.example/users/nobody".to_string(),
            payload: "{}".to_string(),
        };
        let created = h
            .db
            .enqueue_activity(&activity, &["https://remote.example/inbox".to_string()], t0())
            .await
            .unwrap();

        let summary = h.coordinator.poll_once().await.unwrap();
        assert_eq!(summary.dead_lettered, 1);
        assert_eq!(h.dispatcher.call_count(), 0);

        let record = h.db.get_delivery(&created[0].id).await.unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::DeadLettered);
        assert_eq!(record.retry_count, 1);
        assert!(record.error_message.unwrap().contains("signing key missing"));
    }

    #[tokio::test]
    async fn transient_write_failure_is_retried_without_redispatch() {
        let h = harness(
            immediate_policy(3),
            [AttemptOutcome::Success { status_code: 202 }],
        )
        .await;
        let ids = enqueue(&h.db, "act-1", &["https://remote.example/inbox"]).await;
        h.store.failing_updates.store(2, Ordering::SeqCst);

        let summary = h.coordinator.poll_once().await.unwrap();

        assert_eq!(summary.sent, 1);
        assert_eq!(h.dispatcher.call_count(), 1);
        assert_eq!(h.store.update_attempts.load(Ordering::SeqCst), 3);
        let record = h.db.get_delivery(&ids[0]).await.unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::Sent);
    }

    #[tokio::test]
    async fn exhausted_write_retries_raise_durability_alarm() {
        let h = harness(
            immediate_policy(3),
            [AttemptOutcome::Success { status_code: 202 }],
        )
        .await;
        let ids = enqueue(&h.db, "act-1", &["https://remote.example/inbox"]).await;
        h.store.failing_updates.store(100, Ordering::SeqCst);
        let alarms_before = metrics::DELIVERY_DURABILITY_ALARMS_TOTAL.get();

        let summary = h.coordinator.poll_once().await.unwrap();

        assert_eq!(summary.failed_writes, 1);
        assert_eq!(h.dispatcher.call_count(), 1);
        // One initial write plus the configured retries
        assert_eq!(h.store.update_attempts.load(Ordering::SeqCst), 4);
        assert!(metrics::DELIVERY_DURABILITY_ALARMS_TOTAL.get() > alarms_before);

        // Left in flight for the recovery pass
        let record = h.db.get_delivery(&ids[0]).await.unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::Sending);
    }

    #[tokio::test]
    async fn recovery_resets_expired_claims_only() {
        let h = harness(immediate_policy(3), []).await;
        let ids = enqueue(&h.db, "act-1", &["https://remote.example/inbox"]).await;
        assert!(h.db.claim(&ids[0], t0()).await.unwrap().is_some());

        h.set_now(t0() + chrono::Duration::seconds(299));
        assert_eq!(h.coordinator.recover_stale_claims().await.unwrap(), 0);

        h.set_now(t0() + chrono::Duration::seconds(301));
        assert_eq!(h.coordinator.recover_stale_claims().await.unwrap(), 1);

        let record = h.db.get_delivery(&ids[0]).await.unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::Pending);
        assert_eq!(record.retry_count, 0);
    }

    #[tokio::test]
    async fn write_back_after_lease_loss_does_not_touch_new_claim() {
        let h = harness(
            immediate_policy(3),
            [AttemptOutcome::retryable("connection reset", None)],
        )
        .await;
        let ids = enqueue(&h.db, "act-1", &["https://remote.example/inbox"]).await;
        let record = h.db.get_delivery(&ids[0]).await.unwrap().unwrap();

        // First worker claims, then stalls past the lease
        let stale_claim = h.db.claim(&ids[0], t0()).await.unwrap().unwrap();
        h.set_now(t0() + chrono::Duration::seconds(301));
        assert_eq!(h.coordinator.recover_stale_claims().await.unwrap(), 1);

        // Second worker takes the record over
        let fresh_claim = h
            .db
            .claim(&ids[0], h.coordinator.clock.now())
            .await
            .unwrap()
            .unwrap();

        let error = h
            .coordinator
            .deliver_claimed(&record, stale_claim)
            .await
            .unwrap_err();
        assert!(matches!(error, AppError::Conflict(_)));
        assert_eq!(h.dispatcher.call_count(), 1);

        let held = h.db.get_delivery(&ids[0]).await.unwrap().unwrap();
        assert_eq!(held.status, DeliveryStatus::Sending);
        assert_eq!(held.retry_count, 0);
        assert_eq!(held.claimed_at, Some(fresh_claim));
        assert!(held.error_message.is_none());

        // The current holder still completes normally
        let update = h
            .coordinator
            .deliver_claimed(&record, fresh_claim)
            .await
            .unwrap();
        assert_eq!(update.status_label(), "sent");
        let sent = h.db.get_delivery(&ids[0]).await.unwrap().unwrap();
        assert_eq!(sent.status, DeliveryStatus::Sent);
        assert_eq!(sent.retry_count, 1);
    }

    #[tokio::test]
    async fn spawned_workers_drain_queue_and_stop_on_shutdown() {
        let h = harness(immediate_policy(3), []).await;
        let ids = enqueue(
            &h.db,
            "act-1",
            &["https://a.example/inbox", "https://b.example/inbox"],
        )
        .await;

        let coordinator = Arc::new(h.coordinator);
        let handles = coordinator.spawn();

        let mut delivered = false;
        for _ in 0..200 {
            let stats = h.db.count_by_status().await.unwrap();
            if stats.sent == 2 {
                delivered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(delivered, "workers did not deliver both records");

        coordinator.shutdown_token().cancel();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .unwrap()
                .unwrap();
        }

        for id in ids {
            let record = h.db.get_delivery(&id).await.unwrap().unwrap();
            assert_eq!(record.status, DeliveryStatus::Sent);
        }
    }
}
