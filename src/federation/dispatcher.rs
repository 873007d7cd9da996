//! Activity dispatch
//!
//! Performs one signed POST of an activity to a remote inbox and classifies
//! what happened. Nothing here returns an error to the caller: every failure
//! is folded into an [`AttemptOutcome`].

use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;

use crate::clock::Clock;
use crate::data::{DeliveryRecord, SigningKeyPair};
use crate::error::AppError;
use crate::federation::signature::{RequestMetadata, sign_request};

pub const ACTIVITY_CONTENT_TYPE: &str = "application/activity+json";

/// Result of a single delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Remote accepted the activity (2xx)
    Success { status_code: u16 },
    /// Worth trying again later: network error, timeout, 429, 5xx
    RetryableFailure {
        reason: String,
        status_code: Option<u16>,
    },
    /// Will never succeed as-is: other 4xx, bad destination, bad key
    TerminalFailure {
        reason: String,
        status_code: Option<u16>,
    },
}

impl AttemptOutcome {
    pub fn retryable(reason: impl Into<String>, status_code: Option<u16>) -> Self {
        Self::RetryableFailure {
            reason: reason.into(),
            status_code,
        }
    }

    pub fn terminal(reason: impl Into<String>, status_code: Option<u16>) -> Self {
        Self::TerminalFailure {
            reason: reason.into(),
            status_code,
        }
    }

    /// Metric/log label
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::RetryableFailure { .. } => "retryable",
            Self::TerminalFailure { .. } => "terminal",
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Success { status_code } => Some(*status_code),
            Self::RetryableFailure { status_code, .. }
            | Self::TerminalFailure { status_code, .. } => *status_code,
        }
    }
}

/// Classify a remote HTTP status.
pub fn classify_status(status: StatusCode) -> AttemptOutcome {
    let code = status.as_u16();

    if status.is_success() {
        AttemptOutcome::Success { status_code: code }
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        AttemptOutcome::retryable(status.to_string(), Some(code))
    } else if status.is_redirection() {
        AttemptOutcome::terminal(format!("redirect not followed: {}", status), Some(code))
    } else {
        AttemptOutcome::terminal(status.to_string(), Some(code))
    }
}

/// Performs a single delivery attempt.
pub trait Dispatch: Send + Sync + 'static {
    /// Exactly one outbound request, no internal retries.
    fn attempt(
        &self,
        record: &DeliveryRecord,
        payload: &[u8],
        key: &SigningKeyPair,
    ) -> impl Future<Output = AttemptOutcome> + Send;
}

/// Dispatcher tuning
#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    /// Hard bound on one request, connect through body
    pub request_timeout: Duration,
    pub user_agent: String,
    /// Permit loopback/private inbox hosts
    pub allow_private_destinations: bool,
}

impl DispatcherOptions {
    pub fn from_config(config: &crate::config::DeliveryConfig) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            user_agent: config.user_agent.clone(),
            allow_private_destinations: config.allow_private_destinations,
        }
    }
}

/// Dispatcher that delivers over HTTP(S) with reqwest
#[derive(Clone)]
pub struct HttpDispatcher {
    http_client: reqwest::Client,
    options: DispatcherOptions,
    clock: Arc<dyn Clock>,
}

impl HttpDispatcher {
    /// Build the HTTP client; redirects are never followed.
    pub fn new(options: DispatcherOptions, clock: Arc<dyn Clock>) -> Result<Self, AppError> {
        let http_client = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .user_agent(options.user_agent.clone())
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            http_client,
            options,
            clock,
        })
    }

    async fn send(
        &self,
        record: &DeliveryRecord,
        payload: &[u8],
        key: &SigningKeyPair,
    ) -> AttemptOutcome {
        let url = match validate_destination(
            &record.inbox_uri,
            self.options.allow_private_destinations,
        ) {
            Ok(url) => url,
            Err(reason) => return AttemptOutcome::terminal(reason, None),
        };

        let metadata = RequestMetadata {
            method: "POST",
            url: &url,
            date: self.clock.now(),
            body: payload,
        };
        let sig_headers = match sign_request(&key.private_key_pem, &key.key_id, &metadata) {
            Ok(headers) => headers,
            Err(error) => {
                tracing::warn!(
                    delivery_id = %record.id,
                    actor_uri = %record.actor_uri,
                    error = %error,
                    "Signing failed"
                );
                return AttemptOutcome::terminal(format!("signing key invalid: {}", error), None);
            }
        };

        let request = self
            .http_client
            .post(url)
            .header("Content-Type", ACTIVITY_CONTENT_TYPE)
            .header("Accept", ACTIVITY_CONTENT_TYPE)
            .header("Date", sig_headers.date)
            .header("Digest", sig_headers.digest)
            .header("Signature", sig_headers.signature)
            .body(payload.to_vec());

        match request.send().await {
            Ok(response) => classify_status(response.status()),
            Err(error) if error.is_timeout() => AttemptOutcome::retryable("timeout", None),
            Err(error) => AttemptOutcome::retryable(format!("network error: {}", error), None),
        }
    }
}

impl Dispatch for HttpDispatcher {
    async fn attempt(
        &self,
        record: &DeliveryRecord,
        payload: &[u8],
        key: &SigningKeyPair,
    ) -> AttemptOutcome {
        let started = std::time::Instant::now();
        let outcome = self.send(record, payload, key).await;
        crate::metrics::observe_attempt(outcome.label(), started.elapsed());

        tracing::debug!(
            delivery_id = %record.id,
            inbox_uri = %record.inbox_uri,
            outcome = outcome.label(),
            status_code = ?outcome.status_code(),
            "Delivery attempt finished"
        );

        outcome
    }
}

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

/// Check that an inbox URI is something we are willing to POST to.
///
/// # Errors
/// A human-readable reason, recorded as the terminal failure message
pub fn validate_destination(inbox_uri: &str, allow_private: bool) -> Result<url::Url, String> {
    let url = url::Url::parse(inbox_uri).map_err(|e| format!("malformed destination: {}", e))?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(format!(
                "malformed destination: unsupported scheme {}",
                scheme
            ));
        }
    }

    let host = url
        .host_str()
        .ok_or_else(|| "malformed destination: missing host".to_string())?;

    if !url.username().is_empty() || url.password().is_some() {
        return Err("malformed destination: user info not allowed".to_string());
    }

    if !allow_private && is_disallowed_host(host) {
        return Err(format!("malformed destination: disallowed host {}", host));
    }

    Ok(url)
}
