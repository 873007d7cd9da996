//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use std::time::Duration;

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedcourier_http_requests_total", "Total number of admin API requests"),
        &["method", "endpoint", "status"]
    ).expect("metric can be created");

    // Delivery Metrics
    pub static ref DELIVERIES_ENQUEUED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedcourier_deliveries_enqueued_total", "Total number of delivery records created"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref DELIVERY_ATTEMPTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedcourier_delivery_attempts_total", "Total number of delivery attempts by outcome"),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref DELIVERY_TRANSITIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedcourier_delivery_transitions_total", "Total number of persisted delivery state transitions"),
        &["status"]
    ).expect("metric can be created");
    pub static ref DELIVERY_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "fedcourier_delivery_duration_seconds",
            "Outbound delivery request duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref DELIVERY_CLAIMS_LOST_TOTAL: IntCounter = IntCounter::new(
        "fedcourier_delivery_claims_lost_total",
        "Total number of claim attempts lost to another worker"
    ).expect("metric can be created");
    pub static ref DELIVERY_CLAIMS_RECOVERED_TOTAL: IntCounter = IntCounter::new(
        "fedcourier_delivery_claims_recovered_total",
        "Total number of stale claims reset to pending"
    ).expect("metric can be created");
    pub static ref DELIVERY_DURABILITY_ALARMS_TOTAL: IntCounter = IntCounter::new(
        "fedcourier_delivery_durability_alarms_total",
        "Total number of delivery outcomes that could not be persisted"
    ).expect("metric can be created");
    pub static ref DELIVERY_RECORDS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("fedcourier_delivery_records", "Delivery records by status at last stats query"),
        &["status"]
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedcourier_errors_total", "Total number of errors"),
        &["error_type"]
    ).expect("metric can be created");
}

/// Initialize metrics registry.
pub fn init_metrics() {
    REGISTRY
        .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
        .expect("HTTP_REQUESTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(DELIVERIES_ENQUEUED_TOTAL.clone()))
        .expect("DELIVERIES_ENQUEUED_TOTAL can be registered");
    REGISTRY
        .register(Box::new(DELIVERY_ATTEMPTS_TOTAL.clone()))
        .expect("DELIVERY_ATTEMPTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(DELIVERY_TRANSITIONS_TOTAL.clone()))
        .expect("DELIVERY_TRANSITIONS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(DELIVERY_DURATION_SECONDS.clone()))
        .expect("DELIVERY_DURATION_SECONDS can be registered");
    REGISTRY
        .register(Box::new(DELIVERY_CLAIMS_LOST_TOTAL.clone()))
        .expect("DELIVERY_CLAIMS_LOST_TOTAL can be registered");
    REGISTRY
        .register(Box::new(DELIVERY_CLAIMS_RECOVERED_TOTAL.clone()))
        .expect("DELIVERY_CLAIMS_RECOVERED_TOTAL can be registered");
    REGISTRY
        .register(Box::new(DELIVERY_DURABILITY_ALARMS_TOTAL.clone()))
        .expect("DELIVERY_DURABILITY_ALARMS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(DELIVERY_RECORDS.clone()))
        .expect("DELIVERY_RECORDS can be registered");
    REGISTRY
        .register(Box::new(ERRORS_TOTAL.clone()))
        .expect("ERRORS_TOTAL can be registered");

    tracing::info!("Metrics registry initialized");
}

/// Record one finished dispatch.
pub fn observe_attempt(outcome: &str, elapsed: Duration) {
    DELIVERY_ATTEMPTS_TOTAL.with_label_values(&[outcome]).inc();
    DELIVERY_DURATION_SECONDS
        .with_label_values(&[outcome])
        .observe(elapsed.as_secs_f64());
}
