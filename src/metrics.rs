//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("creatorsync_http_requests_total", "Total number of HTTP requests"),
        &["method", "endpoint", "status"]
    ).expect("metric can be created");

    // Graph API Metrics
    pub static ref GRAPH_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("creatorsync_graph_requests_total", "Total number of Graph API requests by outcome"),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref GRAPH_RETRIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("creatorsync_graph_retries_total", "Total number of Graph API retries by reason"),
        &["reason"]
    ).expect("metric can be created");
    pub static ref GRAPH_REQUEST_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "creatorsync_graph_request_duration_seconds",
            "Graph API request duration in seconds, including retries"
        ).buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
        &["outcome"]
    ).expect("metric can be created");

    // Sync Metrics
    pub static ref SYNC_RUNS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("creatorsync_sync_runs_total", "Total number of sync runs"),
        &["kind", "status"]
    ).expect("metric can be created");
    pub static ref SYNC_ITEMS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("creatorsync_sync_items_total", "Items persisted or failed during sync"),
        &["kind", "result"]
    ).expect("metric can be created");
    pub static ref ACTIVE_SYNCS: IntGauge = IntGauge::new(
        "creatorsync_active_syncs",
        "Number of syncs currently running"
    ).expect("metric can be created");

    // Webhook Metrics
    pub static ref WEBHOOK_DELIVERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("creatorsync_webhook_deliveries_total", "Total number of webhook deliveries"),
        &["result"]
    ).expect("metric can be created");

    // Cache Metrics
    pub static ref CACHE_HITS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("creatorsync_cache_hits_total", "Total number of cache hits"),
        &["cache_name"]
    ).expect("metric can be created");
    pub static ref CACHE_MISSES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("creatorsync_cache_misses_total", "Total number of cache misses"),
        &["cache_name"]
    ).expect("metric can be created");
    pub static ref CACHE_SIZE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("creatorsync_cache_size", "Current number of items in cache"),
        &["cache_name"]
    ).expect("metric can be created");

    // Background task Metrics
    pub static ref BACKGROUND_TASKS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("creatorsync_background_tasks_total", "Background tasks by final status"),
        &["task", "status"]
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("creatorsync_errors_total", "Total number of errors returned to clients"),
        &["error_type"]
    ).expect("metric can be created");
}

/// Register all metrics with the global registry.
///
/// Safe to call more than once; duplicate registrations are ignored.
pub fn init_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(HTTP_REQUESTS_TOTAL.clone()),
        Box::new(GRAPH_REQUESTS_TOTAL.clone()),
        Box::new(GRAPH_RETRIES_TOTAL.clone()),
        Box::new(GRAPH_REQUEST_DURATION_SECONDS.clone()),
        Box::new(SYNC_RUNS_TOTAL.clone()),
        Box::new(SYNC_ITEMS_TOTAL.clone()),
        Box::new(ACTIVE_SYNCS.clone()),
        Box::new(WEBHOOK_DELIVERIES_TOTAL.clone()),
        Box::new(CACHE_HITS_TOTAL.clone()),
        Box::new(CACHE_MISSES_TOTAL.clone()),
        Box::new(CACHE_SIZE.clone()),
        Box::new(BACKGROUND_TASKS_TOTAL.clone()),
        Box::new(ERRORS_TOTAL.clone()),
    ];

    for collector in collectors {
        if let Err(error) = REGISTRY.register(collector) {
            tracing::debug!(%error, "Metric already registered");
        }
    }
}
