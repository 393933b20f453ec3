//! Prometheus metrics registry and instruments.
//!
//! Instruments are created lazily and recorded from the data layer.
//! Registration on [`REGISTRY`] is left to the hosting process.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::time::Duration;

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Database Metrics
    pub static ref DB_QUERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("sqlcontext_db_queries_total", "Total number of database commands"),
        &["operation", "status"]
    ).expect("metric can be created");
    pub static ref DB_QUERY_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "sqlcontext_db_query_duration_seconds",
            "Database command duration in seconds"
        ).buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        &["operation"]
    ).expect("metric can be created");
    pub static ref DB_CONNECTIONS_ACTIVE: IntGauge = IntGauge::new(
        "sqlcontext_db_connections_active",
        "Current number of open context connections"
    ).expect("metric can be created");

    // Cache Metrics
    pub static ref CACHE_HITS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("sqlcontext_cache_hits_total", "Total number of cache hits"),
        &["kind"]
    ).expect("metric can be created");
    pub static ref CACHE_MISSES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("sqlcontext_cache_misses_total", "Total number of cache misses"),
        &["kind"]
    ).expect("metric can be created");
    pub static ref CACHE_SIZE: IntGauge = IntGauge::new(
        "sqlcontext_cache_size",
        "Current number of entries in the entity cache"
    ).expect("metric can be created");

    // Checkout Metrics
    pub static ref CHECKOUT_TICKS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("sqlcontext_checkout_ticks_total", "Total number of connection checkout ticks"),
        &["status"]
    ).expect("metric can be created");
}

/// Register every instrument on [`REGISTRY`].
///
/// Call once per process; a second call fails with `AlreadyReg`.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    REGISTRY.register(Box::new(DB_QUERIES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DB_QUERY_DURATION_SECONDS.clone()))?;
    REGISTRY.register(Box::new(DB_CONNECTIONS_ACTIVE.clone()))?;
    REGISTRY.register(Box::new(CACHE_HITS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CACHE_MISSES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CACHE_SIZE.clone()))?;
    REGISTRY.register(Box::new(CHECKOUT_TICKS_TOTAL.clone()))?;

    tracing::info!("Metrics registry initialized");
    Ok(())
}

/// Record the outcome and duration of a database command.
pub fn observe_query(operation: &str, success: bool, elapsed: Duration) {
    let status = if success { "success" } else { "error" };
    DB_QUERIES_TOTAL
        .with_label_values(&[operation, status])
        .inc();
    DB_QUERY_DURATION_SECONDS
        .with_label_values(&[operation])
        .observe(elapsed.as_secs_f64());
}

/// Render all registered metrics in the Prometheus text format.
pub fn gather_text() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    encoder.encode_to_string(&REGISTRY.gather())
}
