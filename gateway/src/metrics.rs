//! Prometheus metrics for the gateway.
//!
//! All metrics live in a crate-local registry; `register_metrics` wires them
//! up once at startup and `/metrics` serves `encode_metrics`.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ---- Inference dispatch ----

    /// Requests waiting in the priority queue.
    pub static ref INFERENCE_QUEUE_DEPTH: Gauge = Gauge::with_opts(
        Opts::new("inference_queue_depth", "Current number of requests waiting in queue")
    ).expect("metric can be created");

    /// Requests currently being processed by workers.
    pub static ref INFERENCE_IN_FLIGHT: Gauge = Gauge::with_opts(
        Opts::new("inference_in_flight", "Number of requests currently being processed")
    ).expect("metric can be created");

    /// Completed inference requests by terminal status.
    pub static ref INFERENCE_REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("inference_requests_total", "Total inference requests"),
        &["model", "priority", "status"]
    ).expect("metric can be created");

    /// End-to-end duration, submit to terminal event.
    pub static ref INFERENCE_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "inference_request_duration_seconds",
            "End-to-end inference request duration",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]),
        &["model"]
    ).expect("metric can be created");

    /// Submit to first streamed token.
    pub static ref INFERENCE_TIME_TO_FIRST_TOKEN_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "inference_time_to_first_token_seconds",
            "Time from request submit to first token received",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0]),
        &["model"]
    ).expect("metric can be created");

    /// Tokens streamed to clients.
    pub static ref INFERENCE_TOKENS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("inference_tokens_total", "Total tokens generated"),
        &["model"]
    ).expect("metric can be created");

    /// Worker-side processing time (the streaming RPC, start to finish).
    pub static ref INFERENCE_PROCESSING_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "inference_processing_seconds",
            "Worker processing time for inference requests",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]),
        &["model", "worker_id"]
    ).expect("metric can be created");

    /// Time spent queued before a worker picked the request up.
    pub static ref INFERENCE_QUEUE_WAIT_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "inference_queue_wait_seconds",
            "Time request spent waiting in queue",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0]),
        &["model", "priority"]
    ).expect("metric can be created");

    /// Per-worker request counts, labeled success/error.
    pub static ref INFERENCE_WORKER_REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("inference_worker_requests_total", "Total requests processed by each worker"),
        &["worker_id", "status"]
    ).expect("metric can be created");

    // ---- Forward proxy / admission ----

    pub static ref PROXY_REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("proxy_requests_total", "Total number of proxy requests"),
        &["method", "status"]
    ).expect("metric can be created");

    pub static ref PROXY_BLOCKED_REQUESTS_TOTAL: Counter = Counter::with_opts(
        Opts::new("proxy_blocked_requests_total", "Total blocked requests")
    ).expect("metric can be created");

    pub static ref PROXY_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("proxy_request_duration_seconds", "Request duration in seconds"),
        &["method"]
    ).expect("metric can be created");

    pub static ref PROXY_ACTIVE_CONNECTIONS: Gauge = Gauge::with_opts(
        Opts::new("proxy_active_connections", "Number of active proxy connections")
    ).expect("metric can be created");

    pub static ref RATE_LIMITED_TOTAL: CounterVec = CounterVec::new(
        Opts::new("rate_limited_requests_total", "Total requests rejected due to rate limiting"),
        &["endpoint"]
    ).expect("metric can be created");
}

/// Register every metric with the crate registry. Called once at startup.
pub fn register_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(INFERENCE_QUEUE_DEPTH.clone()))?;
    REGISTRY.register(Box::new(INFERENCE_IN_FLIGHT.clone()))?;
    REGISTRY.register(Box::new(INFERENCE_REQUESTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(INFERENCE_REQUEST_DURATION_SECONDS.clone()))?;
    REGISTRY.register(Box::new(INFERENCE_TIME_TO_FIRST_TOKEN_SECONDS.clone()))?;
    REGISTRY.register(Box::new(INFERENCE_TOKENS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(INFERENCE_PROCESSING_SECONDS.clone()))?;
    REGISTRY.register(Box::new(INFERENCE_QUEUE_WAIT_SECONDS.clone()))?;
    REGISTRY.register(Box::new(INFERENCE_WORKER_REQUESTS_TOTAL.clone()))?;

    REGISTRY.register(Box::new(PROXY_REQUESTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PROXY_BLOCKED_REQUESTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PROXY_REQUEST_DURATION_SECONDS.clone()))?;
    REGISTRY.register(Box::new(PROXY_ACTIVE_CONNECTIONS.clone()))?;
    REGISTRY.register(Box::new(RATE_LIMITED_TOTAL.clone()))?;

    Ok(())
}

/// Encode the crate registry in Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_else(|e| format!("# error encoding metrics: {}\n", e))
}

/// Bucket a numeric priority (higher = more urgent) into a metric label.
pub fn priority_label(priority: i32) -> &'static str {
    match priority {
        p if p >= 8 => "high",
        p if p >= 4 => "medium",
        _ => "low",
    }
}
