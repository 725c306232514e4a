//! Inference gateway library.
//!
//! A front-door gateway with two surfaces: a forward proxy for arbitrary
//! HTTP origins and a priority-scheduled streaming inference endpoint backed
//! by a fixed pool of gRPC workers.

pub mod blocklist;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod limit;
pub mod metrics;
pub mod middleware;
pub mod proxy;
pub mod routes;
pub mod test_util;

pub use blocklist::Blocklist;
pub use config::Config;
pub use dispatch::{InferenceRequest, PriorityQueue, WorkerClient, WorkerRouter};
pub use limit::{MemoryRateLimiter, RateLimiter};

use std::sync::Arc;

use axum::Router;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    /// Present when at least one worker address is configured.
    pub queue: Option<Arc<PriorityQueue>>,
    pub limiter: Arc<dyn RateLimiter>,
    pub blocklist: Arc<Blocklist>,
    /// Client used by the forward-proxy path.
    pub http_client: reqwest::Client,
}

/// Assemble the gateway router: observability routes, the inference endpoint
/// (when workers are configured), the forward-proxy fallback, and the
/// middleware stack.
pub fn app(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .merge(routes::health::router())
        .merge(routes::metrics::router());

    if state.queue.is_some() {
        router = router.merge(routes::inference::router(Arc::clone(&state)));
    }

    router
        .merge(proxy::router(Arc::clone(&state)))
        // Layer order: the last layer added sees requests first.
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            middleware::rate_limit,
        ))
        .layer(axum::middleware::from_fn(middleware::request_logger))
        .layer(middleware::propagate_request_id_layer())
        .layer(middleware::set_request_id_layer())
}
