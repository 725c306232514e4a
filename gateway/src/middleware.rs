//! HTTP middleware: request ids, request logging, rate limiting.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};

use crate::metrics;
use crate::AppState;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Layer that mints an `X-Request-ID` for requests that arrive without one.
/// An id supplied by the client is kept as-is.
pub fn set_request_id_layer() -> SetRequestIdLayer<MakeRequestUuid> {
    SetRequestIdLayer::x_request_id(MakeRequestUuid)
}

/// Layer that echoes the request id on the response.
pub fn propagate_request_id_layer() -> PropagateRequestIdLayer {
    PropagateRequestIdLayer::x_request_id()
}

/// Middleware that logs HTTP requests at INFO level and records the
/// proxy-level request metrics.
pub async fn request_logger(request: Request, next: Next) -> Response {
    metrics::PROXY_ACTIVE_CONNECTIONS.inc();
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();

    let response = next.run(request).await;

    let status = response.status();
    let duration = start.elapsed();
    metrics::PROXY_REQUEST_DURATION_SECONDS
        .with_label_values(&[method.as_str()])
        .observe(duration.as_secs_f64());
    metrics::PROXY_REQUESTS_TOTAL
        .with_label_values(&[method.as_str(), status.as_str()])
        .inc();
    metrics::PROXY_ACTIVE_CONNECTIONS.dec();

    tracing::info!(
        method = %method,
        path = %path,
        status = %status.as_u16(),
        duration_ms = %duration.as_millis(),
        request_id = %request_id,
        "HTTP request"
    );

    response
}

/// Middleware that rejects over-limit clients with 429 before any routing.
pub async fn rate_limit(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let key = client_key(&request);
    if !state.limiter.allow(&key) {
        let endpoint = if request.uri().path() == "/v1/inference" {
            "inference"
        } else {
            "proxy"
        };
        metrics::RATE_LIMITED_TOTAL
            .with_label_values(&[endpoint])
            .inc();
        tracing::debug!("Rate limit exceeded for {}", key);
        return (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded").into_response();
    }
    next.run(request).await
}

/// Client identity used for rate limiting: forwarded headers first, then the
/// peer address.
fn client_key(request: &Request) -> String {
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    if let Some(real_ip) = request
        .headers()
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
    {
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
