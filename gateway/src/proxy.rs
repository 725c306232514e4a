//! Forward-proxy path: absolute-URI HTTP requests relayed to their origin.
//!
//! Mounted as the router fallback, so anything that is not a gateway route
//! lands here. CONNECT tunneling and TLS termination are out of scope.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, Method, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::Router;

use crate::blocklist::BLOCKED_PAGE;
use crate::metrics;
use crate::AppState;

/// Hop-by-hop headers never forwarded in either direction.
const HOP_HEADERS: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_header(name: &HeaderName) -> bool {
    HOP_HEADERS.contains(&name.as_str())
}

fn filtered_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::new();
    for (name, value) in headers {
        if !is_hop_header(name) {
            filtered.append(name.clone(), value.clone());
        }
    }
    filtered
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new().fallback(forward_proxy).with_state(state)
}

/// Relay one client request to its origin and stream the response back.
async fn forward_proxy(State(state): State<Arc<AppState>>, request: Request) -> Response {
    if request.method() == Method::CONNECT {
        return (
            StatusCode::NOT_IMPLEMENTED,
            "CONNECT tunneling is not supported",
        )
            .into_response();
    }

    let uri = request.uri().clone();
    let host = match uri.host() {
        Some(host) => host.to_string(),
        // Relative URI: not a proxy request and not a gateway route.
        None => return StatusCode::NOT_FOUND.into_response(),
    };

    if state.blocklist.is_blocked(&host) {
        metrics::PROXY_BLOCKED_REQUESTS_TOTAL.inc();
        tracing::info!("Blocked request to {}", host);
        return (StatusCode::FORBIDDEN, Html(BLOCKED_PAGE)).into_response();
    }

    let method = request.method().clone();
    let headers = filtered_headers(request.headers());
    let body = reqwest::Body::wrap_stream(request.into_body().into_data_stream());

    let upstream = state
        .http_client
        .request(method, uri.to_string())
        .headers(headers)
        .body(body)
        .send()
        .await;

    let upstream = match upstream {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!("Upstream request to {} failed: {}", host, e);
            return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response();
        }
    };

    let status = upstream.status();
    let headers = filtered_headers(upstream.headers());
    (
        status,
        headers,
        Body::from_stream(upstream.bytes_stream()),
    )
        .into_response()
}
