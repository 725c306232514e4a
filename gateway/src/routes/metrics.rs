use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Router};

async fn metrics() -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        crate::metrics::encode_metrics(),
    )
        .into_response()
}

pub fn router() -> Router {
    Router::new().route("/metrics", get(metrics))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_endpoint_serves_text() {
        let _ = crate::metrics::register_metrics();
        let response = metrics().await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
