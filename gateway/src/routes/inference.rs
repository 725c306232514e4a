//! Streaming inference endpoint.
//!
//! `POST /v1/inference` decodes a submission, pushes a record onto the shared
//! priority queue, and fans the record's token stream out to the client as
//! server-sent events until completion, error, or client disconnect.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};

use crate::dispatch::{InferenceRequest, TOKEN_CHANNEL_CAPACITY};
use crate::error::ApiError;
use crate::metrics;
use crate::middleware::REQUEST_ID_HEADER;
use crate::AppState;

/// Inference submission body. Absent or non-positive numeric fields fall back
/// to their defaults.
#[derive(Debug, Deserialize)]
struct InferenceBody {
    #[serde(default)]
    prompt: String,
    #[serde(default)]
    max_tokens: Option<i32>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    priority: Option<i32>,
}

impl InferenceBody {
    fn max_tokens(&self) -> i32 {
        match self.max_tokens {
            Some(v) if v > 0 => v,
            _ => 100,
        }
    }

    fn temperature(&self) -> f32 {
        match self.temperature {
            Some(v) if v > 0.0 => v,
            _ => 0.7,
        }
    }

    fn model(&self) -> String {
        match self.model.as_deref() {
            Some(m) if !m.is_empty() => m.to_string(),
            _ => "default-model".to_string(),
        }
    }

    fn priority(&self) -> i32 {
        match self.priority {
            Some(v) if v > 0 => v,
            _ => 1,
        }
    }
}

/// Terminal metrics for one request, recorded exactly once.
///
/// The stream finalizes this with the real status; if the client disconnects,
/// axum drops the stream and the `Drop` impl records the request as
/// cancelled.
struct RequestMetrics {
    model: String,
    priority_bucket: &'static str,
    submit_time: Instant,
    status: &'static str,
    recorded: bool,
}

impl RequestMetrics {
    fn new(model: String, priority_bucket: &'static str, submit_time: Instant) -> Self {
        Self {
            model,
            priority_bucket,
            submit_time,
            status: "cancelled",
            recorded: false,
        }
    }

    fn finish(&mut self, status: &'static str) {
        self.status = status;
        self.record();
    }

    fn record(&mut self) {
        if self.recorded {
            return;
        }
        self.recorded = true;
        metrics::INFERENCE_REQUEST_DURATION_SECONDS
            .with_label_values(&[&self.model])
            .observe(self.submit_time.elapsed().as_secs_f64());
        metrics::INFERENCE_REQUESTS_TOTAL
            .with_label_values(&[&self.model, self.priority_bucket, self.status])
            .inc();
    }
}

impl Drop for RequestMetrics {
    fn drop(&mut self) {
        self.record();
    }
}

/// POST /v1/inference - submit a prompt and stream tokens back as SSE.
async fn submit_inference(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(queue) = state.queue.as_ref() else {
        return ApiError::ServiceClosing.into_response();
    };

    // Decoded by hand so malformed bodies are a 400, not a 422.
    let body: InferenceBody = match serde_json::from_slice(&body) {
        Ok(body) => body,
        Err(_) => return ApiError::InvalidRequest("invalid JSON body".to_string()).into_response(),
    };
    if body.prompt.is_empty() {
        return ApiError::InvalidRequest("prompt is required".to_string()).into_response();
    }

    // Prefer the id minted or echoed by the request-id middleware.
    let request_id = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(fallback_request_id);

    let model = body.model();
    let priority = body.priority();
    let priority_bucket = metrics::priority_label(priority);
    let submit_time = Instant::now();

    let (token_tx, mut token_rx) = mpsc::channel(TOKEN_CHANNEL_CAPACITY);
    let (error_tx, mut error_rx) = oneshot::channel();

    let max_tokens = body.max_tokens();
    let temperature = body.temperature();
    let record = InferenceRequest {
        id: request_id.clone(),
        model: model.clone(),
        prompt: body.prompt,
        max_tokens,
        temperature,
        priority,
        submit_time,
        token_tx,
        error_tx,
    };

    if !queue.push(record).await {
        return ApiError::ServiceClosing.into_response();
    }

    tracing::debug!(
        "Queued inference request {} (model={}, priority={})",
        request_id,
        model,
        priority
    );

    let stream = async_stream::stream! {
        let mut guard = RequestMetrics::new(model, priority_bucket, submit_time);
        let mut first_token = true;
        let mut last_count: i32 = 0;
        let mut error_done = false;

        loop {
            tokio::select! {
                // Tokens first, so frames buffered ahead of a failure are
                // delivered before the error event.
                biased;

                frame = token_rx.recv() => {
                    match frame {
                        Some(frame) => {
                            if first_token {
                                first_token = false;
                                metrics::INFERENCE_TIME_TO_FIRST_TOKEN_SECONDS
                                    .with_label_values(&[&guard.model])
                                    .observe(guard.submit_time.elapsed().as_secs_f64());
                            }
                            if frame.token_count > last_count {
                                metrics::INFERENCE_TOKENS_TOTAL
                                    .with_label_values(&[&guard.model])
                                    .inc_by(f64::from(frame.token_count - last_count));
                                last_count = frame.token_count;
                            }

                            let finished = frame.finished;
                            match serde_json::to_string(&frame) {
                                Ok(json) => yield Ok::<Event, Infallible>(Event::default().data(json)),
                                Err(e) => tracing::warn!("Failed to encode token frame: {}", e),
                            }
                            if finished {
                                guard.finish("success");
                                break;
                            }
                        }
                        None => {
                            // Channel closed. The worker delivers an error
                            // before dropping the channel, so one poll of the
                            // error receiver disambiguates the two endings.
                            match error_rx.try_recv() {
                                Ok(err) => {
                                    yield Ok(Event::default().event("error").data(err.to_string()));
                                    guard.finish("error");
                                }
                                Err(_) => guard.finish("success"),
                            }
                            break;
                        }
                    }
                }

                err = &mut error_rx, if !error_done => {
                    match err {
                        Ok(err) => {
                            yield Ok(Event::default().event("error").data(err.to_string()));
                            guard.finish("error");
                            break;
                        }
                        // Closed without a value: the token branch decides.
                        Err(_) => error_done = true,
                    }
                }
            }
        }
    };

    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        Sse::new(stream),
    )
        .into_response()
}

/// Request id of last resort when the middleware did not supply one.
fn fallback_request_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("req-{}", nanos)
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/inference", post(submit_inference))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body_from(json: &str) -> InferenceBody {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_defaults_applied_when_fields_absent() {
        let body = body_from(r#"{"prompt": "hello"}"#);
        assert_eq!(body.max_tokens(), 100);
        assert_eq!(body.temperature(), 0.7);
        assert_eq!(body.model(), "default-model");
        assert_eq!(body.priority(), 1);
    }

    #[test]
    fn test_defaults_applied_when_fields_non_positive() {
        let body = body_from(r#"{"prompt": "hi", "max_tokens": 0, "temperature": -1.0, "priority": -3}"#);
        assert_eq!(body.max_tokens(), 100);
        assert_eq!(body.temperature(), 0.7);
        assert_eq!(body.priority(), 1);
    }

    #[test]
    fn test_explicit_fields_are_kept() {
        let body = body_from(
            r#"{"prompt": "hi", "max_tokens": 32, "temperature": 1.5, "model": "tiny", "priority": 9}"#,
        );
        assert_eq!(body.max_tokens(), 32);
        assert_eq!(body.temperature(), 1.5);
        assert_eq!(body.model(), "tiny");
        assert_eq!(body.priority(), 9);
    }

    #[test]
    fn test_missing_prompt_deserializes_empty() {
        let body = body_from(r#"{}"#);
        assert!(body.prompt.is_empty());
    }

    #[test]
    fn test_fallback_request_id_shape() {
        let id = fallback_request_id();
        assert!(id.starts_with("req-"));
    }
}
