//! Worker client: one persistent streaming connection to a backend
//! inference process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc;
use tonic::transport::{Channel, Endpoint};

use inference_proto::{GenerateRequest, HealthRequest, ModelServiceClient, TokenResponse};

use crate::dispatch::queue::InferenceRequest;
use crate::metrics;

/// Terminal error delivered to the endpoint through a record's error channel.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("invalid worker address '{address}': {source}")]
    Address {
        address: String,
        source: tonic::transport::Error,
    },
    #[error("backend stream failed: {0}")]
    Stream(#[from] tonic::Status),
    #[error("inference deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),
}

/// Client for a single backend inference worker.
///
/// The connection is established lazily on first use; the router calls
/// [`process`] serially from this worker's dedicated consumer task.
///
/// [`process`]: WorkerClient::process
pub struct WorkerClient {
    pub id: String,
    pub address: String,
    client: ModelServiceClient<Channel>,
    deadline: Duration,
    /// Updated from call outcomes and health probes; not consulted for
    /// dispatch - a failing worker fails fast and the next record retries it.
    healthy: AtomicBool,
}

impl WorkerClient {
    /// Create a client for one worker address. The channel connects lazily,
    /// so this only fails on an unparseable address.
    pub fn connect(id: &str, address: &str, deadline: Duration) -> Result<Self, WorkerError> {
        let uri = if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{}", address)
        };

        let channel = Endpoint::from_shared(uri)
            .map_err(|e| WorkerError::Address {
                address: address.to_string(),
                source: e,
            })?
            .connect_lazy();

        Ok(Self {
            id: id.to_string(),
            address: address.to_string(),
            client: ModelServiceClient::new(channel),
            deadline,
            healthy: AtomicBool::new(true),
        })
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Probe the worker's Health RPC and refresh the health flag.
    pub async fn check_health(&self) -> bool {
        let mut client = self.client.clone();
        let healthy = match client.health(HealthRequest {}).await {
            Ok(response) => response.into_inner().healthy,
            Err(status) => {
                tracing::warn!("Health probe for {} failed: {}", self.id, status);
                false
            }
        };
        self.healthy.store(healthy, Ordering::Relaxed);
        healthy
    }

    /// Drive one record's generation: stream tokens from the backend into the
    /// record's token channel, or deliver a single terminal error.
    pub async fn process(&self, request: InferenceRequest) {
        let start_time = Instant::now();
        let priority_bucket = metrics::priority_label(request.priority);
        metrics::INFERENCE_QUEUE_WAIT_SECONDS
            .with_label_values(&[&request.model, priority_bucket])
            .observe(start_time.duration_since(request.submit_time).as_secs_f64());

        let InferenceRequest {
            id,
            model,
            prompt,
            max_tokens,
            temperature,
            priority,
            token_tx,
            error_tx,
            ..
        } = request;

        let rpc = GenerateRequest {
            request_id: id.clone(),
            model: model.clone(),
            prompt,
            max_tokens,
            temperature,
            priority,
        };

        let status = match tokio::time::timeout(self.deadline, self.stream_tokens(rpc, &token_tx))
            .await
        {
            Ok(Ok(())) => {
                self.healthy.store(true, Ordering::Relaxed);
                "success"
            }
            Ok(Err(status)) => {
                tracing::warn!("[{}] stream for request {} broke: {}", self.id, id, status);
                self.healthy.store(false, Ordering::Relaxed);
                let _ = error_tx.send(WorkerError::Stream(status));
                "error"
            }
            Err(_) => {
                tracing::warn!(
                    "[{}] request {} exceeded the {:?} deadline",
                    self.id,
                    id,
                    self.deadline
                );
                self.healthy.store(false, Ordering::Relaxed);
                let _ = error_tx.send(WorkerError::DeadlineExceeded(self.deadline));
                "error"
            }
        };

        metrics::INFERENCE_PROCESSING_SECONDS
            .with_label_values(&[&model, &self.id])
            .observe(start_time.elapsed().as_secs_f64());
        metrics::INFERENCE_WORKER_REQUESTS_TOTAL
            .with_label_values(&[&self.id, status])
            .inc();
        // Dropping token_tx here closes the token channel; on the success
        // path that is what tells the endpoint the stream is complete.
    }

    async fn stream_tokens(
        &self,
        rpc: GenerateRequest,
        token_tx: &mpsc::Sender<TokenResponse>,
    ) -> Result<(), tonic::Status> {
        let mut client = self.client.clone();
        let mut grpc_request = tonic::Request::new(rpc);
        // Propagate the deadline so the worker can stop generating too.
        grpc_request.set_timeout(self.deadline);

        let mut stream = client.generate(grpc_request).await?.into_inner();
        let mut receiver_gone = false;

        loop {
            match stream.message().await {
                Ok(Some(frame)) => {
                    if !receiver_gone {
                        // Bounded channel: a slow SSE client backpressures
                        // here, and through gRPC flow control, the backend.
                        if token_tx.send(frame).await.is_err() {
                            // The endpoint dropped its receiver (client went
                            // away). Client disconnect does not abort the
                            // call: keep draining the backend stream and
                            // discard the remaining frames.
                            receiver_gone = true;
                        }
                    }
                }
                Ok(None) => return Ok(()),
                Err(status) => return Err(status),
            }
        }
    }
}
