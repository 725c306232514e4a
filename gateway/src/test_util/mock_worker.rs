//! In-process mock inference worker.
//!
//! Serves the real `ModelService` gRPC interface on an ephemeral port and
//! echoes prompt words back as tokens, without loading a model. Behavior
//! knobs cover the failure and scheduling scenarios the tests need.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::Stream;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

use inference_proto::{
    GenerateRequest, HealthRequest, HealthResponse, ModelService, ModelServiceServer,
    TokenResponse,
};

type TokenStream = Pin<Box<dyn Stream<Item = Result<TokenResponse, Status>> + Send>>;

/// Configurable mock worker.
#[derive(Clone)]
pub struct MockWorker {
    model: String,
    token_delay: Duration,
    /// Fail the stream after this many successful frames.
    fail_after: Option<u32>,
    /// When set, every Generate call consumes one permit before streaming.
    gate: Option<Arc<Semaphore>>,
    /// Request ids in the order this worker received them.
    received: Arc<Mutex<Vec<String>>>,
}

impl MockWorker {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            token_delay: Duration::ZERO,
            fail_after: None,
            gate: None,
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    pub fn with_fail_after(mut self, frames: u32) -> Self {
        self.fail_after = Some(frames);
        self
    }

    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn received_ids(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }

    /// Bind an ephemeral port and serve until the handle is dropped/aborted.
    /// Returns the worker address in `host:port` form.
    pub async fn spawn(self) -> (String, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock worker listener");
        let addr = listener.local_addr().expect("mock worker local addr");

        let handle = tokio::spawn(async move {
            let _ = Server::builder()
                .add_service(ModelServiceServer::new(self))
                .serve_with_incoming(TcpListenerStream::new(listener))
                .await;
        });

        (addr.to_string(), handle)
    }
}

#[tonic::async_trait]
impl ModelService for MockWorker {
    type GenerateStream = TokenStream;

    async fn generate(
        &self,
        request: Request<GenerateRequest>,
    ) -> Result<Response<Self::GenerateStream>, Status> {
        let req = request.into_inner();
        self.received.lock().unwrap().push(req.request_id.clone());

        if let Some(gate) = &self.gate {
            let permit = Arc::clone(gate)
                .acquire_owned()
                .await
                .map_err(|_| Status::cancelled("gate closed"))?;
            permit.forget();
        }

        let model = self.model.clone();
        let delay = self.token_delay;
        let fail_after = self.fail_after;

        let stream = async_stream::stream! {
            let words: Vec<String> = req
                .prompt
                .split_whitespace()
                .map(str::to_string)
                .collect();
            let max = req.max_tokens.max(1) as usize;
            let mut count: i32 = 0;

            for word in words.into_iter().take(max) {
                if delay > Duration::ZERO {
                    tokio::time::sleep(delay).await;
                }
                if let Some(limit) = fail_after {
                    if count >= limit as i32 {
                        yield Err(Status::internal("mock backend failure"));
                        return;
                    }
                }
                count += 1;
                yield Ok(TokenResponse {
                    request_id: req.request_id.clone(),
                    token: format!("{} ", word),
                    token_count: count,
                    finished: false,
                    model: model.clone(),
                });
            }

            yield Ok(TokenResponse {
                request_id: req.request_id.clone(),
                token: String::new(),
                token_count: count,
                finished: true,
                model: model.clone(),
            });
        };

        Ok(Response::new(Box::pin(stream)))
    }

    async fn health(
        &self,
        _request: Request<HealthRequest>,
    ) -> Result<Response<HealthResponse>, Status> {
        Ok(Response::new(HealthResponse {
            healthy: true,
            current_queue_size: 0,
            gpu_utilization: 0.0,
        }))
    }
}
