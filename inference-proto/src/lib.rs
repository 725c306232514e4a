//! Inference wire protocol
//!
//! Shared protocol types for gateway <-> worker communication: the
//! `ModelService` streaming gRPC service, its request/response messages, and
//! the generated client/server bindings. The proto source lives in
//! `proto/inference.proto`; the bindings are vendored so downstream builds do
//! not need protoc.

mod inference;

pub use inference::model_service_client::ModelServiceClient;
pub use inference::model_service_server::{ModelService, ModelServiceServer};
pub use inference::{GenerateRequest, HealthRequest, HealthResponse, TokenResponse};
