//! Inference dispatch core.
//!
//! This module ties together:
//! - the shared [`PriorityQueue`] that orders submissions,
//! - one [`WorkerClient`] per backend inference process,
//! - the [`WorkerRouter`] that runs a consumer task per worker.

pub mod queue;
pub mod router;
pub mod worker;

pub use queue::{InferenceRequest, PriorityQueue, TOKEN_CHANNEL_CAPACITY};
pub use router::WorkerRouter;
pub use worker::{WorkerClient, WorkerError};
