//! Batched image understanding over a bidirectional streaming RPC.

pub mod client;
pub mod dispatcher;
pub mod proto;
pub mod worker;

pub use client::{GrpcInferenceTransport, InferenceTransport, ResponseStream};
pub use dispatcher::{BatchDispatcher, InferenceOutcome};
pub use proto::{EmbeddingResult, InferRequest, InferResponse, LabelsResult};
pub use worker::InferenceWorker;
