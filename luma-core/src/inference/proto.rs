//! Wire types for the bidirectional inference stream.
//!
//! The message structs are hand-maintained prost derives (the `.proto`
//! source is owned by the model service); the client module mirrors the
//! shape tonic's codegen produces so the call site reads like any other
//! tonic client.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use luma_model::ScoredLabel;

/// Task name for CLIP image embeddings.
pub const TASK_EMBED: &str = "clip_image_embed";
/// Task name for the smart classifier.
pub const TASK_CLASSIFY: &str = "smart_classify";

/// One tagged request frame on the stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InferRequest {
    /// Echoed verbatim on the matching response frame.
    #[prost(string, tag = "1")]
    pub correlation_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub task: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "3")]
    pub payload: ::prost::alloc::vec::Vec<u8>,
    #[prost(string, tag = "4")]
    pub payload_mime: ::prost::alloc::string::String,
    /// Position of this frame within the batch.
    #[prost(uint32, tag = "5")]
    pub seq: u32,
    /// Total frames in the batch.
    #[prost(uint32, tag = "6")]
    pub total: u32,
    #[prost(map = "string, string", tag = "7")]
    pub meta: HashMap<::prost::alloc::string::String, ::prost::alloc::string::String>,
}

/// One tagged response frame. `result` carries opaque JSON when `error` is
/// absent.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InferResponse {
    #[prost(string, tag = "1")]
    pub correlation_id: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "2")]
    pub error: ::core::option::Option<InferError>,
    #[prost(bytes = "vec", tag = "3")]
    pub result: ::prost::alloc::vec::Vec<u8>,
    #[prost(map = "string, string", tag = "4")]
    pub meta: HashMap<::prost::alloc::string::String, ::prost::alloc::string::String>,
}

/// Server-side failure for one frame.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InferError {
    #[prost(string, tag = "1")]
    pub code: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub message: ::prost::alloc::string::String,
}

/// Decoded `result` payload of a [`TASK_EMBED`] response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingResult {
    pub vector: Vec<f32>,
    pub dim: usize,
    #[serde(rename = "modelId")]
    pub model_id: String,
}

/// Decoded `result` payload of a [`TASK_CLASSIFY`] response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelsResult {
    pub labels: Vec<ScoredLabel>,
    #[serde(rename = "modelId")]
    pub model_id: String,
}

/// Hand-written mirror of tonic-build output for the
/// `luma.inference.v1.Inference` service.
pub mod inference_client {
    use tonic::codegen::*;

    #[derive(Debug, Clone)]
    pub struct InferenceClient<T> {
        inner: tonic::client::Grpc<T>,
    }

    impl InferenceClient<tonic::transport::Channel> {
        pub async fn connect<D>(dst: D) -> Result<Self, tonic::transport::Error>
        where
            D: TryInto<tonic::transport::Endpoint>,
            D::Error: Into<StdError>,
        {
            let conn = tonic::transport::Endpoint::new(dst)?.connect().await?;
            Ok(Self::new(conn))
        }
    }

    impl<T> InferenceClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::Error: Into<StdError>,
        T::ResponseBody: Body<Data = Bytes> + std::marker::Send + 'static,
        <T::ResponseBody as Body>::Error: Into<StdError> + std::marker::Send,
    {
        pub fn new(inner: T) -> Self {
            let inner = tonic::client::Grpc::new(inner);
            Self { inner }
        }

        /// One bidirectional stream: tagged request frames in, tagged
        /// response frames out.
        pub async fn infer(
            &mut self,
            request: impl tonic::IntoStreamingRequest<Message = super::InferRequest>,
        ) -> std::result::Result<
            tonic::Response<tonic::codec::Streaming<super::InferResponse>>,
            tonic::Status,
        > {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unknown(format!("Service was not ready: {}", e.into()))
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path =
                http::uri::PathAndQuery::from_static("/luma.inference.v1.Inference/Infer");
            let mut req = request.into_streaming_request();
            req.extensions_mut()
                .insert(GrpcMethod::new("luma.inference.v1.Inference", "Infer"));
            self.inner.streaming(req, path, codec).await
        }
    }
}
