//! Transport seam between the batch dispatcher and the model service.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use tonic::transport::{Channel, Endpoint};

use crate::error::{CoreError, Result};

use super::proto::{InferRequest, InferResponse, inference_client::InferenceClient};

/// Inbound half of one opened stream.
pub type ResponseStream = BoxStream<'static, Result<InferResponse>>;

/// Opens one bidirectional stream per batch: all request frames are handed
/// over up front, the send direction closes once they are written, and the
/// returned stream yields response frames until the server finishes.
#[async_trait]
pub trait InferenceTransport: Send + Sync {
    async fn infer(&self, requests: Vec<InferRequest>) -> Result<ResponseStream>;
}

/// gRPC transport over a lazily-connected channel.
#[derive(Debug, Clone)]
pub struct GrpcInferenceTransport {
    channel: Channel,
}

impl GrpcInferenceTransport {
    /// `uri` like `http://inference:50051`. The connection is established on
    /// first use and re-established by the channel as needed.
    pub fn new(uri: &str) -> Result<Self> {
        let endpoint = Endpoint::from_shared(uri.to_string())
            .map_err(|e| CoreError::Internal(format!("invalid inference endpoint: {e}")))?;
        Ok(Self {
            channel: endpoint.connect_lazy(),
        })
    }
}

#[async_trait]
impl InferenceTransport for GrpcInferenceTransport {
    async fn infer(&self, requests: Vec<InferRequest>) -> Result<ResponseStream> {
        let mut client = InferenceClient::new(self.channel.clone());
        let outbound = tokio_stream::iter(requests);
        let response = client
            .infer(outbound)
            .await
            .map_err(status_to_error)?;
        Ok(response
            .into_inner()
            .map(|frame| frame.map_err(status_to_error))
            .boxed())
    }
}

fn status_to_error(status: tonic::Status) -> CoreError {
    CoreError::remote(status.code().to_string(), status.message().to_string())
}
