//! Serverless function gateway client.

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use tracing::debug;

use gridlb_balancer::{CollaboratorError, ServerlessInvoker};
use gridlb_core::{Params, WorkerResponse};

use crate::client;

/// Invokes `POST {endpoint}/{workload}` with the parameters as a JSON object.
#[derive(Debug, Clone)]
pub struct HttpServerless {
    endpoint: String,
}

impl HttpServerless {
    /// `endpoint` is the gateway's `host:port`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl ServerlessInvoker for HttpServerless {
    async fn invoke(&self, workload: &str, params: &Params) -> Result<WorkerResponse, CollaboratorError> {
        let payload = serde_json::to_vec(params)
            .map_err(|e| CollaboratorError::InvalidRequest(format!("encode params: {e}")))?;

        let req = http::Request::builder()
            .method("POST")
            .uri(format!("/{workload}"))
            .header("host", &self.endpoint)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(payload)))
            .map_err(client::build_error)?;

        let (status, body) = client::exchange(&self.endpoint, req).await?;
        debug!(%workload, endpoint = %self.endpoint, status, "serverless function responded");
        Ok(WorkerResponse::new(status, body))
    }
}
