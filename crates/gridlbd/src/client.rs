//! Minimal HTTP/1 exchange over a fresh connection.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use tracing::debug;

use gridlb_balancer::CollaboratorError;

/// Send `request` to `address` and collect the whole response.
///
/// Timeouts are the caller's concern; the balancer bounds every call.
pub(crate) async fn exchange(
    address: &str,
    request: http::Request<Full<Bytes>>,
) -> Result<(u16, Bytes), CollaboratorError> {
    let stream = tokio::net::TcpStream::connect(address)
        .await
        .map_err(|e| CollaboratorError::Connect(format!("{address}: {e}")))?;

    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| CollaboratorError::Connect(format!("{address}: handshake: {e}")))?;

    let peer = address.to_string();
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, address = %peer, "upstream connection closed with error");
        }
    });

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| CollaboratorError::Connect(format!("{address}: {e}")))?;
    let status = response.status().as_u16();
    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| CollaboratorError::InvalidResponse(e.to_string()))?
        .to_bytes();

    Ok((status, body))
}

pub(crate) fn build_error(e: http::Error) -> CollaboratorError {
    CollaboratorError::InvalidRequest(e.to_string())
}
