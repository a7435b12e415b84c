//! Pluggable adaptors behind remote-invoke, remote-binding and side-channel calls.

use async_trait::async_trait;

use crate::bridge::protocol::{AdaptorResponse, BindingRequest, RemoteInvokeRequest, RequestKind};
use crate::session::ResponseError;

#[derive(Debug, thiserror::Error)]
pub enum AdaptorError {
    /// An HTTP-like failure the caller should see as a normal result.
    #[error("status {status}: {message}")]
    Status { status: i32, message: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AdaptorError {
    pub fn status(status: i32, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }
}

/// Routes remote procedure and binding invocations on behalf of a worker.
#[async_trait]
pub trait RemoteAdaptor: Send + Sync {
    async fn invoke(
        &self,
        credential: &str,
        request: RemoteInvokeRequest,
    ) -> Result<AdaptorResponse, AdaptorError>;

    async fn binding(
        &self,
        credential: &str,
        request: BindingRequest,
    ) -> Result<AdaptorResponse, AdaptorError>;
}

/// A named side-channel binding (state store, pub/sub, ...).
#[async_trait]
pub trait SideChannelAdaptor: Send + Sync {
    async fn call(
        &self,
        credential: &str,
        request: BindingRequest,
    ) -> Result<AdaptorResponse, AdaptorError>;
}

/// Map an adaptor outcome onto the response envelope.
pub(crate) fn settle(
    kind: RequestKind,
    result: Result<AdaptorResponse, AdaptorError>,
) -> Result<AdaptorResponse, ResponseError> {
    match result {
        Ok(response) => Ok(response),
        Err(AdaptorError::Status { status, message }) => Ok(AdaptorResponse {
            status,
            data: message.into_bytes(),
        }),
        Err(AdaptorError::Other(e)) => {
            tracing::warn!(%kind, error = %e, "Adaptor call failed");
            Err(ResponseError::internal(format!("{e:#}")))
        }
    }
}
