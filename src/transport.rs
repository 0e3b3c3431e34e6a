//! Transport collaborator contracts.
//!
//! A transport sends one attempt and reports one outcome: a response, a
//! [`crate::TransportFault`] when no response arrived, or a [`crate::ServiceFault`] when the
//! service answered with an error. The attempt's cancellation token is passed in; transports
//! are expected to observe it at their own blocking points and return
//! [`crate::TransportFault::cancelled`] when it fires.

use async_trait::async_trait;
use tower::ServiceExt;
use tower_service::Service;

use crate::cancel::CancellationToken;
use crate::context::{SdkRequest, SdkResponse};
use crate::error::{SdkError, TransportFault};

/// Blocking transport.
pub trait SyncTransport: Send + Sync {
    fn send(
        &self,
        request: &SdkRequest,
        cancel: &CancellationToken,
    ) -> Result<SdkResponse, SdkError>;
}

impl<F> SyncTransport for F
where
    F: Fn(&SdkRequest, &CancellationToken) -> Result<SdkResponse, SdkError> + Send + Sync,
{
    fn send(
        &self,
        request: &SdkRequest,
        cancel: &CancellationToken,
    ) -> Result<SdkResponse, SdkError> {
        self(request, cancel)
    }
}

/// Non-blocking transport.
#[async_trait]
pub trait AsyncTransport: Send + Sync {
    async fn send(
        &self,
        request: &SdkRequest,
        cancel: &CancellationToken,
    ) -> Result<SdkResponse, SdkError>;
}

/// Adapts any tower service into an [`AsyncTransport`].
///
/// The service is cloned per attempt and driven with `oneshot`, so readiness is respected. The
/// attempt token is raced against the call: a signalled token drops the service future and
/// reports a cancelled transport fault.
#[derive(Debug, Clone)]
pub struct ServiceTransport<S> {
    inner: S,
}

impl<S> ServiceTransport<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[async_trait]
impl<S> AsyncTransport for ServiceTransport<S>
where
    S: Service<SdkRequest, Response = SdkResponse> + Clone + Send + Sync + 'static,
    S::Error: Into<SdkError>,
    S::Future: Send,
{
    async fn send(
        &self,
        request: &SdkRequest,
        cancel: &CancellationToken,
    ) -> Result<SdkResponse, SdkError> {
        let call = self.inner.clone().oneshot(request.clone());
        tokio::select! {
            result = call => result.map_err(Into::into),
            _ = cancel.cancelled() => Err(TransportFault::cancelled().into()),
        }
    }
}
