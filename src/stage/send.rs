//! Innermost stage: hand the signed attempt to the transport.

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::{ExecutionContext, SdkRequest, SdkResponse};
use crate::error::{SdkError, TransportFault};
use crate::stage::{AsyncStage, SyncStage};
use crate::transport::{AsyncTransport, SyncTransport};

/// Sends one attempt with the attempt token. An attempt whose token is already signalled is
/// never sent.
pub struct TransportStage<T: ?Sized> {
    transport: Arc<T>,
}

impl<T: ?Sized> Clone for TransportStage<T> {
    fn clone(&self) -> Self {
        Self { transport: self.transport.clone() }
    }
}

impl<T: ?Sized> std::fmt::Debug for TransportStage<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportStage").finish_non_exhaustive()
    }
}

impl<T: ?Sized> TransportStage<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self { transport }
    }
}

impl<T> SyncStage<SdkRequest> for TransportStage<T>
where
    T: SyncTransport + ?Sized,
{
    type Response = SdkResponse;

    fn execute(
        &self,
        request: SdkRequest,
        ctx: &mut ExecutionContext,
    ) -> Result<SdkResponse, SdkError> {
        if ctx.attempt_token().is_cancelled() {
            return Err(TransportFault::cancelled().into());
        }
        self.transport.send(&request, ctx.attempt_token())
    }
}

#[async_trait]
impl<T> AsyncStage<SdkRequest> for TransportStage<T>
where
    T: AsyncTransport + ?Sized,
{
    type Response = SdkResponse;

    async fn execute(
        &self,
        request: SdkRequest,
        ctx: &mut ExecutionContext,
    ) -> Result<SdkResponse, SdkError> {
        if ctx.attempt_token().is_cancelled() {
            return Err(TransportFault::cancelled().into());
        }
        self.transport.send(&request, ctx.attempt_token()).await
    }
}
