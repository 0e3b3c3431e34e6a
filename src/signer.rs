//! Identity/signing collaborator.
//!
//! Consulted once per attempt, after backoff and immediately before send, with the signing time
//! already corrected for clock skew.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use crate::context::SdkRequest;
use crate::error::SdkError;

/// Header written by [`TimestampSigner`].
pub const SIGNING_TIME_HEADER: &str = "x-sdk-signing-time";

/// Inputs to signing an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigningContext {
    /// Local time corrected by the client's clock-skew offset.
    pub signing_time: SystemTime,
    pub attempt: u32,
}

/// Blocking signer.
pub trait Signer: Send + Sync {
    fn sign(&self, request: SdkRequest, ctx: &SigningContext) -> Result<SdkRequest, SdkError>;
}

/// Non-blocking signer. Every [`Signer`] is one.
#[async_trait]
pub trait AsyncSigner: Send + Sync {
    async fn sign(&self, request: SdkRequest, ctx: &SigningContext) -> Result<SdkRequest, SdkError>;
}

#[async_trait]
impl<S> AsyncSigner for S
where
    S: Signer + ?Sized,
{
    async fn sign(
        &self,
        request: SdkRequest,
        ctx: &SigningContext,
    ) -> Result<SdkRequest, SdkError> {
        Signer::sign(self, request, ctx)
    }
}

/// Leaves requests untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSigner;

impl Signer for NoopSigner {
    fn sign(&self, request: SdkRequest, _ctx: &SigningContext) -> Result<SdkRequest, SdkError> {
        Ok(request)
    }
}

/// Stamps the signing time (seconds since the epoch) on the request. Stands in for a real
/// time-based signature in tests and demos.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimestampSigner;

impl Signer for TimestampSigner {
    fn sign(&self, mut request: SdkRequest, ctx: &SigningContext) -> Result<SdkRequest, SdkError> {
        let seconds = ctx
            .signing_time
            .duration_since(UNIX_EPOCH)
            .map_err(|e| SdkError::Signing(format!("signing time before epoch: {e}")))?
            .as_secs();
        request.set_header(SIGNING_TIME_HEADER, seconds.to_string())?;
        Ok(request)
    }
}
