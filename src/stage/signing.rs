//! Per-attempt signing with the skew-corrected time.

use std::sync::Arc;

use async_trait::async_trait;
use tower_layer::Layer;

use crate::context::{ExecutionContext, SdkRequest, SdkResponse};
use crate::error::SdkError;
use crate::signer::{AsyncSigner, Signer, SigningContext};
use crate::skew::ClockSkewCorrector;
use crate::stage::{AsyncStage, SyncStage};

/// Signs each attempt immediately before it is sent and records the signing and send times on
/// the context for clock-skew detection.
pub struct SigningStage<S, G: ?Sized> {
    inner: S,
    signer: Arc<G>,
    skew: ClockSkewCorrector,
}

impl<S: Clone, G: ?Sized> Clone for SigningStage<S, G> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), signer: self.signer.clone(), skew: self.skew.clone() }
    }
}

impl<S: std::fmt::Debug, G: ?Sized> std::fmt::Debug for SigningStage<S, G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningStage")
            .field("inner", &self.inner)
            .field("skew", &self.skew)
            .finish()
    }
}

impl<S, G: ?Sized> SigningStage<S, G> {
    pub fn new(inner: S, signer: Arc<G>, skew: ClockSkewCorrector) -> Self {
        Self { inner, signer, skew }
    }

    fn signing_context(&self, ctx: &mut ExecutionContext) -> SigningContext {
        let signing_time = self.skew.signing_time();
        ctx.set_signing(signing_time, self.skew.local_now());
        SigningContext { signing_time, attempt: ctx.attempt() }
    }
}

impl<S, G> SyncStage<SdkRequest> for SigningStage<S, G>
where
    S: SyncStage<SdkRequest, Response = SdkResponse>,
    G: Signer + ?Sized,
{
    type Response = SdkResponse;

    fn execute(
        &self,
        request: SdkRequest,
        ctx: &mut ExecutionContext,
    ) -> Result<SdkResponse, SdkError> {
        let signing = self.signing_context(ctx);
        let signed = Signer::sign(&*self.signer, request, &signing)?;
        self.inner.execute(signed, ctx)
    }
}

#[async_trait]
impl<S, G> AsyncStage<SdkRequest> for SigningStage<S, G>
where
    S: AsyncStage<SdkRequest, Response = SdkResponse>,
    G: AsyncSigner + ?Sized,
{
    type Response = SdkResponse;

    async fn execute(
        &self,
        request: SdkRequest,
        ctx: &mut ExecutionContext,
    ) -> Result<SdkResponse, SdkError> {
        let signing = self.signing_context(ctx);
        let signed = AsyncSigner::sign(&*self.signer, request, &signing).await?;
        self.inner.execute(signed, ctx).await
    }
}

/// [`Layer`] wrapping a stage in [`SigningStage`].
pub struct SigningLayer<G: ?Sized> {
    signer: Arc<G>,
    skew: ClockSkewCorrector,
}

impl<G: ?Sized> SigningLayer<G> {
    pub fn new(signer: Arc<G>, skew: ClockSkewCorrector) -> Self {
        Self { signer, skew }
    }
}

impl<G: ?Sized> Clone for SigningLayer<G> {
    fn clone(&self) -> Self {
        Self { signer: self.signer.clone(), skew: self.skew.clone() }
    }
}

impl<S, G: ?Sized> Layer<S> for SigningLayer<G> {
    type Service = SigningStage<S, G>;

    fn layer(&self, inner: S) -> Self::Service {
        SigningStage::new(inner, self.signer.clone(), self.skew.clone())
    }
}
