//! Pipeline stages.
//!
//! A stage turns an input into an output given the call's [`ExecutionContext`]. Stages are
//! composed by wrapping at construction time, outer stage around inner stage, so the outer
//! `execute` calls the inner one. Faults from the inner stage reach the outer stage unchanged
//! unless a stage deliberately translates them, and anything a stage writes to the context before
//! delegating is visible to every stage inside it and to the caller afterwards.
//!
//! Each role is one struct with two implementations: [`SyncStage`] blocks the calling thread,
//! [`AsyncStage`] returns a future. Both share the role's decision logic; only waiting and
//! signalling differ.
//!
//! Every stage has a [`tower_layer::Layer`], so the standard pipeline is assembled with
//! `tower::ServiceBuilder`:
//!
//! ```text
//! ApiCallTimeoutStage → RetryableStage → AttemptTimeoutStage → SigningStage → TransportStage
//! ```

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tower::ServiceBuilder;

use crate::cancel::CancellationToken;
use crate::completion::{Completion, CompletionReceiver};
use crate::context::ExecutionContext;
use crate::error::{SdkError, TransportFault};
use crate::retry::RetryStrategy;
use crate::skew::ClockSkewCorrector;
use crate::sleeper::Sleeper;
use crate::timer::TimerService;

pub mod attempt_timeout;
pub mod call_timeout;
pub mod retryable;
pub mod send;
pub mod signing;

pub use attempt_timeout::{AttemptTimeoutLayer, AttemptTimeoutStage};
pub use call_timeout::{ApiCallTimeoutLayer, ApiCallTimeoutStage};
pub use retryable::{RetryableLayer, RetryableStage};
pub use send::TransportStage;
pub use signing::{SigningLayer, SigningStage};

/// Blocking stage: the calling thread is occupied for the whole stage, backoff included.
pub trait SyncStage<Req>: Send + Sync {
    type Response;

    fn execute(&self, request: Req, ctx: &mut ExecutionContext) -> Result<Self::Response, SdkError>;
}

/// Non-blocking stage.
#[async_trait]
pub trait AsyncStage<Req: Send + 'static>: Send + Sync {
    type Response: Send;

    async fn execute(
        &self,
        request: Req,
        ctx: &mut ExecutionContext,
    ) -> Result<Self::Response, SdkError>;
}

/// Drive `work` until it finishes or `interrupt` is signalled, then report whatever completed
/// `done` first. Timeout trackers complete `done` with their own fault before signalling, so a
/// tracker that fires wins over the interrupted work it causes.
pub(crate) async fn first_completion<T, F>(
    work: F,
    done: &Completion<Result<T, SdkError>>,
    settled: CompletionReceiver<Result<T, SdkError>>,
    interrupt: &CancellationToken,
) -> Result<T, SdkError>
where
    F: Future<Output = Result<T, SdkError>>,
{
    {
        tokio::pin!(work);
        tokio::select! {
            result = &mut work => {
                done.complete(result);
            }
            _ = interrupt.cancelled() => {
                done.complete(Err(TransportFault::cancelled().into()));
            }
        }
    }
    settled
        .await
        .unwrap_or_else(|| Err(SdkError::Internal("stage completion dropped".into())))
}

/// The standard pipeline around a signer `G` and transport `T`.
pub type Pipeline<G, T> =
    ApiCallTimeoutStage<RetryableStage<AttemptTimeoutStage<SigningStage<TransportStage<T>, G>>>>;

/// Collaborators of the standard pipeline.
pub struct PipelineParts<G: ?Sized, T: ?Sized> {
    pub timer: TimerService,
    pub strategy: Arc<RetryStrategy>,
    pub sleeper: Arc<dyn Sleeper>,
    pub skew: ClockSkewCorrector,
    pub signer: Arc<G>,
    pub transport: Arc<T>,
}

/// Assemble the standard pipeline.
pub fn build_pipeline<G, T>(parts: PipelineParts<G, T>) -> Pipeline<G, T>
where
    G: ?Sized,
    T: ?Sized,
{
    let PipelineParts { timer, strategy, sleeper, skew, signer, transport } = parts;
    ServiceBuilder::new()
        .layer(ApiCallTimeoutLayer::new(timer.clone()))
        .layer(RetryableLayer::new(strategy, sleeper, skew.clone()))
        .layer(AttemptTimeoutLayer::new(timer))
        .layer(SigningLayer::new(signer, skew))
        .service(TransportStage::new(transport))
}
