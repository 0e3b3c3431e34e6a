//! Per-attempt deadline.

use async_trait::async_trait;
use tower_layer::Layer;

use crate::cancel::CancellationToken;
use crate::completion::{completion, Completion};
use crate::context::{ExecutionContext, SdkRequest, SdkResponse};
use crate::error::SdkError;
use crate::stage::{first_completion, AsyncStage, SyncStage};
use crate::telemetry::ExecutionEvent;
use crate::timeout::{TimeoutScope, TimeoutTracker};
use crate::timer::TimerService;

/// Arms a fresh attempt tracker around every attempt and translates the faults it causes into
/// [`SdkError::AttemptTimeout`], which the retry loop treats as retryable.
///
/// The attempt token is a child of the call token: a call timeout or caller cancellation
/// interrupts the attempt too, and unwinds as the call-level fault.
#[derive(Debug, Clone)]
pub struct AttemptTimeoutStage<S> {
    inner: S,
    timer: TimerService,
}

type Done = Completion<Result<SdkResponse, SdkError>>;

impl<S> AttemptTimeoutStage<S> {
    pub fn new(inner: S, timer: TimerService) -> Self {
        Self { inner, timer }
    }

    fn arm(
        &self,
        ctx: &ExecutionContext,
        attempt_token: &CancellationToken,
        done: Option<Done>,
    ) -> TimeoutTracker {
        let timeout = ctx.attempt_timeout();
        let events = ctx.events().clone();
        let invocation_id = ctx.invocation_id();
        let attempt = ctx.attempt();
        let token = attempt_token.clone();
        TimeoutTracker::arm(&self.timer, TimeoutScope::Attempt, timeout, move || {
            let timeout = timeout.unwrap_or_default();
            events.emit(ExecutionEvent::TimeoutFired {
                invocation_id,
                scope: TimeoutScope::Attempt,
                timeout,
            });
            if let Some(done) = done {
                done.complete(Err(SdkError::AttemptTimeout { attempt, timeout }));
            }
            token.cancel();
        })
    }
}

impl<S> SyncStage<SdkRequest> for AttemptTimeoutStage<S>
where
    S: SyncStage<SdkRequest, Response = SdkResponse>,
{
    type Response = SdkResponse;

    fn execute(
        &self,
        request: SdkRequest,
        ctx: &mut ExecutionContext,
    ) -> Result<SdkResponse, SdkError> {
        let attempt_token = ctx.call_token().child();
        let tracker = self.arm(ctx, &attempt_token, None);
        ctx.set_attempt_scope(attempt_token, tracker.handle());

        let result = self.inner.execute(request, ctx);
        tracker.cancel();
        result.map_err(|fault| ctx.fault_sources().resolve(fault))
    }
}

#[async_trait]
impl<S> AsyncStage<SdkRequest> for AttemptTimeoutStage<S>
where
    S: AsyncStage<SdkRequest, Response = SdkResponse>,
{
    type Response = SdkResponse;

    async fn execute(
        &self,
        request: SdkRequest,
        ctx: &mut ExecutionContext,
    ) -> Result<SdkResponse, SdkError> {
        let attempt_token = ctx.call_token().child();
        let (done, settled) = completion();
        let tracker = self.arm(ctx, &attempt_token, Some(done.clone()));
        ctx.set_attempt_scope(attempt_token.clone(), tracker.handle());

        let work = self.inner.execute(request, ctx);
        let result = first_completion(work, &done, settled, &attempt_token).await;
        tracker.cancel();
        result.map_err(|fault| ctx.fault_sources().resolve(fault))
    }
}

/// [`Layer`] wrapping a stage in [`AttemptTimeoutStage`].
#[derive(Debug, Clone)]
pub struct AttemptTimeoutLayer {
    timer: TimerService,
}

impl AttemptTimeoutLayer {
    pub fn new(timer: TimerService) -> Self {
        Self { timer }
    }
}

impl<S> Layer<S> for AttemptTimeoutLayer {
    type Service = AttemptTimeoutStage<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AttemptTimeoutStage::new(inner, self.timer.clone())
    }
}
