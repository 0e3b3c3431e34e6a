//! Outermost stage: the deadline spanning every attempt of a call.

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

/// Enforces the call timeout and translates the faults it causes into
/// [`SdkError::CallTimeout`].
///
/// The call token is a child of the caller's token, so caller cancellation also reaches every
/// attempt. When the tracker fires, the blocking model signals the call token and lets the
/// in-flight stage unwind; the async model completes the call with the timeout fault first and
/// then signals.
#[derive(Debug, Clone)]
pub struct ApiCallTimeoutStage<S> {
    inner: S,
    timer: TimerService,
}

type Done = Completion<Result<SdkResponse, SdkError>>;

impl<S> ApiCallTimeoutStage<S> {
    pub fn new(inner: S, timer: TimerService) -> Self {
        Self { inner, timer }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn arm(
        &self,
        ctx: &ExecutionContext,
        call_token: &CancellationToken,
        done: Option<Done>,
    ) -> TimeoutTracker {
        let timeout = ctx.call_timeout();
        let events = ctx.events().clone();
        let invocation_id = ctx.invocation_id();
        let progress = ctx.progress().clone();
        let token = call_token.clone();
        TimeoutTracker::arm(&self.timer, TimeoutScope::Call, timeout, move || {
            let timeout = timeout.unwrap_or_default();
            events.emit(ExecutionEvent::TimeoutFired {
                invocation_id,
                scope: TimeoutScope::Call,
                timeout,
            });
            if let Some(done) = done {
                done.complete(Err(SdkError::CallTimeout {
                    timeout,
                    elapsed: progress.elapsed(),
                    attempts: progress.attempts(),
                }));
            }
            token.cancel();
        })
    }
}

impl<S> SyncStage<SdkRequest> for ApiCallTimeoutStage<S>
where
    S: SyncStage<SdkRequest, Response = SdkResponse>,
{
    type Response = SdkResponse;

    fn execute(
        &self,
        request: SdkRequest,
        ctx: &mut ExecutionContext,
    ) -> Result<SdkResponse, SdkError> {
        let call_token = ctx.caller_token().child();
        let tracker = self.arm(ctx, &call_token, None);
        ctx.set_call_scope(call_token, tracker.handle());

        let result = self.inner.execute(request, ctx);
        tracker.cancel();
        result.map_err(|fault| ctx.fault_sources().resolve(fault))
    }
}

#[async_trait]
impl<S> AsyncStage<SdkRequest> for ApiCallTimeoutStage<S>
where
    S: AsyncStage<SdkRequest, Response = SdkResponse>,
{
    type Response = SdkResponse;

    async fn execute(
        &self,
        request: SdkRequest,
        ctx: &mut ExecutionContext,
    ) -> Result<SdkResponse, SdkError> {
        let call_token = ctx.caller_token().child();
        let (done, settled) = completion();
        let tracker = self.arm(ctx, &call_token, Some(done.clone()));
        ctx.set_call_scope(call_token.clone(), tracker.handle());

        let result =
            first_completion(self.inner.execute(request, ctx), &done, settled, &call_token).await;
        tracker.cancel();
        result.map_err(|fault| ctx.fault_sources().resolve(fault))
    }
}

/// [`Layer`] wrapping a stage in [`ApiCallTimeoutStage`].
#[derive(Debug, Clone)]
pub struct ApiCallTimeoutLayer {
    timer: TimerService,
}

impl ApiCallTimeoutLayer {
    pub fn new(timer: TimerService) -> Self {
        Self { timer }
    }
}

impl<S> Layer<S> for ApiCallTimeoutLayer {
    type Service = ApiCallTimeoutStage<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ApiCallTimeoutStage::new(inner, self.timer.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportFault;
    use std::time::Duration;

    /// Blocks until the attempt token is signalled.
    struct Hang;

    impl SyncStage<SdkRequest> for Hang {
        type Response = SdkResponse;

        fn execute(
            &self,
            _: SdkRequest,
            ctx: &mut ExecutionContext,
        ) -> Result<SdkResponse, SdkError> {
            ctx.attempt_token().wait_timeout(Duration::from_secs(30));
            Err(TransportFault::cancelled().into())
        }
    }

    #[async_trait]
    impl AsyncStage<SdkRequest> for Hang {
        type Response = SdkResponse;

        async fn execute(
            &self,
            _: SdkRequest,
            ctx: &mut ExecutionContext,
        ) -> Result<SdkResponse, SdkError> {
            ctx.attempt_token().cancelled().await;
            Err(TransportFault::cancelled().into())
        }
    }

    #[test]
    fn blocking_call_times_out() {
        let stage = ApiCallTimeoutStage::new(Hang, TimerService::dedicated(1).unwrap());
        let mut ctx =
            ExecutionContext::default().with_call_timeout(Some(Duration::from_millis(30)));
        let err = SyncStage::execute(&stage, SdkRequest::get("mem://x"), &mut ctx).unwrap_err();
        assert!(err.is_call_timeout(), "{err:?}");
        assert!(ctx.call_tracker().unwrap().has_fired());
    }

    #[test]
    fn no_timeout_lets_inner_result_through() {
        struct Ok200;
        impl SyncStage<SdkRequest> for Ok200 {
            type Response = SdkResponse;
            fn execute(
                &self,
                _: SdkRequest,
                _: &mut ExecutionContext,
            ) -> Result<SdkResponse, SdkError> {
                Ok(SdkResponse::ok())
            }
        }
        let stage = ApiCallTimeoutStage::new(Ok200, TimerService::dedicated(1).unwrap());
        let mut ctx = ExecutionContext::default();
        let response = SyncStage::execute(&stage, SdkRequest::get("mem://x"), &mut ctx).unwrap();
        assert_eq!(response.status(), 200);
    }

    #[tokio::test(start_paused = true)]
    async fn async_call_times_out() {
        let stage = ApiCallTimeoutStage::new(Hang, TimerService::current().unwrap());
        let mut ctx = ExecutionContext::default().with_call_timeout(Some(Duration::from_secs(1)));
        let err = AsyncStage::execute(&stage, SdkRequest::get("mem://x"), &mut ctx)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SdkError::CallTimeout { timeout, .. } if timeout == Duration::from_secs(1)
        ));
    }

    #[tokio::test]
    async fn caller_cancellation_is_reported_as_such() {
        let caller = CancellationToken::new();
        let stage = ApiCallTimeoutStage::new(Hang, TimerService::current().unwrap());
        let mut ctx = ExecutionContext::new(caller.clone());
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            caller.cancel();
        });
        let err = AsyncStage::execute(&stage, SdkRequest::get("mem://x"), &mut ctx)
            .await
            .unwrap_err();
        assert!(err.is_cancelled_by_caller(), "{err:?}");
        canceller.await.unwrap();
    }
}
