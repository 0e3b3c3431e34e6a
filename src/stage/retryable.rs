//! The retry loop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tower_layer::Layer;

use crate::context::{ExecutionContext, SdkRequest, SdkResponse};
use crate::error::SdkError;
use crate::retry::{RetryDecision, RetryStrategy, RetryToken};
use crate::skew::ClockSkewCorrector;
use crate::sleeper::Sleeper;
use crate::stage::{AsyncStage, SyncStage};
use crate::telemetry::ExecutionEvent;

/// Runs the inner stage once per attempt until the retry strategy says stop.
///
/// Every attempt starts from a fresh clone of the original request, so headers and body state
/// written by one attempt never leak into the next. Before each attempt, and when a backoff wait
/// is cut short, the call-level outcome (call timeout, caller cancellation) is checked first and
/// ends the loop without consulting the strategy.
#[derive(Debug, Clone)]
pub struct RetryableStage<S> {
    inner: S,
    strategy: Arc<RetryStrategy>,
    sleeper: Arc<dyn Sleeper>,
    skew: ClockSkewCorrector,
}

enum Next {
    Done(Result<SdkResponse, SdkError>),
    Wait(Duration),
}

impl<S> RetryableStage<S> {
    pub fn new(
        inner: S,
        strategy: Arc<RetryStrategy>,
        sleeper: Arc<dyn Sleeper>,
        skew: ClockSkewCorrector,
    ) -> Self {
        Self { inner, strategy, sleeper, skew }
    }

    pub fn strategy(&self) -> &Arc<RetryStrategy> {
        &self.strategy
    }

    fn prepare_attempt(
        &self,
        token: &mut RetryToken,
        original: &SdkRequest,
        ctx: &mut ExecutionContext,
    ) -> Result<SdkRequest, SdkError> {
        let attempt = self.strategy.starting_attempt(token, ctx);
        let mut request = original.clone();
        ctx.stamp_attempt_headers(&mut request)?;
        ctx.emit(ExecutionEvent::AttemptStarted {
            invocation_id: ctx.invocation_id(),
            attempt,
            max_attempts: token.max_attempts(),
        });
        Ok(request)
    }

    fn after_attempt(
        &self,
        token: &mut RetryToken,
        outcome: Result<SdkResponse, SdkError>,
        ctx: &mut ExecutionContext,
    ) -> Next {
        let fault = match outcome {
            Ok(response) => {
                self.strategy.classify(token, Ok(&response));
                return Next::Done(Ok(response));
            }
            Err(fault) => fault,
        };
        if fault.is_terminal() {
            return Next::Done(Err(fault));
        }

        ctx.record_fault(&fault);
        ctx.emit(ExecutionEvent::AttemptFailed {
            invocation_id: ctx.invocation_id(),
            attempt: token.attempt(),
            error: fault.to_string(),
        });
        if let Some(sent_at) = ctx.attempt_sent_at() {
            if let Some(offset_ms) = self.skew.observe(&fault, sent_at) {
                ctx.emit(ExecutionEvent::ClockSkewAdjusted {
                    invocation_id: ctx.invocation_id(),
                    offset_ms,
                });
            }
        }

        match self.strategy.classify(token, Err(&fault)) {
            RetryDecision::Retry(delay) => {
                ctx.emit(ExecutionEvent::RetryScheduled {
                    invocation_id: ctx.invocation_id(),
                    attempt: token.attempt(),
                    delay,
                    capacity_remaining: token.capacity_remaining(),
                });
                Next::Wait(delay)
            }
            RetryDecision::Exhausted(reason) => {
                Next::Done(Err(SdkError::exhausted(token.attempt(), reason, fault)))
            }
            // classify never reports success for a fault
            RetryDecision::Success => Next::Done(Err(fault)),
        }
    }
}

fn interrupted_wait(ctx: &ExecutionContext) -> SdkError {
    ctx.fault_sources().call_level_fault().unwrap_or(SdkError::Interrupted)
}

fn initial_wait(delay: Duration) -> Option<Duration> {
    (!delay.is_zero()).then_some(delay)
}

impl<S> SyncStage<SdkRequest> for RetryableStage<S>
where
    S: SyncStage<SdkRequest, Response = SdkResponse>,
{
    type Response = SdkResponse;

    fn execute(
        &self,
        request: SdkRequest,
        ctx: &mut ExecutionContext,
    ) -> Result<SdkResponse, SdkError> {
        let (mut token, delay) = self.strategy.acquire_initial_token();
        let mut wait = initial_wait(delay);
        loop {
            if let Some(delay) = wait.take() {
                if self.sleeper.sleep_blocking(delay, ctx.call_token()) {
                    return Err(interrupted_wait(ctx));
                }
            }
            if let Some(fault) = ctx.fault_sources().call_level_fault() {
                return Err(fault);
            }

            let attempt_request = self.prepare_attempt(&mut token, &request, ctx)?;
            let outcome = self.inner.execute(attempt_request, ctx);
            match self.after_attempt(&mut token, outcome, ctx) {
                Next::Done(result) => return result,
                Next::Wait(delay) => wait = Some(delay),
            }
        }
    }
}

#[async_trait]
impl<S> AsyncStage<SdkRequest> for RetryableStage<S>
where
    S: AsyncStage<SdkRequest, Response = SdkResponse>,
{
    type Response = SdkResponse;

    async fn execute(
        &self,
        request: SdkRequest,
        ctx: &mut ExecutionContext,
    ) -> Result<SdkResponse, SdkError> {
        let (mut token, delay) = self.strategy.acquire_initial_token();
        let mut wait = initial_wait(delay);
        loop {
            if let Some(delay) = wait.take() {
                let call_token = ctx.call_token().clone();
                tokio::select! {
                    _ = self.sleeper.sleep(delay) => {}
                    _ = call_token.cancelled() => return Err(interrupted_wait(ctx)),
                }
            }
            if let Some(fault) = ctx.fault_sources().call_level_fault() {
                return Err(fault);
            }

            let attempt_request = self.prepare_attempt(&mut token, &request, ctx)?;
            let outcome = self.inner.execute(attempt_request, ctx).await;
            match self.after_attempt(&mut token, outcome, ctx) {
                Next::Done(result) => return result,
                Next::Wait(delay) => wait = Some(delay),
            }
        }
    }
}

/// [`Layer`] wrapping a stage in [`RetryableStage`].
#[derive(Debug, Clone)]
pub struct RetryableLayer {
    strategy: Arc<RetryStrategy>,
    sleeper: Arc<dyn Sleeper>,
    skew: ClockSkewCorrector,
}

impl RetryableLayer {
    pub fn new(
        strategy: Arc<RetryStrategy>,
        sleeper: Arc<dyn Sleeper>,
        skew: ClockSkewCorrector,
    ) -> Self {
        Self { strategy, sleeper, skew }
    }
}

impl<S> Layer<S> for RetryableLayer {
    type Service = RetryableStage<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RetryableStage::new(inner, self.strategy.clone(), self.sleeper.clone(), self.skew.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::context::REQUEST_INFO_HEADER;
    use crate::error::{ExhaustionReason, ServiceFault};
    use crate::jitter::Jitter;
    use crate::skew::ClockSkewOffset;
    use crate::sleeper::TrackingSleeper;
    use std::sync::Mutex;

    /// Replays scripted outcomes and records the attempt header of every request it sees.
    struct Script {
        outcomes: Mutex<Vec<Result<SdkResponse, SdkError>>>,
        seen: Mutex<Vec<String>>,
    }

    impl Script {
        fn new(mut outcomes: Vec<Result<SdkResponse, SdkError>>) -> Self {
            outcomes.reverse();
            Self { outcomes: Mutex::new(outcomes), seen: Mutex::new(Vec::new()) }
        }
    }

    impl SyncStage<SdkRequest> for Script {
        type Response = SdkResponse;

        fn execute(
            &self,
            request: SdkRequest,
            _: &mut ExecutionContext,
        ) -> Result<SdkResponse, SdkError> {
            self.seen
                .lock()
                .unwrap()
                .push(request.header(REQUEST_INFO_HEADER).unwrap_or_default().to_owned());
            self.outcomes.lock().unwrap().pop().unwrap_or_else(|| Ok(SdkResponse::ok()))
        }
    }

    fn stage(script: Script, sleeper: &TrackingSleeper) -> RetryableStage<Script> {
        let strategy = RetryStrategy::builder()
            .base_delay(Duration::from_millis(100))
            .with_jitter(Jitter::None)
            .build()
            .unwrap();
        let skew = ClockSkewCorrector::new(
            Arc::new(ClockSkewOffset::new()),
            Arc::new(ManualClock::default()),
        );
        RetryableStage::new(script, Arc::new(strategy), Arc::new(sleeper.clone()), skew)
    }

    fn unavailable() -> Result<SdkResponse, SdkError> {
        Err(ServiceFault::new(503, "unavailable").into())
    }

    #[test]
    fn retries_until_success_with_backoff() {
        let sleeper = TrackingSleeper::new();
        let stage = stage(Script::new(vec![unavailable(), unavailable()]), &sleeper);
        let mut ctx = ExecutionContext::default();

        let response = SyncStage::execute(&stage, SdkRequest::get("mem://x"), &mut ctx).unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(ctx.attempt(), 3);
        assert_eq!(sleeper.calls(), vec![Duration::from_millis(100), Duration::from_millis(200)]);
        assert_eq!(
            *stage.inner.seen.lock().unwrap(),
            vec!["attempt=1; max=3", "attempt=2; max=3", "attempt=3; max=3"]
        );
    }

    #[test]
    fn gives_up_at_max_attempts() {
        let sleeper = TrackingSleeper::new();
        let stage = stage(Script::new(vec![unavailable(), unavailable(), unavailable()]), &sleeper);
        let mut ctx = ExecutionContext::default();

        let err = SyncStage::execute(&stage, SdkRequest::get("mem://x"), &mut ctx).unwrap_err();
        assert_eq!(err.exhaustion_info(), Some((3, ExhaustionReason::MaxAttemptsReached)));
        assert_eq!(
            err.last_cause().and_then(SdkError::as_service_fault).map(|f| f.status()),
            Some(503)
        );
        assert_eq!(sleeper.calls().len(), 2);
    }

    #[test]
    fn non_retryable_fault_stops_after_one_attempt() {
        let sleeper = TrackingSleeper::new();
        let stage = stage(Script::new(vec![Err(ServiceFault::new(400, "bad").into())]), &sleeper);
        let mut ctx = ExecutionContext::default();

        let err = SyncStage::execute(&stage, SdkRequest::get("mem://x"), &mut ctx).unwrap_err();
        assert_eq!(err.exhaustion_info(), Some((1, ExhaustionReason::NonRetryable)));
        assert!(sleeper.calls().is_empty());
    }

    #[test]
    fn terminal_fault_passes_through_untouched() {
        let sleeper = TrackingSleeper::new();
        let stage = stage(Script::new(vec![Err(SdkError::Interrupted)]), &sleeper);
        let mut ctx = ExecutionContext::default();

        let err = SyncStage::execute(&stage, SdkRequest::get("mem://x"), &mut ctx).unwrap_err();
        assert!(matches!(err, SdkError::Interrupted));
    }

    #[test]
    fn retry_after_is_used_verbatim() {
        let sleeper = TrackingSleeper::new();
        let throttled = Err(ServiceFault::new(429, "slow down")
            .with_retry_after(Duration::from_secs(7))
            .into());
        let stage = stage(Script::new(vec![throttled]), &sleeper);
        let mut ctx = ExecutionContext::default();

        SyncStage::execute(&stage, SdkRequest::get("mem://x"), &mut ctx).unwrap();
        assert_eq!(sleeper.calls(), vec![Duration::from_secs(7)]);
    }

    #[test]
    fn caller_cancellation_before_attempt_is_reported() {
        let sleeper = TrackingSleeper::new();
        let stage = stage(Script::new(vec![]), &sleeper);
        let caller = crate::cancel::CancellationToken::new();
        caller.cancel();
        let mut ctx = ExecutionContext::new(caller);

        let err = SyncStage::execute(&stage, SdkRequest::get("mem://x"), &mut ctx).unwrap_err();
        assert!(err.is_cancelled_by_caller());
        assert_eq!(ctx.attempt(), 0, "no attempt started");
    }
}
