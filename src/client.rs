//! Client façades over the shared pipeline.
//!
//! [`SyncClient`] runs the blocking pipeline on the calling thread. [`AsyncClient`] spawns the
//! non-blocking pipeline as a driver task on a tokio runtime and hands back a [`CallFuture`].
//! Both surface exactly one outcome per call: a response, a call timeout, retries exhausted
//! (wrapping the last real cause), caller cancellation, or an unrecoverable fault.
//!
//! ```rust,no_run
//! use callguard::{SdkRequest, SdkResponse, SyncClient, CancellationToken, SdkError};
//!
//! let client = SyncClient::builder(|_: &SdkRequest, _: &CancellationToken| {
//!     Ok::<_, SdkError>(SdkResponse::ok())
//! })
//! .build()
//! .expect("client");
//! let response = client.execute(SdkRequest::get("https://example.test/")).expect("call");
//! assert_eq!(response.status(), 200);
//! ```

use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::runtime::Handle;
use tower_service::Service;
use tracing::Instrument;

use crate::clock::{Clock, SystemClock};
use crate::completion::{completion, CallFuture};
use crate::config::{ClientOverrideConfig, DynamicConfig, ExecutionOptions};
use crate::context::{ExecutionContext, SdkRequest, SdkResponse};
use crate::error::{BuildError, SdkError};
use crate::retry::RetryStrategy;
use crate::signer::{AsyncSigner, NoopSigner, Signer};
use crate::skew::{ClockSkewCorrector, ClockSkewOffset};
use crate::sleeper::{Sleeper, TimerSleeper, TokioSleeper};
use crate::stage::{build_pipeline, AsyncStage, Pipeline, PipelineParts, SyncStage};
use crate::telemetry::{EventSink, ExecutionEvent, NullSink};
use crate::timer::TimerService;
use crate::transport::{AsyncTransport, ServiceTransport, SyncTransport};

const DEFAULT_TIMER_WORKERS: usize = 2;

/// State shared by every call of one client.
#[derive(Debug, Clone)]
struct ClientShared {
    config: DynamicConfig<ClientOverrideConfig>,
    events: Arc<dyn EventSink>,
    strategy: Arc<RetryStrategy>,
    skew: ClockSkewCorrector,
}

impl ClientShared {
    fn context(&self, options: &mut ExecutionOptions) -> ExecutionContext {
        let snapshot = self.config.get();
        let (call_timeout, attempt_timeout) = options.resolve(&snapshot);
        // Child of the caller's token: cancelling this call must not reach sibling calls.
        let scope = options.take_cancellation().unwrap_or_default().child();
        ExecutionContext::new(scope)
            .with_call_timeout(call_timeout)
            .with_attempt_timeout(attempt_timeout)
            .with_events(self.events.clone())
    }

    fn report(&self, ctx: &ExecutionContext, result: &Result<SdkResponse, SdkError>) {
        let invocation_id = ctx.invocation_id();
        let duration = ctx.elapsed();
        match result {
            Ok(response) => {
                tracing::debug!(
                    %invocation_id,
                    attempts = ctx.attempt(),
                    status = response.status(),
                    elapsed_ms = duration.as_millis() as u64,
                    "call succeeded"
                );
                self.events.emit(ExecutionEvent::CallSucceeded {
                    invocation_id,
                    attempts: ctx.attempt(),
                    duration,
                });
            }
            Err(err) => {
                let attempts = err.attempts().unwrap_or(ctx.attempt());
                tracing::debug!(
                    %invocation_id,
                    attempts,
                    elapsed_ms = duration.as_millis() as u64,
                    error = %err,
                    "call failed"
                );
                self.events.emit(ExecutionEvent::CallFailed {
                    invocation_id,
                    attempts,
                    duration,
                    error: err.to_string(),
                });
            }
        }
    }
}

fn call_span(request: &SdkRequest) -> tracing::Span {
    tracing::debug_span!("call", method = request.method(), uri = request.uri())
}

/// Builder shared by both clients. `T` is the transport contract and `G` the signer contract of
/// the execution model being built.
pub struct ClientBuilder<T: ?Sized, G: ?Sized> {
    transport: Arc<T>,
    signer: Arc<G>,
    config: DynamicConfig<ClientOverrideConfig>,
    strategy: Option<RetryStrategy>,
    sleeper: Option<Arc<dyn Sleeper>>,
    clock: Arc<dyn Clock>,
    skew_offset: Arc<ClockSkewOffset>,
    events: Arc<dyn EventSink>,
    timer: Option<TimerService>,
    timer_workers: usize,
}

/// Builder for [`SyncClient`].
pub type SyncClientBuilder = ClientBuilder<dyn SyncTransport, dyn Signer>;
/// Builder for [`AsyncClient`].
pub type AsyncClientBuilder = ClientBuilder<dyn AsyncTransport, dyn AsyncSigner>;

impl<T: ?Sized, G: ?Sized> ClientBuilder<T, G> {
    fn with_parts(transport: Arc<T>, signer: Arc<G>) -> Self {
        Self {
            transport,
            signer,
            config: DynamicConfig::default(),
            strategy: None,
            sleeper: None,
            clock: Arc::new(SystemClock),
            skew_offset: Arc::new(ClockSkewOffset::new()),
            events: Arc::new(NullSink),
            timer: None,
            timer_workers: DEFAULT_TIMER_WORKERS,
        }
    }

    /// Client-wide timeouts and retry mode.
    pub fn override_config(self, config: ClientOverrideConfig) -> Self {
        self.dynamic_config(DynamicConfig::new(config))
    }

    /// Share a live-updatable config handle with the client.
    pub fn dynamic_config(mut self, config: DynamicConfig<ClientOverrideConfig>) -> Self {
        self.config = config;
        self
    }

    /// Explicit retry strategy; otherwise one is built from the configured retry mode.
    pub fn retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Some(Arc::new(sleeper));
        self
    }

    pub fn clock<C>(mut self, clock: C) -> Self
    where
        C: Clock + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    /// Share one clock-skew offset between several clients of the same service.
    pub fn clock_skew_offset(mut self, offset: Arc<ClockSkewOffset>) -> Self {
        self.skew_offset = offset;
        self
    }

    pub fn event_sink<S>(mut self, sink: S) -> Self
    where
        S: EventSink + 'static,
    {
        self.events = Arc::new(sink);
        self
    }

    pub fn timer(mut self, timer: TimerService) -> Self {
        self.timer = Some(timer);
        self
    }

    /// Worker threads of the dedicated timer pool the blocking client creates when no timer is
    /// given.
    pub fn timer_workers(mut self, workers: usize) -> Self {
        self.timer_workers = workers;
        self
    }

    fn shared(&self) -> Result<ClientShared, BuildError> {
        let strategy = match &self.strategy {
            Some(strategy) => strategy.clone(),
            None => RetryStrategy::for_mode(self.config.get().retry_mode).build()?,
        };
        Ok(ClientShared {
            config: self.config.clone(),
            events: self.events.clone(),
            strategy: Arc::new(strategy),
            skew: ClockSkewCorrector::new(self.skew_offset.clone(), self.clock.clone()),
        })
    }
}

impl SyncClientBuilder {
    pub fn signer<S>(mut self, signer: S) -> Self
    where
        S: Signer + 'static,
    {
        self.signer = Arc::new(signer);
        self
    }

    pub fn build(self) -> Result<SyncClient, BuildError> {
        let shared = self.shared()?;
        let timer = match self.timer {
            Some(timer) => timer,
            None => TimerService::dedicated(self.timer_workers)?,
        };
        let sleeper = self.sleeper.unwrap_or_else(|| Arc::new(TokioSleeper) as Arc<dyn Sleeper>);
        let pipeline = build_pipeline(PipelineParts {
            timer,
            strategy: shared.strategy.clone(),
            sleeper,
            skew: shared.skew.clone(),
            signer: self.signer,
            transport: self.transport,
        });
        tracing::debug!(mode = %shared.strategy.mode(), "blocking client built");
        Ok(SyncClient { pipeline, shared })
    }
}

impl AsyncClientBuilder {
    pub fn signer<S>(mut self, signer: S) -> Self
    where
        S: AsyncSigner + 'static,
    {
        self.signer = Arc::new(signer);
        self
    }

    /// Build on the ambient tokio runtime, or on the runtime of an explicitly configured timer.
    pub fn build(self) -> Result<AsyncClient, BuildError> {
        let timer = match self.timer.clone() {
            Some(timer) => timer,
            None => TimerService::current()?,
        };
        self.build_on(timer)
    }

    fn build_on(self, timer: TimerService) -> Result<AsyncClient, BuildError> {
        let shared = self.shared()?;
        let runtime = timer.handle().clone();
        let sleeper = self
            .sleeper
            .unwrap_or_else(|| Arc::new(TimerSleeper::new(timer.clone())) as Arc<dyn Sleeper>);
        let pipeline = build_pipeline(PipelineParts {
            timer,
            strategy: shared.strategy.clone(),
            sleeper,
            skew: shared.skew.clone(),
            signer: self.signer,
            transport: self.transport,
        });
        tracing::debug!(mode = %shared.strategy.mode(), "async client built");
        Ok(AsyncClient { inner: Arc::new(AsyncInner { pipeline, shared, runtime }) })
    }
}

/// Blocking client.
pub struct SyncClient {
    pipeline: Pipeline<dyn Signer, dyn SyncTransport>,
    shared: ClientShared,
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("strategy", &self.shared.strategy)
            .finish_non_exhaustive()
    }
}

impl SyncClient {
    pub fn builder<T>(transport: T) -> SyncClientBuilder
    where
        T: SyncTransport + 'static,
    {
        ClientBuilder::with_parts(
            Arc::new(transport) as Arc<dyn SyncTransport>,
            Arc::new(NoopSigner) as Arc<dyn Signer>,
        )
    }

    /// Run one call to completion on the calling thread.
    pub fn execute(&self, request: SdkRequest) -> Result<SdkResponse, SdkError> {
        self.execute_with(request, ExecutionOptions::new())
    }

    pub fn execute_with(
        &self,
        request: SdkRequest,
        mut options: ExecutionOptions,
    ) -> Result<SdkResponse, SdkError> {
        let mut ctx = self.shared.context(&mut options);
        let span = call_span(&request);
        let _entered = span.enter();
        let result = SyncStage::execute(&self.pipeline, request, &mut ctx);
        self.shared.report(&ctx, &result);
        result
    }

    pub fn config(&self) -> &DynamicConfig<ClientOverrideConfig> {
        &self.shared.config
    }

    pub fn retry_strategy(&self) -> &Arc<RetryStrategy> {
        &self.shared.strategy
    }

    pub fn clock_skew_offset(&self) -> &Arc<ClockSkewOffset> {
        self.shared.skew.offset()
    }
}

struct AsyncInner {
    pipeline: Pipeline<dyn AsyncSigner, dyn AsyncTransport>,
    shared: ClientShared,
    runtime: Handle,
}

/// Non-blocking client. Cheap to clone; clones share the pipeline and all client state.
#[derive(Clone)]
pub struct AsyncClient {
    inner: Arc<AsyncInner>,
}

impl std::fmt::Debug for AsyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncClient")
            .field("strategy", &self.inner.shared.strategy)
            .finish_non_exhaustive()
    }
}

impl AsyncClient {
    pub fn builder<T>(transport: T) -> AsyncClientBuilder
    where
        T: AsyncTransport + 'static,
    {
        ClientBuilder::with_parts(
            Arc::new(transport) as Arc<dyn AsyncTransport>,
            Arc::new(NoopSigner) as Arc<dyn AsyncSigner>,
        )
    }

    /// Builder over a tower service used as the transport.
    pub fn from_service<S>(service: S) -> AsyncClientBuilder
    where
        S: Service<SdkRequest, Response = SdkResponse> + Clone + Send + Sync + 'static,
        S::Error: Into<SdkError>,
        S::Future: Send,
    {
        Self::builder(ServiceTransport::new(service))
    }

    /// Start a call. The driver runs whether or not the returned future is polled; dropping or
    /// cancelling the future stops it.
    pub fn execute(&self, request: SdkRequest) -> CallFuture<SdkResponse> {
        self.execute_with(request, ExecutionOptions::new())
    }

    pub fn execute_with(
        &self,
        request: SdkRequest,
        mut options: ExecutionOptions,
    ) -> CallFuture<SdkResponse> {
        let mut ctx = self.inner.shared.context(&mut options);
        let scope = ctx.caller_token().clone();
        let (done, settled) = completion();
        let driver_done = done.clone();
        let inner = self.inner.clone();
        let span = call_span(&request);
        let driver = self.inner.runtime.spawn(
            async move {
                let result = AsyncStage::execute(&inner.pipeline, request, &mut ctx).await;
                inner.shared.report(&ctx, &result);
                driver_done.complete(result);
            }
            .instrument(span),
        );
        CallFuture::new(settled, done, scope, Some(driver.abort_handle()))
    }

    pub fn config(&self) -> &DynamicConfig<ClientOverrideConfig> {
        &self.inner.shared.config
    }

    pub fn retry_strategy(&self) -> &Arc<RetryStrategy> {
        &self.inner.shared.strategy
    }

    pub fn clock_skew_offset(&self) -> &Arc<ClockSkewOffset> {
        self.inner.shared.skew.offset()
    }
}

impl Service<SdkRequest> for AsyncClient {
    type Response = SdkResponse;
    type Error = SdkError;
    type Future = CallFuture<SdkResponse>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: SdkRequest) -> Self::Future {
        self.execute(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationToken;
    use crate::error::ServiceFault;
    use crate::sleeper::InstantSleeper;
    use crate::telemetry::MemorySink;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn flaky(
        failures: u32,
    ) -> impl Fn(&SdkRequest, &CancellationToken) -> Result<SdkResponse, SdkError> {
        let calls = AtomicU32::new(0);
        move |_: &SdkRequest, _: &CancellationToken| -> Result<SdkResponse, SdkError> {
            if calls.fetch_add(1, Ordering::SeqCst) < failures {
                Err(ServiceFault::new(503, "unavailable").into())
            } else {
                Ok(SdkResponse::ok())
            }
        }
    }

    #[test]
    fn sync_client_reports_success_event() {
        let sink = Arc::new(MemorySink::new());
        let client = SyncClient::builder(flaky(1))
            .sleeper(InstantSleeper)
            .event_sink(sink.clone())
            .timer_workers(1)
            .build()
            .unwrap();
        client.execute(SdkRequest::get("mem://x")).unwrap();
        let done = sink.of_kind("call_succeeded");
        assert!(matches!(done.as_slice(), [ExecutionEvent::CallSucceeded { attempts: 2, .. }]));
    }

    #[test]
    fn zero_timer_workers_is_rejected() {
        let err = SyncClient::builder(flaky(0)).timer_workers(0).build().unwrap_err();
        assert!(matches!(err, BuildError::InvalidWorkerCount(0)));
    }

    #[test]
    fn async_builder_needs_a_runtime() {
        let transport = ServiceTransport::new(tower::service_fn(|_: SdkRequest| async {
            Ok::<_, SdkError>(SdkResponse::ok())
        }));
        let err = AsyncClient::builder(transport).build().unwrap_err();
        assert!(matches!(err, BuildError::NoRuntime));
    }

    #[tokio::test]
    async fn async_client_is_a_tower_service() {
        use tower::ServiceExt;
        let client = AsyncClient::from_service(tower::service_fn(|request: SdkRequest| async move {
            Ok::<_, SdkError>(SdkResponse::ok().with_body(request.uri().as_bytes().to_vec()))
        }))
        .build()
        .unwrap();
        let response = client.oneshot(SdkRequest::get("mem://svc")).await.unwrap();
        assert_eq!(response.body(), b"mem://svc");
    }
}
