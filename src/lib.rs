#![forbid(unsafe_code)]

//! # callguard
//!
//! The request-execution core of a service-client SDK: a pipeline that turns one logical call
//! into one or more physical attempts while enforcing
//!
//! - **retry admission** with a shared capacity pool, exponential backoff with jitter and
//!   server `Retry-After` hints ([`retry`]);
//! - **two timeout scopes**, one spanning the whole call and one per attempt, with a single
//!   deterministic precedence rule ([`timeout`]);
//! - **clock-skew correction** of the signing time ([`skew`]);
//! - **cooperative cancellation** in both a blocking and a non-blocking execution model
//!   ([`cancel`], [`completion`]).
//!
//! Sending bytes, signing and deciding which faults are retryable are collaborators behind
//! traits ([`SyncTransport`]/[`AsyncTransport`], [`Signer`]/[`AsyncSigner`], [`RetryPolicy`]).
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use callguard::{AsyncClient, ClientOverrideConfig, SdkError, SdkRequest, SdkResponse};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), SdkError> {
//!     let service = tower::service_fn(|_request: SdkRequest| async {
//!         Ok::<_, SdkError>(SdkResponse::ok())
//!     });
//!     let client = AsyncClient::from_service(service)
//!         .override_config(
//!             ClientOverrideConfig::builder()
//!                 .api_call_timeout(Duration::from_secs(10))
//!                 .api_call_attempt_timeout(Duration::from_secs(2))
//!                 .build(),
//!         )
//!         .build()
//!         .expect("runtime available");
//!
//!     let response = client.execute(SdkRequest::get("https://example.test/")).await?;
//!     assert_eq!(response.status(), 200);
//!     Ok(())
//! }
//! ```
//!
//! ## Pipeline
//!
//! ```text
//! ApiCallTimeoutStage → RetryableStage → AttemptTimeoutStage → SigningStage → TransportStage
//! ```
//!
//! Each stage is one struct implementing both [`stage::SyncStage`] and [`stage::AsyncStage`];
//! see [`stage`].

pub mod backoff;
pub mod cancel;
pub mod client;
pub mod clock;
pub mod completion;
pub mod config;
pub mod context;
pub mod error;
pub mod jitter;
pub mod retry;
pub mod signer;
pub mod skew;
pub mod sleeper;
pub mod stage;
pub mod telemetry;
pub mod timeout;
pub mod timer;
pub mod transport;

// Re-exports
pub use backoff::{Backoff, BackoffError};
pub use cancel::CancellationToken;
pub use client::{AsyncClient, AsyncClientBuilder, ClientBuilder, SyncClient, SyncClientBuilder};
pub use clock::{Clock, ManualClock, SystemClock};
pub use completion::CallFuture;
pub use config::{
    ClientOverrideConfig, ClientOverrideConfigBuilder, DynamicConfig, ExecutionOptions,
};
pub use context::{
    ContentStreamProvider, ExecutionContext, RequestBody, SdkRequest, SdkResponse,
    INVOCATION_ID_HEADER, REQUEST_INFO_HEADER,
};
pub use error::{
    BuildError, ExhaustionReason, SdkError, ServiceFault, TransportFault, TransportFaultKind,
};
pub use jitter::Jitter;
pub use retry::{
    DefaultRetryPolicy, RetryDecision, RetryMode, RetryPolicy, RetryStrategy, RetryStrategyBuilder,
    RetryToken, SendRateLimiter, TokenBucket, TokenState,
};
pub use signer::{AsyncSigner, NoopSigner, Signer, SigningContext, TimestampSigner};
pub use skew::{ClockSkewCorrector, ClockSkewOffset};
pub use sleeper::{InstantSleeper, Sleeper, TimerSleeper, TokioSleeper, TrackingSleeper};
pub use telemetry::{EventSink, ExecutionEvent, LogSink, MemorySink, NullSink};
pub use timeout::{TimeoutScope, TimeoutTracker, TrackerState};
pub use timer::TimerService;
pub use transport::{AsyncTransport, ServiceTransport, SyncTransport};
