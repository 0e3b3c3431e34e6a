//! Fault taxonomy for the execution pipeline.
//!
//! Every call surfaces exactly one of: a response, [`SdkError::CallTimeout`],
//! [`SdkError::RetriesExhausted`] (wrapping the last real cause), [`SdkError::CancelledByCaller`],
//! or an unrecoverable fault. Attempt-level faults ([`SdkError::AttemptTimeout`],
//! [`SdkError::Transport`], [`SdkError::Service`]) only reach the caller wrapped in
//! `RetriesExhausted`, because every one of them passes through retry classification.

use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::backoff::BackoffError;

/// Broad category of a transport-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportFaultKind {
    /// Connection could not be established.
    Connect,
    /// I/O failed mid-exchange (reset, broken pipe, truncated body).
    Io,
    /// The transport observed its cancellation token and gave up.
    Cancelled,
    /// Anything the transport could not categorize.
    Other,
}

impl fmt::Display for TransportFaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportFaultKind::Connect => "connect",
            TransportFaultKind::Io => "io",
            TransportFaultKind::Cancelled => "cancelled",
            TransportFaultKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// A fault raised below the service layer: no service response was received.
#[derive(Debug, Clone)]
pub struct TransportFault {
    kind: TransportFaultKind,
    message: String,
    source: Option<Arc<dyn Error + Send + Sync>>,
}

impl TransportFault {
    pub fn new(kind: TransportFaultKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), source: None }
    }

    /// Fault reported by a transport that stopped because its token was signalled.
    pub fn cancelled() -> Self {
        Self::new(TransportFaultKind::Cancelled, "transport observed cancellation")
    }

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        self.source = Some(Arc::new(source));
        self
    }

    pub fn kind(&self) -> TransportFaultKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == TransportFaultKind::Cancelled
    }
}

impl fmt::Display for TransportFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport fault ({}): {}", self.kind, self.message)
    }
}

impl Error for TransportFault {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source.as_deref().map(|e| e as &(dyn Error + 'static))
    }
}

impl From<std::io::Error> for TransportFault {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::NotConnected => {
                TransportFaultKind::Connect
            }
            std::io::ErrorKind::Interrupted => TransportFaultKind::Cancelled,
            _ => TransportFaultKind::Io,
        };
        Self::new(kind, err.to_string()).with_source(err)
    }
}

/// A structured error response reported by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceFault {
    status: u16,
    code: Option<String>,
    message: String,
    request_id: Option<String>,
    retry_after: Option<Duration>,
    server_time: Option<SystemTime>,
}

impl ServiceFault {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            code: None,
            message: message.into(),
            request_id: None,
            retry_after: None,
            server_time: None,
        }
    }

    /// Attach the service error code (e.g. `ThrottlingException`).
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Server-suggested delay before the next attempt (`Retry-After`).
    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    /// Server clock reading carried by the response (`Date` header).
    pub fn with_server_time(mut self, server_time: SystemTime) -> Self {
        self.server_time = Some(server_time);
        self
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    pub fn server_time(&self) -> Option<SystemTime> {
        self.server_time
    }
}

impl fmt::Display for ServiceFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "service fault (status {}", self.status)?;
        if let Some(code) = &self.code {
            write!(f, ", code {}", code)?;
        }
        if let Some(id) = &self.request_id {
            write!(f, ", request id {}", id)?;
        }
        write!(f, "): {}", self.message)
    }
}

impl Error for ServiceFault {}

/// Why the retry engine stopped retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExhaustionReason {
    /// The policy does not consider the last fault retryable.
    NonRetryable,
    /// The attempt count reached the policy maximum.
    MaxAttemptsReached,
    /// The shared capacity pool could not cover the cost of another attempt.
    CapacityExhausted,
}

impl fmt::Display for ExhaustionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ExhaustionReason::NonRetryable => "non-retryable fault",
            ExhaustionReason::MaxAttemptsReached => "max attempts reached",
            ExhaustionReason::CapacityExhausted => "retry capacity exhausted",
        };
        f.write_str(text)
    }
}

/// The error surfaced by the pipeline.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SdkError {
    /// The call-scope deadline expired. Terminal, never retried.
    #[error("call timed out after {elapsed:?} (limit {timeout:?}, {attempts} attempt(s) started)")]
    CallTimeout { timeout: Duration, elapsed: Duration, attempts: u32 },
    /// A single attempt exceeded its deadline. Retryable.
    #[error("attempt {attempt} timed out (limit {timeout:?})")]
    AttemptTimeout { attempt: u32, timeout: Duration },
    /// No service response was received.
    #[error(transparent)]
    Transport(TransportFault),
    /// The service answered with an error.
    #[error(transparent)]
    Service(ServiceFault),
    /// The retry engine gave up; `last` is the fault of the final attempt.
    #[error("retries exhausted after {attempts} attempt(s) ({reason}); last error: {last}")]
    RetriesExhausted {
        attempts: u32,
        reason: ExhaustionReason,
        #[source]
        last: Box<SdkError>,
    },
    /// The caller cancelled the call. Terminal, not classified.
    #[error("call cancelled by caller")]
    CancelledByCaller,
    /// The worker was cancelled by something other than a timeout tracker or the caller.
    #[error("execution interrupted by an unrelated cancellation signal")]
    Interrupted,
    /// The request carries a malformed header name or value. Retrying cannot fix it.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The identity/signing collaborator failed.
    #[error("request signing failed: {0}")]
    Signing(String),
    /// A broken pipeline invariant.
    #[error("internal pipeline error: {0}")]
    Internal(String),
}

impl From<TransportFault> for SdkError {
    fn from(fault: TransportFault) -> Self {
        SdkError::Transport(fault)
    }
}

impl From<ServiceFault> for SdkError {
    fn from(fault: ServiceFault) -> Self {
        SdkError::Service(fault)
    }
}

impl SdkError {
    pub(crate) fn exhausted(attempts: u32, reason: ExhaustionReason, last: SdkError) -> Self {
        SdkError::RetriesExhausted { attempts, reason, last: Box::new(last) }
    }

    /// Faults that end the call without passing through retry classification.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SdkError::CallTimeout { .. }
                | SdkError::RetriesExhausted { .. }
                | SdkError::CancelledByCaller
                | SdkError::Interrupted
                | SdkError::InvalidRequest(_)
                | SdkError::Internal(_)
        )
    }

    pub fn is_call_timeout(&self) -> bool {
        matches!(self, SdkError::CallTimeout { .. })
    }

    pub fn is_attempt_timeout(&self) -> bool {
        matches!(self, SdkError::AttemptTimeout { .. })
    }

    pub fn is_retries_exhausted(&self) -> bool {
        matches!(self, SdkError::RetriesExhausted { .. })
    }

    pub fn is_cancelled_by_caller(&self) -> bool {
        matches!(self, SdkError::CancelledByCaller)
    }

    pub fn as_service_fault(&self) -> Option<&ServiceFault> {
        match self {
            SdkError::Service(fault) => Some(fault),
            _ => None,
        }
    }

    pub fn as_transport_fault(&self) -> Option<&TransportFault> {
        match self {
            SdkError::Transport(fault) => Some(fault),
            _ => None,
        }
    }

    /// Server-suggested retry delay, if this is a service fault carrying one.
    pub fn retry_after(&self) -> Option<Duration> {
        self.as_service_fault().and_then(ServiceFault::retry_after)
    }

    /// Access retry exhaustion info as (attempts, reason).
    pub fn exhaustion_info(&self) -> Option<(u32, ExhaustionReason)> {
        match self {
            SdkError::RetriesExhausted { attempts, reason, .. } => Some((*attempts, *reason)),
            _ => None,
        }
    }

    /// Number of attempts started, for faults that end the call.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            SdkError::RetriesExhausted { attempts, .. }
            | SdkError::CallTimeout { attempts, .. } => {
                Some(*attempts)
            }
            _ => None,
        }
    }

    /// The fault of the last attempt when retries were exhausted.
    pub fn last_cause(&self) -> Option<&SdkError> {
        match self {
            SdkError::RetriesExhausted { last, .. } => Some(last.as_ref()),
            _ => None,
        }
    }

    /// Innermost pipeline fault, unwrapping `RetriesExhausted`.
    pub fn root_cause(&self) -> &SdkError {
        let mut current = self;
        while let SdkError::RetriesExhausted { last, .. } = current {
            current = last;
        }
        current
    }
}

/// Errors produced while building engine components or clients.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// `max_attempts` must be > 0.
    #[error("max_attempts must be > 0 (got {0})")]
    InvalidMaxAttempts(u32),
    /// Capacity pool must hold at least one token.
    #[error("token bucket capacity must be > 0 (got {0})")]
    InvalidCapacity(u32),
    /// Timer service needs at least one worker.
    #[error("timer service needs at least one worker thread (got {0})")]
    InvalidWorkerCount(usize),
    /// The dedicated timer runtime could not start.
    #[error("failed to start timer runtime: {0}")]
    TimerRuntime(#[from] std::io::Error),
    /// Backoff configuration was rejected.
    #[error(transparent)]
    Backoff(#[from] BackoffError),
    /// An async client was built outside a tokio runtime without an explicit timer service.
    #[error("no tokio runtime available; supply a TimerService explicitly")]
    NoRuntime,
}
