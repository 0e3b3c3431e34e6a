//! Retry policy collaborator.
//!
//! The engine asks the policy two questions: is this fault retryable, and how many attempts may
//! a call make. It also asks whether a fault is throttling, which selects the throttling backoff
//! base and cost and feeds the adaptive send-rate limiter.

use std::fmt;
use std::sync::Arc;

use crate::error::{BuildError, SdkError, ServiceFault};
use crate::skew::has_clock_skew_code;

/// Error codes reported by services when the caller is sending too fast.
pub const THROTTLING_ERROR_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "ThrottledException",
    "TooManyRequestsException",
    "RequestThrottled",
    "RequestThrottledException",
    "RequestLimitExceeded",
    "SlowDown",
    "ProvisionedThroughputExceededException",
    "TransactionInProgressException",
    "BandwidthLimitExceeded",
    "PriorRequestNotComplete",
    "EC2ThrottledException",
];

/// Status codes retried by default.
pub const RETRYABLE_STATUS_CODES: &[u16] = &[500, 502, 503, 504];

/// Service faults that signal throttling: status 429 or a throttling error code.
pub fn is_throttling_fault(fault: &SdkError) -> bool {
    fault.as_service_fault().map(is_throttling_service_fault).unwrap_or(false)
}

fn is_throttling_service_fault(fault: &ServiceFault) -> bool {
    fault.status() == 429
        || fault.code().map(|code| THROTTLING_ERROR_CODES.contains(&code)).unwrap_or(false)
}

/// The conditions every retry mode retries on unless told otherwise.
pub fn is_retryable_by_default(fault: &SdkError) -> bool {
    match fault {
        SdkError::Transport(transport) => !transport.is_cancelled(),
        SdkError::AttemptTimeout { .. } => true,
        SdkError::Service(service) => {
            is_throttling_service_fault(service)
                || RETRYABLE_STATUS_CODES.contains(&service.status())
                || has_clock_skew_code(service)
        }
        _ => false,
    }
}

/// Injected retry policy.
pub trait RetryPolicy: Send + Sync + fmt::Debug {
    /// Total attempts allowed per call (initial attempt included).
    fn max_attempts(&self) -> u32;

    fn is_retryable(&self, fault: &SdkError) -> bool;

    fn is_throttling(&self, fault: &SdkError) -> bool {
        is_throttling_fault(fault)
    }
}

type Predicate = Arc<dyn Fn(&SdkError) -> bool + Send + Sync>;

/// Policy built from predicates: a fault is retryable when any predicate accepts it.
#[derive(Clone)]
pub struct DefaultRetryPolicy {
    max_attempts: u32,
    retry_on: Vec<Predicate>,
    throttling: Predicate,
}

impl fmt::Debug for DefaultRetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultRetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("predicates", &self.retry_on.len())
            .finish()
    }
}

impl DefaultRetryPolicy {
    pub fn builder() -> DefaultRetryPolicyBuilder {
        DefaultRetryPolicyBuilder::new()
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn is_retryable(&self, fault: &SdkError) -> bool {
        self.retry_on.iter().any(|predicate| predicate(fault))
    }

    fn is_throttling(&self, fault: &SdkError) -> bool {
        (self.throttling)(fault)
    }
}

/// Builder for [`DefaultRetryPolicy`].
pub struct DefaultRetryPolicyBuilder {
    max_attempts: u32,
    defaults: bool,
    retry_on: Vec<Predicate>,
    throttling: Predicate,
}

impl DefaultRetryPolicyBuilder {
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            defaults: true,
            retry_on: Vec::new(),
            throttling: Arc::new(is_throttling_fault),
        }
    }

    /// Total attempts (initial + retries). Must be > 0.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Drop the default retryable conditions; only added predicates apply.
    pub fn without_default_conditions(mut self) -> Self {
        self.defaults = false;
        self
    }

    /// Also retry faults matching `predicate`.
    pub fn retry_on<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&SdkError) -> bool + Send + Sync + 'static,
    {
        self.retry_on.push(Arc::new(predicate));
        self
    }

    /// Also retry service faults with any of these status codes.
    pub fn retry_on_status(self, statuses: &[u16]) -> Self {
        let statuses = statuses.to_vec();
        self.retry_on(move |fault| {
            fault.as_service_fault().map(|s| statuses.contains(&s.status())).unwrap_or(false)
        })
    }

    /// Also retry service faults with any of these error codes.
    pub fn retry_on_error_codes(self, codes: &[&str]) -> Self {
        let codes: Vec<String> = codes.iter().map(|c| c.to_string()).collect();
        self.retry_on(move |fault| {
            fault
                .as_service_fault()
                .and_then(ServiceFault::code)
                .map(|code| codes.iter().any(|c| c == code))
                .unwrap_or(false)
        })
    }

    /// Replace the throttling classifier.
    pub fn treat_as_throttling<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&SdkError) -> bool + Send + Sync + 'static,
    {
        self.throttling = Arc::new(predicate);
        self
    }

    pub fn build(self) -> Result<DefaultRetryPolicy, BuildError> {
        if self.max_attempts == 0 {
            return Err(BuildError::InvalidMaxAttempts(0));
        }
        let mut retry_on = Vec::with_capacity(self.retry_on.len() + 1);
        if self.defaults {
            retry_on.push(Arc::new(is_retryable_by_default) as Predicate);
        }
        retry_on.extend(self.retry_on);
        Ok(DefaultRetryPolicy {
            max_attempts: self.max_attempts,
            retry_on,
            throttling: self.throttling,
        })
    }
}

impl Default for DefaultRetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}
