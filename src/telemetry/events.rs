use std::fmt;
use std::time::Duration;

use uuid::Uuid;

use crate::timeout::TimeoutScope;

/// Events emitted while executing a call.
///
/// Every event carries the invocation id so events of concurrent calls sharing one sink can be
/// told apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionEvent {
    /// An attempt is about to be sent.
    AttemptStarted { invocation_id: Uuid, attempt: u32, max_attempts: u32 },
    /// An attempt ended in a fault that went to retry classification.
    AttemptFailed { invocation_id: Uuid, attempt: u32, error: String },
    /// The engine granted a retry; the next attempt follows after `delay`.
    RetryScheduled { invocation_id: Uuid, attempt: u32, delay: Duration, capacity_remaining: u32 },
    /// A timeout tracker fired.
    TimeoutFired { invocation_id: Uuid, scope: TimeoutScope, timeout: Duration },
    /// The shared clock-skew offset was rewritten.
    ClockSkewAdjusted { invocation_id: Uuid, offset_ms: i64 },
    /// The call produced a response.
    CallSucceeded { invocation_id: Uuid, attempts: u32, duration: Duration },
    /// The call ended with an error.
    CallFailed { invocation_id: Uuid, attempts: u32, duration: Duration, error: String },
}

impl ExecutionEvent {
    pub fn invocation_id(&self) -> Uuid {
        match self {
            ExecutionEvent::AttemptStarted { invocation_id, .. }
            | ExecutionEvent::AttemptFailed { invocation_id, .. }
            | ExecutionEvent::RetryScheduled { invocation_id, .. }
            | ExecutionEvent::TimeoutFired { invocation_id, .. }
            | ExecutionEvent::ClockSkewAdjusted { invocation_id, .. }
            | ExecutionEvent::CallSucceeded { invocation_id, .. }
            | ExecutionEvent::CallFailed { invocation_id, .. } => *invocation_id,
        }
    }

    /// Short, stable name for filtering.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionEvent::AttemptStarted { .. } => "attempt_started",
            ExecutionEvent::AttemptFailed { .. } => "attempt_failed",
            ExecutionEvent::RetryScheduled { .. } => "retry_scheduled",
            ExecutionEvent::TimeoutFired { .. } => "timeout_fired",
            ExecutionEvent::ClockSkewAdjusted { .. } => "clock_skew_adjusted",
            ExecutionEvent::CallSucceeded { .. } => "call_succeeded",
            ExecutionEvent::CallFailed { .. } => "call_failed",
        }
    }
}

impl fmt::Display for ExecutionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionEvent::AttemptStarted { attempt, max_attempts, .. } => {
                write!(f, "AttemptStarted(attempt={}, max={})", attempt, max_attempts)
            }
            ExecutionEvent::AttemptFailed { attempt, error, .. } => {
                write!(f, "AttemptFailed(attempt={}, error={})", attempt, error)
            }
            ExecutionEvent::RetryScheduled { attempt, delay, capacity_remaining, .. } => write!(
                f,
                "RetryScheduled(after_attempt={}, delay={:?}, capacity={})",
                attempt, delay, capacity_remaining
            ),
            ExecutionEvent::TimeoutFired { scope, timeout, .. } => {
                write!(f, "TimeoutFired(scope={}, timeout={:?})", scope, timeout)
            }
            ExecutionEvent::ClockSkewAdjusted { offset_ms, .. } => {
                write!(f, "ClockSkewAdjusted(offset_ms={})", offset_ms)
            }
            ExecutionEvent::CallSucceeded { attempts, duration, .. } => {
                write!(f, "CallSucceeded(attempts={}, duration={:?})", attempts, duration)
            }
            ExecutionEvent::CallFailed { attempts, duration, error, .. } => write!(
                f,
                "CallFailed(attempts={}, duration={:?}, error={})",
                attempts, duration, error
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_compact() {
        let id = Uuid::nil();
        let event = ExecutionEvent::RetryScheduled {
            invocation_id: id,
            attempt: 1,
            delay: Duration::from_millis(100),
            capacity_remaining: 495,
        };
        assert_eq!(event.to_string(), "RetryScheduled(after_attempt=1, delay=100ms, capacity=495)");
        assert_eq!(event.kind(), "retry_scheduled");
        assert_eq!(event.invocation_id(), id);
    }

    #[test]
    fn timeout_display_names_scope() {
        let event = ExecutionEvent::TimeoutFired {
            invocation_id: Uuid::nil(),
            scope: TimeoutScope::Attempt,
            timeout: Duration::from_secs(2),
        };
        assert_eq!(event.to_string(), "TimeoutFired(scope=attempt, timeout=2s)");
    }
}
