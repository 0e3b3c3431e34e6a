//! Execution telemetry.
//!
//! Stages emit [`ExecutionEvent`]s beside their log lines: attempt start and failure, retry
//! scheduling, timeout firing, clock-skew adjustment and the final outcome. Events flow into the
//! [`EventSink`] configured on the client ([`NullSink`] by default).

pub mod events;
pub mod sinks;

pub use events::ExecutionEvent;
pub use sinks::{EventSink, LogSink, MemorySink, MulticastSink, NullSink, StreamingSink};
