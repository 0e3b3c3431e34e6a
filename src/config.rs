//! Client configuration.
//!
//! [`ClientOverrideConfig`] carries the client-wide timeouts and retry mode. Clients keep it in a
//! [`DynamicConfig`] so timeouts can be changed while calls are running: every call snapshots
//! the current value once at entry and is unaffected by later updates. [`ExecutionOptions`]
//! overrides the snapshot for a single call.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

use crate::cancel::CancellationToken;
use crate::retry::RetryMode;

/// Live-updatable shared value: lock-free reads, whole-value replacement on write.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    inner: Arc<ArcSwap<T>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: Default> Default for DynamicConfig<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> DynamicConfig<T> {
    pub fn new(value: T) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
    }

    /// Snapshot the current value.
    pub fn get(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Replace the value entirely.
    pub fn set(&self, value: T) {
        self.inner.store(Arc::new(value));
    }

    /// Derive the next value from the current one. Concurrent updates are retried, so none is
    /// lost.
    pub fn update<F>(&self, mut f: F)
    where
        F: FnMut(&T) -> T,
    {
        self.inner.rcu(|current| Arc::new(f(&**current)));
    }
}

/// Client-wide overrides. A `None` or zero timeout means "no timeout".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ClientOverrideConfig {
    /// Deadline for the whole call, across all attempts and backoff waits.
    pub api_call_timeout: Option<Duration>,
    /// Deadline for each individual attempt.
    pub api_call_attempt_timeout: Option<Duration>,
    /// Preset used when the client is built without an explicit retry strategy.
    pub retry_mode: RetryMode,
}

impl ClientOverrideConfig {
    pub fn builder() -> ClientOverrideConfigBuilder {
        ClientOverrideConfigBuilder::default()
    }
}

/// Builder for [`ClientOverrideConfig`].
#[derive(Debug, Clone, Default)]
pub struct ClientOverrideConfigBuilder {
    config: ClientOverrideConfig,
}

impl ClientOverrideConfigBuilder {
    pub fn api_call_timeout(mut self, timeout: Duration) -> Self {
        self.config.api_call_timeout = Some(timeout);
        self
    }

    pub fn api_call_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.config.api_call_attempt_timeout = Some(timeout);
        self
    }

    pub fn retry_mode(mut self, mode: RetryMode) -> Self {
        self.config.retry_mode = mode;
        self
    }

    pub fn build(self) -> ClientOverrideConfig {
        self.config
    }
}

/// Per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    api_call_timeout: Option<Option<Duration>>,
    api_call_attempt_timeout: Option<Option<Duration>>,
    cancellation: Option<CancellationToken>,
}

impl ExecutionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the call timeout for this call; `None` disables it.
    pub fn api_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.api_call_timeout = Some(timeout);
        self
    }

    /// Override the attempt timeout for this call; `None` disables it.
    pub fn api_call_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.api_call_attempt_timeout = Some(timeout);
        self
    }

    /// Observe `token`: signalling it cancels the call.
    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub(crate) fn resolve(
        &self,
        config: &ClientOverrideConfig) -> (Option<Duration>, Option<Duration>,
    ) {
        (
            self.api_call_timeout.unwrap_or(config.api_call_timeout),
            self.api_call_attempt_timeout.unwrap_or(config.api_call_attempt_timeout),
        )
    }

    pub(crate) fn take_cancellation(&mut self) -> Option<CancellationToken> {
        self.cancellation.take()
    }
}
