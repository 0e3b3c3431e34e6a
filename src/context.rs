//! Requests, responses and the per-call execution context.
//!
//! [`ExecutionContext`] is created by the client for one call and passed by `&mut` through every
//! stage. Each group of fields has one writer:
//!
//! | fields | written by |
//! |---|---|
//! | call token, call tracker | `ApiCallTimeoutStage` |
//! | attempt number/id, last fault | `RetryableStage` (via the retry strategy) |
//! | attempt token, attempt tracker | `AttemptTimeoutStage` |
//! | signing time, send time | `SigningStage` |
//!
//! Everything else reads. State that timer callbacks need (attempts started, call start) lives in
//! a small shared [`CallProgress`] so callbacks never touch the context itself.

use std::fmt;
use std::io::{self, Read};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use http::{HeaderMap, HeaderName, HeaderValue};
use uuid::Uuid;

use crate::cancel::CancellationToken;
use crate::error::SdkError;
use crate::telemetry::{EventSink, ExecutionEvent, NullSink};
use crate::timeout::{FaultSources, TrackerHandle};

/// Header carrying the per-call invocation id.
pub const INVOCATION_ID_HEADER: &str = "amz-sdk-invocation-id";
/// Header carrying `attempt=N; max=M`.
pub const REQUEST_INFO_HEADER: &str = "amz-sdk-request";

fn header_entry<K, V>(name: K, value: V) -> Result<(HeaderName, HeaderValue), SdkError>
where
    HeaderName: TryFrom<K>,
    <HeaderName as TryFrom<K>>::Error: fmt::Display,
    HeaderValue: TryFrom<V>,
    <HeaderValue as TryFrom<V>>::Error: fmt::Display,
{
    let name = HeaderName::try_from(name)
        .map_err(|e| SdkError::InvalidRequest(format!("invalid header name: {e}")))?;
    let value = HeaderValue::try_from(value)
        .map_err(|e| SdkError::InvalidRequest(format!("invalid value for header {name}: {e}")))?;
    Ok((name, value))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Source of a replayable request body. Every attempt opens a fresh stream.
pub trait ContentStreamProvider: Send + Sync + fmt::Debug {
    fn new_stream(&self) -> io::Result<Box<dyn Read + Send>>;
}

/// Request payload.
#[derive(Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Bytes(Arc<[u8]>),
    Stream(Arc<dyn ContentStreamProvider>),
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Empty => f.write_str("Empty"),
            RequestBody::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            RequestBody::Stream(provider) => f.debug_tuple("Stream").field(provider).finish(),
        }
    }
}

impl RequestBody {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes: Vec<u8> = bytes.into();
        RequestBody::Bytes(Arc::from(bytes))
    }

    pub fn from_provider<P>(provider: P) -> Self
    where
        P: ContentStreamProvider + 'static,
    {
        RequestBody::Stream(Arc::new(provider))
    }

    /// Open the body from the start of the original content.
    pub fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        match self {
            RequestBody::Empty => Ok(Box::new(io::empty())),
            RequestBody::Bytes(bytes) => Ok(Box::new(io::Cursor::new(bytes.clone()))),
            RequestBody::Stream(provider) => provider.new_stream(),
        }
    }

    /// Read the whole body into memory.
    pub fn read_all(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.open()?.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

/// An outgoing request. Clones share the body source, never a partially read stream.
#[derive(Debug, Clone)]
pub struct SdkRequest {
    method: String,
    uri: String,
    headers: HeaderMap,
    body: RequestBody,
}

impl SdkRequest {
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            uri: uri.into(),
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn get(uri: impl Into<String>) -> Self {
        Self::new("GET", uri)
    }

    pub fn post(uri: impl Into<String>) -> Self {
        Self::new("POST", uri)
    }

    pub fn with_header<K, V>(mut self, name: K, value: V) -> Result<Self, SdkError>
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: fmt::Display,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: fmt::Display,
    {
        self.set_header(name, value)?;
        Ok(self)
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    /// Insert a header, replacing any previous value. Fails on a malformed name or value.
    pub fn set_header<K, V>(&mut self, name: K, value: V) -> Result<(), SdkError>
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: fmt::Display,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: fmt::Display,
    {
        let (name, value) = header_entry(name, value)?;
        self.headers.insert(name, value);
        Ok(())
    }

    /// Header value by case-insensitive name, if present and visible ASCII.
    pub fn header(&self, name: &str) -> Option<&str> {
        header_str(&self.headers, name)
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &RequestBody {
        &self.body
    }
}

/// A successful service response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SdkResponse {
    status: u16,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl SdkResponse {
    pub fn new(status: u16) -> Self {
        Self { status, ..Self::default() }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    pub fn with_header<K, V>(mut self, name: K, value: V) -> Result<Self, SdkError>
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: fmt::Display,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: fmt::Display,
    {
        let (name, value) = header_entry(name, value)?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_str(&self.headers, name)
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

/// Call state shared with timer callbacks.
#[derive(Debug)]
pub struct CallProgress {
    started: Instant,
    attempts: AtomicU32,
}

impl CallProgress {
    fn new() -> Self {
        Self { started: Instant::now(), attempts: AtomicU32::new(0) }
    }

    /// Attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Per-call state threaded through the pipeline.
pub struct ExecutionContext {
    invocation_id: Uuid,
    call_timeout: Option<Duration>,
    attempt_timeout: Option<Duration>,
    progress: Arc<CallProgress>,
    events: Arc<dyn EventSink>,

    caller_token: CancellationToken,
    call_token: CancellationToken,
    call_tracker: Option<TrackerHandle>,

    attempt: u32,
    max_attempts: u32,
    attempt_id: Option<Uuid>,
    last_fault: Option<SdkError>,

    attempt_token: CancellationToken,
    attempt_tracker: Option<TrackerHandle>,

    signing_time: Option<SystemTime>,
    attempt_sent_at: Option<SystemTime>,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("invocation_id", &self.invocation_id)
            .field("attempt", &self.attempt)
            .field("max_attempts", &self.max_attempts)
            .field("call_timeout", &self.call_timeout)
            .field("attempt_timeout", &self.attempt_timeout)
            .finish_non_exhaustive()
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

impl ExecutionContext {
    /// Fresh context for one call observing `caller_token`.
    pub fn new(caller_token: CancellationToken) -> Self {
        let call_token = caller_token.child();
        let attempt_token = call_token.child();
        Self {
            invocation_id: Uuid::new_v4(),
            call_timeout: None,
            attempt_timeout: None,
            progress: Arc::new(CallProgress::new()),
            events: Arc::new(NullSink),
            caller_token,
            call_token,
            call_tracker: None,
            attempt: 0,
            max_attempts: 0,
            attempt_id: None,
            last_fault: None,
            attempt_token,
            attempt_tracker: None,
            signing_time: None,
            attempt_sent_at: None,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn invocation_id(&self) -> Uuid {
        self.invocation_id
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout
    }

    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout
    }

    pub fn elapsed(&self) -> Duration {
        self.progress.elapsed()
    }

    pub fn progress(&self) -> &Arc<CallProgress> {
        &self.progress
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    pub fn emit(&self, event: ExecutionEvent) {
        self.events.emit(event);
    }

    /// 1-based number of the attempt in flight, 0 before the first.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn attempt_id(&self) -> Option<Uuid> {
        self.attempt_id
    }

    pub fn last_fault(&self) -> Option<&SdkError> {
        self.last_fault.as_ref()
    }

    pub fn caller_token(&self) -> &CancellationToken {
        &self.caller_token
    }

    pub fn call_token(&self) -> &CancellationToken {
        &self.call_token
    }

    pub fn attempt_token(&self) -> &CancellationToken {
        &self.attempt_token
    }

    pub fn call_tracker(&self) -> Option<&TrackerHandle> {
        self.call_tracker.as_ref()
    }

    pub fn attempt_tracker(&self) -> Option<&TrackerHandle> {
        self.attempt_tracker.as_ref()
    }

    /// Corrected time the current attempt was signed with.
    pub fn signing_time(&self) -> Option<SystemTime> {
        self.signing_time
    }

    /// Uncorrected local time the current attempt was handed to the transport.
    pub fn attempt_sent_at(&self) -> Option<SystemTime> {
        self.attempt_sent_at
    }

    pub(crate) fn set_call_scope(&mut self, token: CancellationToken, tracker: TrackerHandle) {
        self.attempt_token = token.child();
        self.call_token = token;
        self.call_tracker = Some(tracker);
    }

    pub(crate) fn set_attempt_scope(&mut self, token: CancellationToken, tracker: TrackerHandle) {
        self.attempt_token = token;
        self.attempt_tracker = Some(tracker);
    }

    pub(crate) fn begin_attempt(&mut self, attempt: u32, max_attempts: u32) {
        self.attempt = attempt;
        self.max_attempts = max_attempts;
        self.attempt_id = Some(Uuid::new_v4());
        self.attempt_tracker = None;
        self.signing_time = None;
        self.attempt_sent_at = None;
        self.progress.attempts.store(attempt, Ordering::Release);
    }

    pub(crate) fn record_fault(&mut self, fault: &SdkError) {
        self.last_fault = Some(fault.clone());
    }

    pub(crate) fn set_signing(&mut self, signing_time: SystemTime, sent_at: SystemTime) {
        self.signing_time = Some(signing_time);
        self.attempt_sent_at = Some(sent_at);
    }

    /// Stamp invocation and attempt metadata onto the working request.
    pub fn stamp_attempt_headers(&self, request: &mut SdkRequest) -> Result<(), SdkError> {
        request.set_header(INVOCATION_ID_HEADER, self.invocation_id.to_string())?;
        let info = format!("attempt={}; max={}", self.attempt, self.max_attempts);
        request.set_header(REQUEST_INFO_HEADER, info)
    }

    /// Inputs of the fault-precedence rule at this point of the call.
    pub fn fault_sources(&self) -> FaultSources<'_> {
        FaultSources {
            call: self.call_tracker.as_ref(),
            caller: Some(&self.caller_token),
            attempt: self.attempt_tracker.as_ref(),
            attempt_number: self.attempt,
            call_elapsed: self.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug)]
    struct CountingProvider {
        opened: AtomicUsize,
    }

    impl ContentStreamProvider for CountingProvider {
        fn new_stream(&self) -> io::Result<Box<dyn Read + Send>> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(io::Cursor::new(b"payload".to_vec())))
        }
    }

    #[test]
    fn body_reopens_from_original_source() {
        let provider = Arc::new(CountingProvider { opened: AtomicUsize::new(0) });
        let body = RequestBody::Stream(provider.clone());
        let mut partial = [0u8; 3];
        body.open().unwrap().read_exact(&mut partial).unwrap();
        assert_eq!(body.read_all().unwrap(), b"payload");
        assert_eq!(provider.opened.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn headers_are_case_insensitive() {
        let request = SdkRequest::get("https://example.test/").with_header("X-Thing", "1").unwrap();
        assert_eq!(request.header("x-thing"), Some("1"));
        assert_eq!(request.header("X-THING"), Some("1"));
        assert_eq!(request.headers().len(), 1);
    }

    #[test]
    fn malformed_headers_are_rejected() {
        let mut request = SdkRequest::get("https://example.test/");
        let err = request.set_header("bad name", "1").unwrap_err();
        assert!(matches!(err, SdkError::InvalidRequest(_)), "{err:?}");
        let err = request.set_header("x-thing", "line\nbreak").unwrap_err();
        assert!(matches!(err, SdkError::InvalidRequest(_)), "{err:?}");
        assert!(request.headers().is_empty());
    }

    #[test]
    fn response_headers_are_case_insensitive() {
        let response = SdkResponse::ok().with_header("Retry-After", "5").unwrap();
        assert_eq!(response.header("retry-after"), Some("5"));
    }

    #[test]
    fn attempt_headers_reflect_current_attempt() {
        let mut ctx = ExecutionContext::default();
        ctx.begin_attempt(2, 3);
        let mut request = SdkRequest::get("https://example.test/");
        ctx.stamp_attempt_headers(&mut request).unwrap();
        assert_eq!(request.header(REQUEST_INFO_HEADER), Some("attempt=2; max=3"));
        assert_eq!(
            request.header(INVOCATION_ID_HEADER).map(str::to_owned),
            Some(ctx.invocation_id().to_string())
        );
        assert_eq!(ctx.progress().attempts(), 2);
    }

    #[test]
    fn caller_cancellation_reaches_attempt_token() {
        let caller = CancellationToken::new();
        let ctx = ExecutionContext::new(caller.clone());
        caller.cancel();
        assert!(ctx.call_token().is_cancelled());
        assert!(ctx.attempt_token().is_cancelled());
    }

    #[test]
    fn each_attempt_gets_a_fresh_id() {
        let mut ctx = ExecutionContext::default();
        ctx.begin_attempt(1, 3);
        let first = ctx.attempt_id();
        ctx.begin_attempt(2, 3);
        assert_ne!(first, ctx.attempt_id());
    }
}
