#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use callguard::{
    AsyncTransport, CancellationToken, SdkError, SdkRequest, SdkResponse, ServiceFault,
    SyncTransport, TransportFault, TransportFaultKind,
};

/// One scripted transport outcome.
#[derive(Debug, Clone)]
pub enum Step {
    Respond(SdkResponse),
    Fail(SdkError),
    /// Wait for the attempt token, then report a cancelled transport fault.
    Hang,
    /// Take `Duration` (cooperatively), then respond 200.
    Slow(Duration),
    /// Take `Duration` (cooperatively), then fail.
    SlowFault(Duration, SdkError),
}

pub fn ok() -> Step {
    Step::Respond(SdkResponse::ok())
}

pub fn service(status: u16) -> Step {
    Step::Fail(ServiceFault::new(status, format!("status {status}")).into())
}

pub fn reset() -> Step {
    Step::Fail(TransportFault::new(TransportFaultKind::Io, "connection reset").into())
}

struct Script {
    steps: Mutex<VecDeque<Step>>,
    fallback: Step,
    calls: AtomicUsize,
    requests: Mutex<Vec<SdkRequest>>,
}

/// Transport replaying a fixed script, then repeating a fallback step. Clones share the script.
#[derive(Clone)]
pub struct ScriptedTransport {
    script: Arc<Script>,
}

impl ScriptedTransport {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self::with_fallback(steps, ok())
    }

    pub fn repeating(step: Step) -> Self {
        Self::with_fallback([], step)
    }

    pub fn with_fallback(steps: impl IntoIterator<Item = Step>, fallback: Step) -> Self {
        Self {
            script: Arc::new(Script {
                steps: Mutex::new(steps.into_iter().collect()),
                fallback,
                calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn calls(&self) -> usize {
        self.script.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<SdkRequest> {
        self.script.requests.lock().unwrap().clone()
    }

    fn next(&self, request: &SdkRequest) -> Step {
        self.script.calls.fetch_add(1, Ordering::SeqCst);
        self.script.requests.lock().unwrap().push(request.clone());
        self.script
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.script.fallback.clone())
    }
}

impl SyncTransport for ScriptedTransport {
    fn send(
        &self,
        request: &SdkRequest,
        cancel: &CancellationToken,
    ) -> Result<SdkResponse, SdkError> {
        match self.next(request) {
            Step::Respond(response) => Ok(response),
            Step::Fail(fault) => Err(fault),
            Step::Hang => {
                cancel.wait_timeout(Duration::from_secs(60));
                Err(TransportFault::cancelled().into())
            }
            Step::Slow(duration) => {
                if cancel.wait_timeout(duration) {
                    Err(TransportFault::cancelled().into())
                } else {
                    Ok(SdkResponse::ok())
                }
            }
            Step::SlowFault(duration, fault) => {
                if cancel.wait_timeout(duration) {
                    Err(TransportFault::cancelled().into())
                } else {
                    Err(fault)
                }
            }
        }
    }
}

#[async_trait]
impl AsyncTransport for ScriptedTransport {
    async fn send(
        &self,
        request: &SdkRequest,
        cancel: &CancellationToken,
    ) -> Result<SdkResponse, SdkError> {
        match self.next(request) {
            Step::Respond(response) => Ok(response),
            Step::Fail(fault) => Err(fault),
            Step::Hang => {
                cancel.cancelled().await;
                Err(TransportFault::cancelled().into())
            }
            Step::Slow(duration) => {
                tokio::select! {
                    _ = tokio::time::sleep(duration) => Ok(SdkResponse::ok()),
                    _ = cancel.cancelled() => Err(TransportFault::cancelled().into()),
                }
            }
            Step::SlowFault(duration, fault) => {
                tokio::select! {
                    _ = tokio::time::sleep(duration) => Err(fault),
                    _ = cancel.cancelled() => Err(TransportFault::cancelled().into()),
                }
            }
        }
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
