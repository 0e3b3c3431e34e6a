//! Single-assignment completion for the non-blocking model.
//!
//! Several paths race to finish the same call or attempt: the transport task, a timeout tracker,
//! and the caller cancelling. [`Completion::complete`] is first-writer-wins; later completions
//! return `false` and their value is dropped, never surfaced as an error.
//!
//! [`CallFuture`] is what [`crate::AsyncClient::execute`] hands back. It resolves with whatever
//! completed first, and cancelling or dropping it propagates downstream: the call token is
//! signalled and the driver task is aborted.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use pin_project::{pin_project, pinned_drop};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::cancel::CancellationToken;
use crate::error::SdkError;

struct Slot<T> {
    done: AtomicBool,
    sender: Mutex<Option<oneshot::Sender<T>>>,
}

/// Write side of a single-assignment slot. Clones share the slot.
pub struct Completion<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self { slot: self.slot.clone() }
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion").field("completed", &self.is_completed()).finish()
    }
}

/// Read side: resolves to `Some(value)` with the first completion, or `None` if every writer
/// was dropped without completing.
#[pin_project]
pub struct CompletionReceiver<T> {
    #[pin]
    rx: oneshot::Receiver<T>,
}

impl<T> Future for CompletionReceiver<T> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.project().rx.poll(cx).map(Result::ok)
    }
}

/// Create a connected completion pair.
pub fn completion<T>() -> (Completion<T>, CompletionReceiver<T>) {
    let (tx, rx) = oneshot::channel();
    let slot = Arc::new(Slot { done: AtomicBool::new(false), sender: Mutex::new(Some(tx)) });
    (Completion { slot }, CompletionReceiver { rx })
}

impl<T> Completion<T> {
    /// Complete the slot. Returns `false` (discarding `value`) if it was already completed.
    pub fn complete(&self, value: T) -> bool {
        if self
            .slot
            .done
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let sender = self.slot.sender.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(sender) = sender {
            // A dropped receiver means nobody is waiting any more; the slot is still settled.
            let _ = sender.send(value);
        }
        true
    }

    pub fn is_completed(&self) -> bool {
        self.slot.done.load(Ordering::Acquire)
    }
}

/// Caller-visible future of an async call.
#[pin_project(PinnedDrop)]
pub struct CallFuture<T> {
    #[pin]
    receiver: CompletionReceiver<Result<T, SdkError>>,
    completion: Completion<Result<T, SdkError>>,
    token: CancellationToken,
    driver: Option<AbortHandle>,
    finished: bool,
}

impl<T> fmt::Debug for CallFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallFuture")
            .field("completed", &self.completion.is_completed())
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

impl<T> CallFuture<T> {
    pub(crate) fn new(
        receiver: CompletionReceiver<Result<T, SdkError>>,
        completion: Completion<Result<T, SdkError>>,
        token: CancellationToken,
        driver: Option<AbortHandle>,
    ) -> Self {
        Self { receiver, completion, token, driver, finished: false }
    }

    /// Cancel the call. Resolves the future with [`SdkError::CancelledByCaller`] unless it has
    /// already completed, and signals in-flight work to stop.
    pub fn cancel(&self) -> bool {
        let won = self.completion.complete(Err(SdkError::CancelledByCaller));
        self.token.cancel();
        won
    }

    /// This call's cancellation scope; signalling it is equivalent to [`CallFuture::cancel`].
    /// It is a child of any token passed in the execution options, so it never reaches sibling
    /// calls sharing that token.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_completed(&self) -> bool {
        self.completion.is_completed()
    }
}

impl<T> Future for CallFuture<T> {
    type Output = Result<T, SdkError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match this.receiver.poll(cx) {
            Poll::Ready(Some(result)) => {
                *this.finished = true;
                Poll::Ready(result)
            }
            Poll::Ready(None) => {
                *this.finished = true;
                Poll::Ready(Err(SdkError::Internal("call driver stopped without a result".into())))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[pinned_drop]
impl<T> PinnedDrop for CallFuture<T> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        if *this.finished {
            return;
        }
        this.token.cancel();
        if let Some(driver) = this.driver.take() {
            driver.abort();
        }
    }
}
