//! Cooperative cancellation.
//!
//! A [`CancellationToken`] is the explicit handle passed into every blocking point the pipeline
//! controls: the transport call, backoff sleeps, and the initial-token wait. Signalling is a single
//! atomic transition; work observes it by polling [`CancellationToken::is_cancelled`], by waiting
//! on it with [`CancellationToken::wait_timeout`] (blocking model), or by awaiting
//! [`CancellationToken::cancelled`] (async model).
//!
//! Tokens form a tree. Cancelling a parent cancels every child created from it, never the other
//! way round. The pipeline builds `caller → call → attempt`: the call tracker signals the call
//! token (reaching the in-flight attempt), the attempt tracker signals only the attempt token.
//!
//! A token records *that* it was signalled, not *who* signalled it. Attribution is the job of
//! [`crate::TimeoutTracker::has_fired`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

struct Inner {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
    notify: Notify,
    children: Mutex<Vec<Weak<Inner>>>,
}

impl Inner {
    fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            lock: Mutex::new(()),
            cond: Condvar::new(),
            notify: Notify::new(),
            children: Mutex::new(Vec::new()),
        }
    }

    fn cancel(&self) -> bool {
        if self
            .cancelled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        {
            // Waiters check the flag under this lock, so notifying while holding it cannot race.
            let _guard = lock(&self.lock);
            self.cond.notify_all();
        }
        self.notify.notify_waiters();
        let children = std::mem::take(&mut *lock(&self.children));
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
        true
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared cancellation handle; clones observe and signal the same state.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken").field("cancelled", &self.is_cancelled()).finish()
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        Self { inner: Arc::new(Inner::new()) }
    }

    /// Create a token that is cancelled whenever `self` is.
    pub fn child(&self) -> Self {
        let child = Self::new();
        {
            let mut children = lock(&self.inner.children);
            children.retain(|weak| weak.strong_count() > 0);
            children.push(Arc::downgrade(&child.inner));
        }
        // Covers a parent cancelled before the child was registered.
        if self.is_cancelled() {
            child.cancel();
        }
        child
    }

    /// Signal cancellation. Returns `true` only for the call that performed the transition.
    pub fn cancel(&self) -> bool {
        self.inner.cancel()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Block the current thread for up to `timeout`, waking early on cancellation.
    ///
    /// Returns `true` if the token was (or became) cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut guard = lock(&self.inner.lock);
        loop {
            if self.is_cancelled() {
                return true;
            }
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => Duration::from_secs(u32::MAX as u64),
            };
            if remaining.is_zero() {
                return false;
            }
            guard = match self.inner.cond.wait_timeout(guard, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Resolve once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn cancel_transitions_once() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.cancel());
        assert!(!token.cancel(), "second cancel is a no-op");
        assert!(token.is_cancelled());
    }

    #[test]
    fn parent_cancels_children_but_not_reverse() {
        let parent = CancellationToken::new();
        let child = parent.child();
        let grandchild = child.child();

        assert!(grandchild.cancel());
        assert!(!parent.is_cancelled());
        assert!(!child.is_cancelled());

        let sibling = parent.child();
        parent.cancel();
        assert!(child.is_cancelled());
        assert!(sibling.is_cancelled());
    }

    #[test]
    fn child_of_cancelled_parent_starts_cancelled() {
        let parent = CancellationToken::new();
        parent.cancel();
        assert!(parent.child().is_cancelled());
    }

    #[test]
    fn wait_timeout_elapses_without_signal() {
        let token = CancellationToken::new();
        let start = Instant::now();
        assert!(!token.wait_timeout(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn wait_timeout_wakes_on_cancel_from_another_thread() {
        let token = CancellationToken::new();
        let signaller = token.clone();
        let start = Instant::now();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            signaller.cancel();
        });
        assert!(token.wait_timeout(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn async_wait_resolves_after_cancel() {
        let token = CancellationToken::new();
        let child = token.child();
        let waiter = tokio::spawn(async move { child.cancelled().await });
        tokio::task::yield_now().await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .expect("join");
    }

    #[tokio::test]
    async fn async_wait_on_already_cancelled_token_returns() {
        let token = CancellationToken::new();
        token.cancel();
        token.cancelled().await;
    }
}
