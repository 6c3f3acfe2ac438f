//! Cooperative cancellation

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Observed by a running decode at every step boundary.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    /// Creates a new cancellation token pair.
    ///
    /// Returns:
    /// - `CancellationToken` - Pass this to the decode
    /// - `CancelHandle` - Keep this to trigger cancellation
    ///
    /// # Example
    ///
    /// ```ignore
    /// let (token, handle) = CancellationToken::new();
    /// let stream = decode_loop.stream(request, token)?;
    ///
    /// // From the transport, when the connection goes away:
    /// handle.cancel();
    /// ```
    pub fn new() -> (Self, CancelHandle) {
        let inner = Arc::new(Inner::default());
        (Self { inner: inner.clone() }, CancelHandle { inner })
    }

    /// Creates a token that is never cancelled.
    pub fn never() -> Self {
        Self {
            inner: Arc::new(Inner::default()),
        }
    }

    /// Creates a token that is already cancelled.
    pub fn already_cancelled() -> Self {
        let (token, handle) = Self::new();
        handle.cancel();
        token
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent cancel is not missed.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for CancellationToken {
    /// Default token is never cancelled.
    fn default() -> Self {
        Self::never()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Triggers cancellation of the paired token.
#[derive(Clone)]
pub struct CancelHandle {
    inner: Arc<Inner>,
}

impl CancelHandle {
    /// Signals cancellation to all associated tokens.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Cancels after `timeout`. Must be called inside a tokio runtime.
    pub fn cancel_after(self, timeout: Duration) {
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            self.cancel();
        });
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
