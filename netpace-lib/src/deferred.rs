//! Results that can be handed out before the work producing them has started.
//!
//! A [`ThrottledDispatcher`](crate::ThrottledDispatcher) returns from
//! `request` long before the operation is assigned to a lane. The caller
//! still gets a [`DeferredResult`] right away; it is bound to the
//! [`TransportHandle`] of the real request once the dispatcher schedules it.
//!
//! # Implementation Details
//!
//! Both types are thin wrappers around [`tokio::sync::watch`] channels, which
//! act as single-assignment cells with an asynchronous "wait until set"
//! primitive. Waiting with a timeout uses one deadline for the whole wait, so
//! the time spent waiting for the binding is deducted from the time left for
//! the request itself.

use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::{Instant, timeout_at};

use crate::{ErrorKind, Reply, Result};

/// Action run when a not yet scheduled result is cancelled.
///
/// Returns `true` if the pending work was withdrawn.
pub type CancelAction = Box<dyn FnOnce() -> bool + Send>;

/// Handle to an operation which is being executed by the transport.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    inner: Arc<TransportInner>,
}

/// The task is still running
const RUNNING: u8 = 0;
/// The task published its outcome
const COMPLETED: u8 = 1;
/// The task was aborted before publishing an outcome
const CANCELLED: u8 = 2;

#[derive(Debug)]
struct TransportInner {
    outcome: watch::Receiver<Option<Result<Reply>>>,
    abort: AbortHandle,
    /// Decides the race between completion and cancellation
    state: Arc<AtomicU8>,
}

impl TransportHandle {
    /// Start executing `future` on the current runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = Result<Reply>> + Send + 'static,
    {
        let (tx, rx) = watch::channel(None);
        let state = Arc::new(AtomicU8::new(RUNNING));
        let task_state = state.clone();
        let task = tokio::spawn(async move {
            let outcome = future.await;
            if task_state
                .compare_exchange(RUNNING, COMPLETED, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                tx.send_replace(Some(outcome));
            }
        });

        Self {
            inner: Arc::new(TransportInner {
                outcome: rx,
                abort: task.abort_handle(),
                state,
            }),
        }
    }

    /// Abort the operation.
    ///
    /// Returns `false` if it has already completed. Once this returned
    /// `true`, the outcome is [`ErrorKind::Cancelled`] even if the request
    /// itself finished in the meantime. In-flight I/O is dropped at its next
    /// suspension point.
    pub fn cancel(&self) -> bool {
        let cancelled = self
            .inner
            .state
            .compare_exchange(RUNNING, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if cancelled {
            self.inner.abort.abort();
        }
        cancelled
    }

    /// True if [`TransportHandle::cancel`] succeeded
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.state.load(Ordering::SeqCst) == CANCELLED
    }

    /// True once the operation completed, failed or was aborted
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.inner.outcome.borrow().is_some() || self.inner.abort.is_finished()
    }

    /// Wait for the outcome of the operation.
    ///
    /// # Errors
    ///
    /// Returns the error of the operation, or [`ErrorKind::Cancelled`] if it
    /// was aborted before completing.
    pub async fn outcome(&self) -> Result<Reply> {
        let mut rx = self.inner.outcome.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone().unwrap_or(Err(ErrorKind::Cancelled)),
            Err(_) => Err(ErrorKind::Cancelled),
        }
    }
}

#[derive(Debug)]
enum Slot {
    Pending,
    Bound(TransportHandle),
    Closed(ErrorKind),
}

#[derive(Default)]
struct CancelState {
    action: Option<CancelAction>,
    outcome: Option<bool>,
}

struct DeferredInner {
    slot: watch::Sender<Slot>,
    cancel: Mutex<CancelState>,
}

/// Placeholder for the result of an operation, which may be created before
/// the operation is handed to the transport.
///
/// A `DeferredResult` starts either *unbound*, holding a [`CancelAction`], or
/// *bound* to a [`TransportHandle`]. The transition from unbound to bound
/// happens at most once. Cloning yields another view on the same result.
#[derive(Clone)]
pub struct DeferredResult {
    inner: Arc<DeferredInner>,
}

impl DeferredResult {
    /// Create an unbound result. `cancel` is invoked at most once, when the
    /// caller cancels before the result is bound.
    #[must_use]
    pub fn pending<F>(cancel: F) -> Self
    where
        F: FnOnce() -> bool + Send + 'static,
    {
        Self::from_slot(
            Slot::Pending,
            CancelState {
                action: Some(Box::new(cancel)),
                outcome: None,
            },
        )
    }

    /// Create a result which is already bound to a transport handle
    #[must_use]
    pub fn bound(handle: TransportHandle) -> Self {
        Self::from_slot(Slot::Bound(handle), CancelState::default())
    }

    fn from_slot(slot: Slot, cancel: CancelState) -> Self {
        let (slot, _) = watch::channel(slot);
        Self {
            inner: Arc::new(DeferredInner {
                slot,
                cancel: Mutex::new(cancel),
            }),
        }
    }

    /// Bind this result to the handle of the running operation and wake up
    /// all waiters.
    ///
    /// Returns `false` if the result was already bound or closed, in which
    /// case the handle is ignored.
    pub fn bind(&self, handle: TransportHandle) -> bool {
        let mut handle = Some(handle);
        self.inner.slot.send_if_modified(|slot| {
            if matches!(slot, Slot::Pending) {
                if let Some(handle) = handle.take() {
                    *slot = Slot::Bound(handle);
                    return true;
                }
            }
            false
        })
    }

    /// Resolve an unbound result with an error, e.g. when the operation could
    /// not be handed to any lane.
    pub(crate) fn close(&self, error: ErrorKind) -> bool {
        let mut error = Some(error);
        self.inner.slot.send_if_modified(|slot| {
            if matches!(slot, Slot::Pending) {
                if let Some(error) = error.take() {
                    *slot = Slot::Closed(error);
                    return true;
                }
            }
            false
        })
    }

    /// The transport handle, once bound
    #[must_use]
    pub fn transport(&self) -> Option<TransportHandle> {
        match &*self.inner.slot.borrow() {
            Slot::Bound(handle) => Some(handle.clone()),
            Slot::Pending | Slot::Closed(_) => None,
        }
    }

    /// Cancel the operation.
    ///
    /// If the result is bound, cancellation is forwarded to the transport.
    /// Otherwise the stored cancel action runs once and its answer is cached
    /// for subsequent calls.
    ///
    /// # Panics
    ///
    /// Panics if the cancel state mutex is poisoned
    pub fn cancel(&self) -> bool {
        if let Some(handle) = self.transport() {
            return handle.cancel();
        }

        let mut state = self.inner.cancel.lock().unwrap();
        if let Some(outcome) = state.outcome {
            return outcome;
        }
        let Some(action) = state.action.take() else {
            return false;
        };

        let withdrawn = action();
        state.outcome = Some(withdrawn);
        if withdrawn {
            self.close(ErrorKind::Cancelled);
        }
        withdrawn
    }

    /// True if the operation was withdrawn before binding, or the transport
    /// reported a successful cancellation
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match &*self.inner.slot.borrow() {
            Slot::Pending => false,
            Slot::Bound(handle) => handle.is_cancelled(),
            Slot::Closed(error) => error.is_cancelled(),
        }
    }

    /// True once the bound operation completed. Always `false` while unbound.
    #[must_use]
    pub fn is_done(&self) -> bool {
        match &*self.inner.slot.borrow() {
            Slot::Bound(handle) => handle.is_done(),
            Slot::Pending | Slot::Closed(_) => false,
        }
    }

    pub(crate) async fn bound_handle(&self) -> Result<TransportHandle> {
        let mut rx = self.inner.slot.subscribe();
        let slot = rx
            .wait_for(|slot| !matches!(slot, Slot::Pending))
            .await
            .map_err(|_| ErrorKind::NotDispatched)?;
        match &*slot {
            Slot::Bound(handle) => Ok(handle.clone()),
            Slot::Closed(error) => Err(error.clone()),
            Slot::Pending => Err(ErrorKind::NotDispatched),
        }
    }

    /// Wait until the result is bound, then for the operation to complete.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Cancelled`] if the operation was cancelled before
    /// or after binding, [`ErrorKind::NotDispatched`] if it never reached a
    /// lane, or the error of the operation itself.
    pub async fn wait(&self) -> Result<Reply> {
        self.bound_handle().await?.outcome().await
    }

    /// Like [`DeferredResult::wait`], but gives up after `timeout`.
    ///
    /// The timeout covers both the wait for binding and the wait for
    /// completion.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Timeout`] if the deadline passes first, otherwise
    /// the same errors as [`DeferredResult::wait`].
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<Reply> {
        let deadline = Instant::now() + timeout;
        let handle = timeout_at(deadline, self.bound_handle())
            .await
            .map_err(|_| ErrorKind::Timeout(timeout))??;
        timeout_at(deadline, handle.outcome())
            .await
            .map_err(|_| ErrorKind::Timeout(timeout))?
    }

    /// Wait for every given result, ignoring individual errors.
    ///
    /// Errors have already been delivered to the callback of each operation,
    /// so this is only a barrier. Missing results are skipped.
    pub async fn join_all<I>(results: I)
    where
        I: IntoIterator<Item = Option<DeferredResult>>,
    {
        let pending: Vec<_> = results.into_iter().flatten().collect();
        join_all(pending.iter().map(DeferredResult::wait)).await;
    }
}

impl std::fmt::Debug for DeferredResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredResult")
            .field("slot", &*self.inner.slot.borrow())
            .finish_non_exhaustive()
    }
}
