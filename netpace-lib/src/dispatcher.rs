//! Bounded, throttled dispatch of operations over a set of lanes.
//!
//! Operations wait in a FIFO queue until a lane is eligible, i.e. its last
//! dispatch lies at least one interval in the past. The head of the queue
//! always goes to the first eligible lane in configuration order. When no
//! lane is eligible the scheduler sleeps until the earliest one becomes
//! eligible again.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, trace, warn};
use tokio::sync::Notify;
use tokio::time::{sleep, timeout};

use crate::config::DispatcherConfig;
use crate::ratelimit::LaneLimits;
use crate::{DeferredResult, ErrorKind, Operation, Requester, Result};

/// How long the scheduler idles on an empty queue before it checks
/// whether the dispatcher still exists
const IDLE_POLL: Duration = Duration::from_secs(60);

struct WaitingEntry {
    id: u64,
    operation: Operation,
    result: DeferredResult,
}

struct WaitQueue {
    entries: Mutex<VecDeque<WaitingEntry>>,
    capacity: usize,
    next_id: AtomicU64,
}

impl WaitQueue {
    fn pop(&self) -> Option<WaitingEntry> {
        self.entries.lock().unwrap().pop_front()
    }

    /// Withdraw a waiting entry. Fails if the scheduler already took it.
    fn remove(&self, id: u64) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.iter().position(|entry| entry.id == id) {
            Some(index) => entries.remove(index).is_some(),
            None => false,
        }
    }
}

impl Drop for WaitQueue {
    fn drop(&mut self) {
        if let Ok(entries) = self.entries.get_mut() {
            for entry in entries.drain(..) {
                entry.result.close(ErrorKind::NotDispatched);
            }
        }
    }
}

/// Queues operations and hands them to lanes at a bounded rate.
///
/// The scheduler runs as a background task on the runtime the dispatcher was
/// created on. It stops once the dispatcher is dropped; operations still
/// waiting at that point are never dispatched and their results resolve to
/// [`ErrorKind::NotDispatched`].
pub struct ThrottledDispatcher {
    queue: Arc<WaitQueue>,
    available: Arc<Notify>,
    interval: Duration,
    lanes: usize,
}

impl ThrottledDispatcher {
    /// Create a dispatcher over `lanes` and start its scheduler.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::NoLanes`] if `lanes` is empty and
    /// [`ErrorKind::InvalidCapacity`] if `capacity` is zero.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn new<L>(lanes: Vec<L>, interval: Duration, capacity: usize) -> Result<Self>
    where
        L: Requester + 'static,
    {
        if lanes.is_empty() {
            return Err(ErrorKind::NoLanes);
        }
        if capacity == 0 {
            return Err(ErrorKind::InvalidCapacity);
        }

        let queue = Arc::new(WaitQueue {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            next_id: AtomicU64::new(0),
        });
        let available = Arc::new(Notify::new());
        let count = lanes.len();

        tokio::spawn(schedule(
            Arc::downgrade(&queue),
            available.clone(),
            lanes,
            interval,
        ));

        Ok(Self {
            queue,
            available,
            interval,
            lanes: count,
        })
    }

    /// Create a dispatcher with the pacing of `config`
    ///
    /// # Errors
    ///
    /// See [`ThrottledDispatcher::new`].
    pub fn from_config<L>(lanes: Vec<L>, config: &DispatcherConfig) -> Result<Self>
    where
        L: Requester + 'static,
    {
        Self::new(lanes, config.interval, config.capacity)
    }

    /// Number of operations waiting for a lane
    ///
    /// # Panics
    ///
    /// Panics if the queue mutex is poisoned
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.entries.lock().unwrap().len()
    }

    /// Maximum number of waiting operations
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.queue.capacity
    }

    /// Minimum spacing between two dispatches on the same lane
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Number of lanes
    #[must_use]
    pub const fn lanes(&self) -> usize {
        self.lanes
    }
}

impl Requester for ThrottledDispatcher {
    /// Enqueue the operation and return an unbound result.
    ///
    /// If the queue is full, the operation's callback receives
    /// [`ErrorKind::Overflow`] before this returns `None`.
    ///
    /// # Panics
    ///
    /// Panics if the queue mutex is poisoned
    fn request(&self, operation: Operation) -> Option<DeferredResult> {
        let mut entries = self.queue.entries.lock().unwrap();
        if entries.len() >= self.queue.capacity {
            drop(entries);
            let capacity = self.queue.capacity;
            warn!("Wait queue is full ({capacity} operations), rejecting {operation:?}");
            operation.deliver(Err(ErrorKind::Overflow { capacity }), None);
            return None;
        }

        let id = self.queue.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::downgrade(&self.queue);
        let result =
            DeferredResult::pending(move || queue.upgrade().is_some_and(|queue| queue.remove(id)));

        entries.push_back(WaitingEntry {
            id,
            operation,
            result: result.clone(),
        });
        drop(entries);

        self.available.notify_one();
        Some(result)
    }
}

impl Drop for ThrottledDispatcher {
    fn drop(&mut self) {
        // Wake the scheduler so it notices it is orphaned
        self.available.notify_one();
    }
}

impl std::fmt::Debug for ThrottledDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottledDispatcher")
            .field("lanes", &self.lanes)
            .field("interval", &self.interval)
            .field("capacity", &self.queue.capacity)
            .finish_non_exhaustive()
    }
}

async fn next_entry(queue: &Weak<WaitQueue>, available: &Notify) -> Option<WaitingEntry> {
    loop {
        let queue = queue.upgrade()?;
        if let Some(entry) = queue.pop() {
            return Some(entry);
        }
        drop(queue);
        // Either a new entry arrived or it is time to look at the queue again
        let _ = timeout(IDLE_POLL, available.notified()).await;
    }
}

async fn schedule<L: Requester>(
    queue: Weak<WaitQueue>,
    available: Arc<Notify>,
    lanes: Vec<L>,
    interval: Duration,
) {
    let limits = LaneLimits::new(lanes.len(), interval);

    while let Some(WaitingEntry {
        operation, result, ..
    }) = next_entry(&queue, &available).await
    {
        let index = loop {
            match limits.acquire() {
                Ok(index) => break index,
                Err(wait) => {
                    trace!("No lane available, waiting {wait:?}");
                    sleep(wait).await;
                }
            }
        };
        debug!("Dispatching {operation:?} on lane {index}");

        match lanes[index].request(operation) {
            Some(dispatched) => forward(dispatched, result),
            None => {
                result.close(ErrorKind::NotDispatched);
            }
        }
    }

    debug!("Dispatcher dropped, scheduler stopped");
}

/// Bind the caller's result to whatever the lane returned
fn forward(dispatched: DeferredResult, result: DeferredResult) {
    if let Some(handle) = dispatched.transport() {
        result.bind(handle);
        return;
    }
    // The lane itself defers, e.g. a nested dispatcher
    tokio::spawn(async move {
        match dispatched.bound_handle().await {
            Ok(handle) => result.bind(handle),
            Err(error) => result.close(error),
        };
    });
}
