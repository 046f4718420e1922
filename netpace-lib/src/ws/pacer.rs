use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::warn;
use tokio::time::{Instant, sleep};

use super::Message;
use crate::Result;

/// Shortest delay of a scheduled flush
const MIN_FLUSH_DELAY: Duration = Duration::from_millis(1);

/// Anything outbound messages can be written to
pub trait Outbound: Send + Sync {
    /// Hand one message to the transport without waiting for it to be sent
    ///
    /// # Errors
    ///
    /// Fails if there is currently no open channel to write to.
    fn write(&self, message: Message) -> Result<()>;
}

/// What happened to a paced message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written right away
    Sent,
    /// Queued until the pacing interval allows another send
    Queued,
}

#[derive(Default)]
struct PacerState {
    queue: VecDeque<Message>,
    last_send: Option<Instant>,
    scheduled: bool,
}

/// Enforces a minimum spacing between two outbound messages.
///
/// Messages which cannot be sent right away wait in a FIFO queue, drained by
/// one flush task at a time. The queue is not bounded.
pub(crate) struct Pacer {
    interval: Duration,
    writer: Arc<dyn Outbound>,
    state: Arc<Mutex<PacerState>>,
}

impl Pacer {
    pub(crate) fn new(interval: Duration, writer: Arc<dyn Outbound>) -> Self {
        Self {
            interval,
            writer,
            state: Arc::default(),
        }
    }

    /// Send now if the interval allows it, otherwise enqueue.
    ///
    /// # Errors
    ///
    /// Returns the writer's error if an immediate send fails. Errors of
    /// queued messages are logged when they are flushed.
    pub(crate) fn send(&self, message: Message) -> Result<SendOutcome> {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let elapsed = state
            .last_send
            .map_or(self.interval, |last| now.saturating_duration_since(last));

        if self.interval.is_zero() || (!state.scheduled && elapsed >= self.interval) {
            self.writer.write(message)?;
            state.last_send = Some(now);
            return Ok(SendOutcome::Sent);
        }

        state.queue.push_back(message);
        if !state.scheduled {
            state.scheduled = true;
            let delay = self.interval.saturating_sub(elapsed).max(MIN_FLUSH_DELAY);
            tokio::spawn(flush(
                Arc::downgrade(&self.state),
                self.writer.clone(),
                self.interval,
                delay,
            ));
        }
        Ok(SendOutcome::Queued)
    }

    /// Number of queued messages
    pub(crate) fn pending(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    /// When the last message was written
    pub(crate) fn last_send(&self) -> Option<Instant> {
        self.state.lock().unwrap().last_send
    }
}

/// Send the head of the queue after `delay`, then one message per interval
/// until the queue is empty
async fn flush(
    state: Weak<Mutex<PacerState>>,
    writer: Arc<dyn Outbound>,
    interval: Duration,
    mut delay: Duration,
) {
    loop {
        sleep(delay).await;
        let Some(state) = state.upgrade() else {
            return;
        };
        let mut state = state.lock().unwrap();

        if let Some(message) = state.queue.pop_front() {
            if let Err(e) = writer.write(message) {
                warn!("Dropping paced message: {e}");
            }
            state.last_send = Some(Instant::now());
        }
        if state.queue.is_empty() {
            state.scheduled = false;
            return;
        }
        delay = interval;
    }
}
