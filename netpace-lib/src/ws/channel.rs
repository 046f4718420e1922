use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;

use super::Message;
use super::pacer::Outbound;
use crate::{ErrorKind, Result};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Write side of one established WebSocket session.
///
/// Handed to the connection hooks. Messages written here bypass pacing; use
/// [`Connection::send_message`](super::Connection::send_message) for paced
/// sends. A channel is never reused: a reconnect yields a new one.
#[derive(Debug, Clone)]
pub struct Channel {
    id: u64,
    outbound: mpsc::UnboundedSender<Message>,
    closed: watch::Receiver<bool>,
    session: Arc<Mutex<Option<AbortHandle>>>,
}

/// Session-side ends of a [`Channel`]
pub(crate) struct ChannelEnds {
    pub(crate) outbound: mpsc::UnboundedReceiver<Message>,
    pub(crate) closed: watch::Sender<bool>,
}

impl Channel {
    pub(crate) fn open() -> (Self, ChannelEnds) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        let channel = Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            outbound: outbound_tx,
            closed: closed_rx,
            session: Arc::default(),
        };
        let ends = ChannelEnds {
            outbound: outbound_rx,
            closed: closed_tx,
        };
        (channel, ends)
    }

    /// Unique id of this channel
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Queue a message for writing
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Send`] if the session has already ended.
    pub fn send(&self, message: Message) -> Result<()> {
        self.outbound.send(message).map_err(|_| ErrorKind::Send)
    }

    /// Queue a text message for writing
    ///
    /// # Errors
    ///
    /// See [`Channel::send`].
    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(Message::text(text.into()))
    }

    /// Start a graceful close by sending a close frame
    ///
    /// # Errors
    ///
    /// See [`Channel::send`].
    pub fn close(&self) -> Result<()> {
        self.send(Message::Close(None))
    }

    /// True until the session has ended
    #[must_use]
    pub fn is_open(&self) -> bool {
        !*self.closed.borrow() && !self.outbound.is_closed()
    }

    /// Wait until the session has ended
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        // A dropped sender means the session is gone as well
        let _ = closed.wait_for(|closed| *closed).await;
    }

    pub(crate) fn attach(&self, session: AbortHandle) {
        *self.session.lock().unwrap() = Some(session);
    }

    /// Tear the session down without a closing handshake
    pub(crate) fn abort(&self) {
        if let Some(session) = self.session.lock().unwrap().as_ref() {
            session.abort();
        }
    }
}

/// The channel a connection currently writes to, if any
pub(crate) struct ChannelSlot {
    key: String,
    channel: Mutex<Option<Channel>>,
}

impl ChannelSlot {
    pub(crate) fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            channel: Mutex::new(None),
        }
    }

    pub(crate) fn get(&self) -> Option<Channel> {
        self.channel.lock().unwrap().clone()
    }

    pub(crate) fn set(&self, channel: Channel) {
        *self.channel.lock().unwrap() = Some(channel);
    }

    /// Clear the slot if it still holds the channel with the given id
    pub(crate) fn clear(&self, id: u64) -> bool {
        let mut slot = self.channel.lock().unwrap();
        if slot.as_ref().is_some_and(|channel| channel.id() == id) {
            *slot = None;
            return true;
        }
        false
    }

    pub(crate) fn is_set(&self) -> bool {
        self.channel.lock().unwrap().is_some()
    }
}

impl Outbound for ChannelSlot {
    fn write(&self, message: Message) -> Result<()> {
        match self.get() {
            Some(channel) => channel.send(message),
            None => Err(ErrorKind::NotConnected(self.key.clone())),
        }
    }
}
