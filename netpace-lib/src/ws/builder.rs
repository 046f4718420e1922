use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use url::Url;

use super::{Channel, Connection, Message};
use crate::{ErrorKind, Result};

/// Default time without inbound traffic after which a connection is
/// considered dead, 60 seconds.
pub const DEFAULT_MAX_INACTIVE_TIME: Duration = Duration::from_secs(60);

/// Default timeout for connecting, including TLS and the WebSocket handshake
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs right before a connection attempt; may still change the target
pub type StartingHook<D> = Arc<dyn Fn(&Connection<D>) + Send + Sync>;
/// Runs once the WebSocket handshake completed
pub type ConnectedHook<D> = Arc<dyn Fn(&Channel, &D) + Send + Sync>;
/// Runs for every inbound text or binary message
pub type FrameHook<D> = Arc<dyn Fn(&Channel, Message, &D) + Send + Sync>;
/// Sends a heartbeat over the channel
pub type HeartbeatHook<D> = Arc<dyn Fn(&Channel, &D) -> Result<()> + Send + Sync>;
/// Runs after the channel was closed
pub type DisconnectedHook<D> = Arc<dyn Fn(&D) + Send + Sync>;
/// Decides after a failed connection attempt whether to keep retrying
pub type ConnectErrorHook<D> = Arc<dyn Fn(&ErrorKind, &D) -> bool + Send + Sync>;

pub(crate) struct Hooks<D> {
    pub(crate) starting: Option<StartingHook<D>>,
    pub(crate) connected: Option<ConnectedHook<D>>,
    pub(crate) frame: Option<FrameHook<D>>,
    pub(crate) heartbeat: Option<HeartbeatHook<D>>,
    pub(crate) disconnected: Option<DisconnectedHook<D>>,
    pub(crate) connect_error: Option<ConnectErrorHook<D>>,
}

impl<D> Default for Hooks<D> {
    fn default() -> Self {
        Self {
            starting: None,
            connected: None,
            frame: None,
            heartbeat: None,
            disconnected: None,
            connect_error: None,
        }
    }
}

/// Check that `uri` is an absolute `ws` or `wss` URL with a host
pub(crate) fn parse_target(uri: &str) -> Result<Url> {
    let url = Url::parse(uri)?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => return Err(ErrorKind::UnsupportedScheme(other.to_string())),
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(ErrorKind::InvalidUri(format!("{uri}: missing host")));
    }
    Ok(url)
}

/// Configuration and hooks of a [`Connection`].
///
/// ```no_run
/// use netpace_lib::ws::ConnectionBuilder;
///
/// # fn main() -> netpace_lib::Result<()> {
/// let connection = ConnectionBuilder::new("ticker", "wss://stream.example.com/ws", ())
///     .on_frame(|_, message, _| println!("{message}"))
///     .on_heartbeat(|channel, _| channel.send_text("ping"))
///     .build()?;
/// # Ok(())
/// # }
/// ```
///
/// The payload `D` is handed to every hook. Hooks run inline on the session
/// task unless a context is configured, in which case they are spawned onto
/// it. The connect-error hook always runs inline, since its answer decides
/// whether the connection stays supervised. Inline hooks must not block.
pub struct ConnectionBuilder<D> {
    pub(crate) key: String,
    pub(crate) uri: String,
    pub(crate) payload: D,
    pub(crate) context: Option<Handle>,
    pub(crate) hooks: Hooks<D>,
    pub(crate) max_inactive_time: Duration,
    pub(crate) reconnect_interval: Duration,
    pub(crate) send_interval: Duration,
    pub(crate) connect_timeout: Duration,
    pub(crate) accept_invalid_certs: bool,
}

impl<D> ConnectionBuilder<D>
where
    D: Send + Sync + 'static,
{
    /// Start configuring a connection to `uri`, identified by `key` in logs
    #[must_use]
    pub fn new(key: impl Into<String>, uri: impl Into<String>, payload: D) -> Self {
        Self {
            key: key.into(),
            uri: uri.into(),
            payload,
            context: None,
            hooks: Hooks::default(),
            max_inactive_time: DEFAULT_MAX_INACTIVE_TIME,
            reconnect_interval: Duration::ZERO,
            send_interval: Duration::ZERO,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            accept_invalid_certs: false,
        }
    }

    /// Run hooks on the given runtime
    #[must_use]
    pub fn context(mut self, context: Handle) -> Self {
        self.context = Some(context);
        self
    }

    /// Drop the connection after this long without inbound traffic.
    /// Zero disables the check.
    #[must_use]
    pub const fn max_inactive_time(mut self, max_inactive_time: Duration) -> Self {
        self.max_inactive_time = max_inactive_time;
        self
    }

    /// Re-establish the connection after it has been up this long.
    /// Zero disables periodic reconnects.
    #[must_use]
    pub const fn reconnect_interval(mut self, reconnect_interval: Duration) -> Self {
        self.reconnect_interval = reconnect_interval;
        self
    }

    /// Minimum spacing between two messages sent with
    /// [`Connection::send_message`]. Zero disables pacing.
    #[must_use]
    pub const fn send_interval(mut self, send_interval: Duration) -> Self {
        self.send_interval = send_interval;
        self
    }

    /// Give up a connection attempt after this long
    #[must_use]
    pub const fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Accept invalid TLS certificates for `wss` targets.
    ///
    /// ## Warning
    ///
    /// Any certificate for any site will be trusted. Only use this for
    /// endpoints you control.
    #[must_use]
    pub const fn accept_invalid_certs(mut self, accept_invalid_certs: bool) -> Self {
        self.accept_invalid_certs = accept_invalid_certs;
        self
    }

    /// Called before every connection attempt
    #[must_use]
    pub fn on_starting<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Connection<D>) + Send + Sync + 'static,
    {
        self.hooks.starting = Some(Arc::new(hook));
        self
    }

    /// Called once the handshake completed, e.g. to subscribe to topics
    #[must_use]
    pub fn on_connected<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Channel, &D) + Send + Sync + 'static,
    {
        self.hooks.connected = Some(Arc::new(hook));
        self
    }

    /// Called for every inbound text or binary message
    #[must_use]
    pub fn on_frame<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Channel, Message, &D) + Send + Sync + 'static,
    {
        self.hooks.frame = Some(Arc::new(hook));
        self
    }

    /// Called by the supervisor whenever a heartbeat is due
    #[must_use]
    pub fn on_heartbeat<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Channel, &D) -> Result<()> + Send + Sync + 'static,
    {
        self.hooks.heartbeat = Some(Arc::new(hook));
        self
    }

    /// Called after the channel was closed, for whatever reason
    #[must_use]
    pub fn on_disconnected<F>(mut self, hook: F) -> Self
    where
        F: Fn(&D) + Send + Sync + 'static,
    {
        self.hooks.disconnected = Some(Arc::new(hook));
        self
    }

    /// Called when a connection attempt failed. Returning `false` stops
    /// supervision of the connection for good.
    #[must_use]
    pub fn on_connect_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ErrorKind, &D) -> bool + Send + Sync + 'static,
    {
        self.hooks.connect_error = Some(Arc::new(hook));
        self
    }

    /// Create the connection. It is not opened yet.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::UnsupportedScheme`] unless the target is a `ws`
    /// or `wss` URL, and [`ErrorKind::InvalidUri`] if it cannot be parsed or
    /// has no host.
    pub fn build(self) -> Result<Connection<D>> {
        let target = parse_target(&self.uri)?;
        Ok(Connection::new(self, target))
    }
}
