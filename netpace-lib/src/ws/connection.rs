//! A single supervised WebSocket connection.
//!
//! # Lifecycle
//!
//! A [`Connection`] starts disconnected. [`Connection::open`] spawns a task
//! which connects (TCP, TLS for `wss`, WebSocket handshake), runs the
//! connected hook and then owns the session until either side closes it.
//! When the session ends, the same task records the disconnect, clears the
//! channel and runs the disconnected hook. Opening an already connected
//! connection first closes the current session, so `open` doubles as
//! reconnect.
//!
//! The `connecting` flag rejects overlapping attempts. It is cleared once the
//! attempt either failed or the session is up.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::{TcpSocket, TcpStream, lookup_host};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout};
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream, client_async_tls_with_config};
use url::Url;

use super::builder::{ConnectionBuilder, Hooks, parse_target};
use super::channel::{Channel, ChannelEnds, ChannelSlot};
use super::pacer::{Pacer, SendOutcome};
use super::{Message, Supervised};
use crate::{ErrorKind, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long a graceful close may take before the session is torn down
const GRACEFUL_CLOSE: Duration = Duration::from_secs(1);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

struct Clock {
    connected: Option<Instant>,
    disconnected: Option<Instant>,
    activity: Instant,
    heartbeat: Option<Instant>,
}

struct Inner<D> {
    id: u64,
    key: String,
    target: RwLock<Url>,
    payload: Arc<D>,
    context: Option<Handle>,
    hooks: Hooks<D>,
    max_inactive_time: Duration,
    reconnect_interval: Duration,
    connect_timeout: Duration,
    accept_invalid_certs: bool,

    connecting: AtomicBool,
    /// Set once the connected hook ran
    connected: AtomicBool,
    /// Held while `connected` changes and while the connected hook or an
    /// [`Connection::if_connected`] action runs
    transition: Mutex<()>,
    monitored: AtomicBool,
    channel: Arc<ChannelSlot>,
    pacer: Pacer,
    clock: Mutex<Clock>,
    local_ip: Mutex<Option<IpAddr>>,
}

/// One persistent WebSocket connection, built with a
/// [`ConnectionBuilder`].
///
/// Cloning is cheap and yields another handle to the same connection.
pub struct Connection<D> {
    inner: Arc<Inner<D>>,
}

impl<D> Clone for Connection<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Handle to a [`Connection`] which does not keep it alive.
///
/// Lets a connection's payload refer back to the connection.
pub struct WeakConnection<D> {
    inner: Weak<Inner<D>>,
}

impl<D> Clone for WeakConnection<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D> WeakConnection<D> {
    /// `None` once every [`Connection`] handle was dropped
    #[must_use]
    pub fn upgrade(&self) -> Option<Connection<D>> {
        self.inner.upgrade().map(|inner| Connection { inner })
    }
}

impl<D> Connection<D>
where
    D: Send + Sync + 'static,
{
    pub(crate) fn new(builder: ConnectionBuilder<D>, target: Url) -> Self {
        let channel = Arc::new(ChannelSlot::new(builder.key.clone()));
        let pacer = Pacer::new(builder.send_interval, channel.clone());

        Self {
            inner: Arc::new(Inner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                key: builder.key,
                target: RwLock::new(target),
                payload: Arc::new(builder.payload),
                context: builder.context,
                hooks: builder.hooks,
                max_inactive_time: builder.max_inactive_time,
                reconnect_interval: builder.reconnect_interval,
                connect_timeout: builder.connect_timeout,
                accept_invalid_certs: builder.accept_invalid_certs,
                connecting: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                transition: Mutex::new(()),
                monitored: AtomicBool::new(true),
                channel,
                pacer,
                clock: Mutex::new(Clock {
                    connected: None,
                    disconnected: None,
                    activity: Instant::now(),
                    heartbeat: None,
                }),
                local_ip: Mutex::new(None),
            }),
        }
    }

    /// Handle which does not keep the connection alive
    #[must_use]
    pub fn downgrade(&self) -> WeakConnection<D> {
        WeakConnection {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Name of this connection in logs
    #[must_use]
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// The URL the next connection attempt goes to
    ///
    /// # Panics
    ///
    /// Panics if the target lock is poisoned
    #[must_use]
    pub fn target(&self) -> Url {
        self.inner.target.read().unwrap().clone()
    }

    /// Change the target of future connection attempts, e.g. from the
    /// starting hook
    ///
    /// # Errors
    ///
    /// Same as [`ConnectionBuilder::build`].
    ///
    /// # Panics
    ///
    /// Panics if the target lock is poisoned
    pub fn set_target(&self, uri: &str) -> Result<()> {
        let target = parse_target(uri)?;
        *self.inner.target.write().unwrap() = target;
        Ok(())
    }

    /// The payload handed to every hook
    #[must_use]
    pub fn payload(&self) -> &D {
        &self.inner.payload
    }

    /// Local address of the last connection attempt
    ///
    /// # Panics
    ///
    /// Panics if the local address mutex is poisoned
    #[must_use]
    pub fn local_ip(&self) -> Option<IpAddr> {
        *self.inner.local_ip.lock().unwrap()
    }

    /// The channel of the current session
    #[must_use]
    pub fn channel(&self) -> Option<Channel> {
        self.inner.channel.get()
    }

    /// True once the connected hook of the current session ran.
    ///
    /// Never blocks, so it may be called from hooks and from
    /// [`Connection::if_connected`] actions.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// True while a session is established
    #[must_use]
    pub fn is_channel_connected(&self) -> bool {
        self.inner.channel.is_set()
    }

    /// True while a connection attempt is in flight
    #[must_use]
    pub fn is_connecting(&self) -> bool {
        self.inner.connecting.load(Ordering::SeqCst)
    }

    /// `false` once [`Connection::stop`] was called or the connect-error
    /// hook gave up
    #[must_use]
    pub fn is_monitored(&self) -> bool {
        self.inner.monitored.load(Ordering::SeqCst)
    }

    /// Run `action` if, and only while, the connection is connected.
    ///
    /// The connected hook cannot run concurrently with `action`, and the
    /// connection does not change state while `action` runs. `action` may
    /// read [`Connection::is_connected`], but must not call `if_connected`
    /// again: the guard is not reentrant. For the same reason, calling this
    /// from an inline connected hook deadlocks.
    ///
    /// # Panics
    ///
    /// Panics if the transition mutex is poisoned
    pub fn if_connected<F: FnOnce()>(&self, action: F) -> bool {
        let _transition = self.inner.transition.lock().unwrap();
        if self.is_connected() {
            action();
            return true;
        }
        false
    }

    /// Send a message, respecting the configured send interval
    ///
    /// # Errors
    ///
    /// Fails if the message should be sent right away but there is no open
    /// channel.
    pub fn send_message(&self, message: Message) -> Result<SendOutcome> {
        self.inner.pacer.send(message)
    }

    /// Send a text message, respecting the configured send interval
    ///
    /// # Errors
    ///
    /// See [`Connection::send_message`].
    pub fn send_text(&self, text: impl Into<String>) -> Result<SendOutcome> {
        self.send_message(Message::text(text.into()))
    }

    /// Number of messages waiting for the send interval
    #[must_use]
    pub fn pending_messages(&self) -> usize {
        self.inner.pacer.pending()
    }

    /// Time since the last inbound message
    ///
    /// # Panics
    ///
    /// Panics if the clock mutex is poisoned
    #[must_use]
    pub fn inactive_time(&self) -> Duration {
        self.inner.clock.lock().unwrap().activity.elapsed()
    }

    /// Time of the last heartbeat. `None` without a session or without a
    /// heartbeat hook, in which case there is nothing to send.
    ///
    /// # Panics
    ///
    /// Panics if the clock mutex is poisoned
    #[must_use]
    pub fn heartbeat_time(&self) -> Option<Instant> {
        if self.inner.hooks.heartbeat.is_none() || !self.is_channel_connected() {
            return None;
        }
        self.inner.clock.lock().unwrap().heartbeat
    }

    /// Run the heartbeat hook if there is a session, and stamp the heartbeat
    /// time either way
    ///
    /// # Errors
    ///
    /// Returns the error of the hook if it runs inline. With a context, the
    /// error is logged.
    ///
    /// # Panics
    ///
    /// Panics if the clock mutex is poisoned
    pub fn heartbeat(&self) -> Result<()> {
        let inner = &self.inner;
        let outcome = match (inner.hooks.heartbeat.clone(), inner.channel.get()) {
            (Some(hook), Some(channel)) => match &inner.context {
                Some(context) => {
                    let payload = inner.payload.clone();
                    let label = self.label();
                    context.spawn(async move {
                        if let Err(e) = hook(&channel, &payload) {
                            error!("[{label}] Heartbeat failed: {e}");
                        }
                    });
                    Ok(())
                }
                None => hook(&channel, &inner.payload),
            },
            _ => Ok(()),
        };
        inner.clock.lock().unwrap().heartbeat = Some(Instant::now());
        outcome
    }

    /// Start connecting to the target, bound to `local_ip` if given.
    ///
    /// An established session is closed first. Returns `false` without doing
    /// anything if another attempt is still in flight. The outcome of the
    /// attempt is reported through the hooks.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidUri`] if no host and port can be derived
    /// from the target.
    ///
    /// # Panics
    ///
    /// Panics if one of the state mutexes is poisoned
    pub async fn open(&self, local_ip: Option<IpAddr>) -> Result<bool> {
        let inner = &self.inner;
        if inner.connecting.swap(true, Ordering::SeqCst) {
            info!("[{}] Already connecting", self.label());
            return Ok(false);
        }
        *inner.local_ip.lock().unwrap() = local_ip;

        if inner.channel.is_set() {
            self.disconnect().await;
        }
        inner.set_connected(false);

        if let Some(starting) = &inner.hooks.starting {
            starting(self);
        }

        let target = self.target();
        let (host, port) = match endpoint(&target) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                inner.connecting.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        inner.clock.lock().unwrap().activity = Instant::now();
        info!("[{}] Connecting to {target}", self.label());
        tokio::spawn(establish(self.clone(), target, host, port, local_ip));
        Ok(true)
    }

    /// Open again with the local address of the last attempt
    ///
    /// # Errors
    ///
    /// See [`Connection::open`].
    pub async fn reconnect(&self) -> Result<bool> {
        self.open(self.local_ip()).await
    }

    /// Close the session, if any.
    ///
    /// Sends a close frame and waits up to one second for the session to
    /// end, then tears it down. A supervised connection is reconnected
    /// afterwards; use [`Connection::stop`] to prevent that.
    ///
    /// # Panics
    ///
    /// Panics if the transition mutex is poisoned
    pub async fn disconnect(&self) {
        let Some(channel) = self.inner.channel.get() else {
            return;
        };
        if channel.close().is_ok() && timeout(GRACEFUL_CLOSE, channel.closed()).await.is_ok() {
            return;
        }

        debug!("[{}] No graceful close, aborting session", self.label());
        channel.abort();
        if self.inner.channel.clear(channel.id()) {
            self.inner.set_connected(false);
        }
    }

    /// Disconnect and leave supervision for good
    pub async fn stop(&self) {
        self.inner.monitored.store(false, Ordering::SeqCst);
        self.disconnect().await;
    }

    /// Disconnect if no message arrived within the maximum inactive time.
    /// Always `false` if that time is zero.
    pub async fn disconnect_if_inactive(&self) -> bool {
        let max = self.inner.max_inactive_time;
        if !self.is_connected() || max.is_zero() || self.inactive_time() < max {
            return false;
        }
        self.disconnect().await;
        true
    }

    /// Disconnect if the session has been up for the reconnect interval.
    /// Always `false` if that interval is zero.
    ///
    /// # Panics
    ///
    /// Panics if the clock mutex is poisoned
    pub async fn disconnect_if_reconnect(&self) -> bool {
        let interval = self.inner.reconnect_interval;
        let connected_at = self.inner.clock.lock().unwrap().connected;
        let due = connected_at.is_some_and(|at| at.elapsed() >= interval);
        if !self.is_connected() || interval.is_zero() || !due {
            return false;
        }
        self.disconnect().await;
        true
    }

    /// Log a summary of the connection state
    ///
    /// # Panics
    ///
    /// Panics if the clock mutex is poisoned
    pub fn log_stats(&self) {
        let clock = self.inner.clock.lock().unwrap();
        info!(
            "[{}] {} connected: {}/{} since: {} active: {} heartbeat: {} pending: {} last send: {} last disconnect: {}",
            self.label(),
            self.target(),
            self.is_connected(),
            self.is_channel_connected(),
            ago(clock.connected),
            ago(Some(clock.activity)),
            ago(clock.heartbeat),
            self.pending_messages(),
            ago(self.inner.pacer.last_send()),
            ago(clock.disconnected),
        );
    }

    fn label(&self) -> String {
        match self.local_ip() {
            Some(ip) => format!("{}@{ip}", self.inner.key),
            None => self.inner.key.clone(),
        }
    }
}

impl<D> Inner<D>
where
    D: Send + Sync + 'static,
{
    fn set_connected(&self, connected: bool) {
        let _transition = self.transition.lock().unwrap();
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn run_hook<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match &self.context {
            Some(context) => {
                context.spawn(async move { hook() });
            }
            None => hook(),
        }
    }

    fn on_message(&self, channel: &Channel, message: Message) {
        self.clock.lock().unwrap().activity = Instant::now();
        if !(message.is_text() || message.is_binary()) {
            return;
        }
        if let Some(hook) = self.hooks.frame.clone() {
            let payload = self.payload.clone();
            let channel = channel.clone();
            self.run_hook(move || hook(&channel, message, &payload));
        }
    }
}

fn ago(at: Option<Instant>) -> String {
    at.map_or_else(|| "never".to_string(), |at| format!("{:.1?} ago", at.elapsed()))
}

fn endpoint(target: &Url) -> Result<(String, u16)> {
    let host = target
        .host_str()
        .ok_or_else(|| ErrorKind::InvalidUri(format!("{target}: missing host")))?;
    let port = target
        .port_or_known_default()
        .ok_or_else(|| ErrorKind::InvalidUri(format!("{target}: unknown port")))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok((host.to_string(), port))
}

async fn connect_tcp(host: &str, port: u16, local_ip: Option<IpAddr>) -> io::Result<TcpStream> {
    let Some(local_ip) = local_ip else {
        return TcpStream::connect((host, port)).await;
    };

    let mut last_error = None;
    for address in lookup_host((host, port)).await? {
        if address.is_ipv4() != local_ip.is_ipv4() {
            continue;
        }
        let socket = if address.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.bind(SocketAddr::new(local_ip, 0))?;
        match socket.connect(address).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no address of {host} is reachable from {local_ip}"),
        )
    }))
}

async fn connect(
    target: &Url,
    host: &str,
    port: u16,
    local_ip: Option<IpAddr>,
    accept_invalid_certs: bool,
) -> Result<WsStream> {
    let stream = connect_tcp(host, port, local_ip)
        .await
        .map_err(|source| ErrorKind::Connect {
            target: format!("{host}:{port}"),
            source: Arc::new(source),
        })?;

    let connector = if target.scheme() == "wss" {
        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()?;
        Connector::NativeTls(tls)
    } else {
        Connector::Plain
    };

    let (stream, _) =
        client_async_tls_with_config(target.as_str(), stream, None, Some(connector)).await?;
    Ok(stream)
}

/// Connect, run the session and clean up after it
async fn establish<D>(
    connection: Connection<D>,
    target: Url,
    host: String,
    port: u16,
    local_ip: Option<IpAddr>,
) where
    D: Send + Sync + 'static,
{
    let inner = &connection.inner;
    let label = connection.label();

    let attempt = connect(&target, &host, port, local_ip, inner.accept_invalid_certs);
    let outcome = match timeout(inner.connect_timeout, attempt).await {
        Ok(outcome) => outcome,
        Err(_) => Err(ErrorKind::Timeout(inner.connect_timeout)),
    };
    let stream = match outcome {
        Ok(stream) => stream,
        Err(e) => {
            info!("[{label}] Connection failed: {e}");
            if let Some(hook) = &inner.hooks.connect_error {
                if !hook(&e, &inner.payload) {
                    info!("[{label}] Giving up");
                    inner.monitored.store(false, Ordering::SeqCst);
                }
            }
            inner.connecting.store(false, Ordering::SeqCst);
            return;
        }
    };

    {
        let now = Instant::now();
        let mut clock = inner.clock.lock().unwrap();
        clock.connected = Some(now);
        clock.heartbeat = Some(now);
        clock.activity = now;
    }
    let (channel, ChannelEnds { outbound, closed }) = Channel::open();
    inner.channel.set(channel.clone());

    // Stopped while connecting; `stop` saw no channel to close
    if !inner.monitored.load(Ordering::SeqCst) {
        info!("[{label}] Stopped while connecting, closing");
        inner.channel.clear(channel.id());
        inner.connecting.store(false, Ordering::SeqCst);
        let mut stream = stream;
        let _ = stream.close(None).await;
        closed.send_replace(true);
        return;
    }
    info!("[{label}] Connected");

    {
        let _transition = inner.transition.lock().unwrap();
        if let Some(hook) = inner.hooks.connected.clone() {
            let payload = inner.payload.clone();
            let channel = channel.clone();
            inner.run_hook(move || hook(&channel, &payload));
        }
        inner.connected.store(true, Ordering::SeqCst);
    }
    inner.connecting.store(false, Ordering::SeqCst);

    let session = tokio::spawn(run_session(
        inner.clone(),
        stream,
        outbound,
        channel.clone(),
    ));
    channel.attach(session.abort_handle());
    // An error only means the session was aborted
    let _ = session.await;

    inner.clock.lock().unwrap().disconnected = Some(Instant::now());
    info!("[{label}] Disconnected");
    if inner.channel.clear(channel.id()) {
        inner.set_connected(false);
    }
    closed.send_replace(true);

    if let Some(hook) = inner.hooks.disconnected.clone() {
        let payload = inner.payload.clone();
        inner.run_hook(move || hook(&payload));
    }
}

async fn run_session<D>(
    inner: Arc<Inner<D>>,
    stream: WsStream,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    channel: Channel,
) where
    D: Send + Sync + 'static,
{
    let (mut sink, mut source) = stream.split();
    loop {
        tokio::select! {
            message = outbound.recv() => {
                let Some(message) = message else {
                    break;
                };
                if let Err(e) = sink.send(message).await {
                    warn!("[{}] Write failed: {e}", inner.key);
                    break;
                }
            }
            frame = source.next() => match frame {
                Some(Ok(Message::Close(frame))) => {
                    debug!("[{}] Closed by peer: {frame:?}", inner.key);
                    let _ = sink.close().await;
                    break;
                }
                Some(Ok(message)) => inner.on_message(&channel, message),
                Some(Err(e)) => {
                    warn!("[{}] {e}", inner.key);
                    break;
                }
                None => break,
            },
        }
    }
}

#[async_trait]
impl<D> Supervised for Connection<D>
where
    D: Send + Sync + 'static,
{
    fn id(&self) -> u64 {
        self.inner.id
    }

    fn key(&self) -> &str {
        Connection::key(self)
    }

    fn set_monitored(&self) {
        self.inner.monitored.store(true, Ordering::SeqCst);
    }

    fn is_monitored(&self) -> bool {
        Connection::is_monitored(self)
    }

    fn is_connecting(&self) -> bool {
        Connection::is_connecting(self)
    }

    fn is_channel_connected(&self) -> bool {
        Connection::is_channel_connected(self)
    }

    fn is_connected(&self) -> bool {
        Connection::is_connected(self)
    }

    async fn disconnect_if_inactive(&self) -> bool {
        Connection::disconnect_if_inactive(self).await
    }

    async fn disconnect_if_reconnect(&self) -> bool {
        Connection::disconnect_if_reconnect(self).await
    }

    fn heartbeat_time(&self) -> Option<Instant> {
        Connection::heartbeat_time(self)
    }

    fn heartbeat(&self) -> Result<()> {
        Connection::heartbeat(self)
    }

    fn inactive_time(&self) -> Duration {
        Connection::inactive_time(self)
    }

    async fn open(&self, local_ip: Option<IpAddr>) -> Result<bool> {
        Connection::open(self, local_ip).await
    }

    fn log_stats(&self) {
        Connection::log_stats(self);
    }
}

impl<D> fmt::Debug for Connection<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("key", &self.inner.key)
            .field("connecting", &self.inner.connecting.load(Ordering::SeqCst))
            .field("monitored", &self.inner.monitored.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use pretty_assertions::assert_eq;
    use test_utils::ws_server;
    use tokio::sync::mpsc::unbounded_channel;
    use tokio::time::sleep;

    use super::*;
    use crate::ws::{ConnectionBuilder, wait_until};

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    fn closed_port_uri() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("ws://127.0.0.1:{port}/")
    }

    #[tokio::test]
    async fn test_connects_and_receives_frames() {
        let uri = ws_server!();
        let connected = counter();
        let (tx, mut rx) = unbounded_channel();

        let connection = ConnectionBuilder::new("echo", uri, tx)
            .on_connected({
                let connected = connected.clone();
                move |_, _| {
                    connected.fetch_add(1, Ordering::SeqCst);
                }
            })
            .on_frame(|_, message, tx| {
                let _ = tx.send(message);
            })
            .build()
            .unwrap();

        assert!(!connection.if_connected(|| {}));
        assert!(connection.open(None).await.unwrap());
        wait_until(|| connection.is_connected()).await;
        assert_eq!(connected.load(Ordering::SeqCst), 1);
        assert!(connection.is_channel_connected());
        assert!(!connection.is_connecting());
        assert!(connection.if_connected(|| {}));

        assert_eq!(connection.send_text("hello").unwrap(), SendOutcome::Sent);
        let echoed = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(echoed, Message::text("hello"));
        assert!(connection.inactive_time() < Duration::from_secs(5));

        connection.stop().await;
        assert!(!connection.is_monitored());
        assert!(!connection.is_channel_connected());
        assert!(!connection.is_connected());
    }

    #[tokio::test]
    async fn test_disconnected_hook_runs_after_close() {
        let uri = ws_server!();
        let disconnected = counter();
        let connection = ConnectionBuilder::new("echo", uri, ())
            .on_disconnected({
                let disconnected = disconnected.clone();
                move |_| {
                    disconnected.fetch_add(1, Ordering::SeqCst);
                }
            })
            .build()
            .unwrap();

        connection.open(None).await.unwrap();
        wait_until(|| connection.is_connected()).await;
        connection.disconnect().await;

        wait_until(|| disconnected.load(Ordering::SeqCst) == 1).await;
        // Still supervised, only the session is gone
        assert!(connection.is_monitored());
    }

    #[tokio::test]
    async fn test_connect_error_hook_can_give_up() {
        let errors = counter();
        let connection = ConnectionBuilder::new("refused", closed_port_uri(), ())
            .on_connect_error({
                let errors = errors.clone();
                move |error, _| {
                    assert!(matches!(error, ErrorKind::Connect { .. }));
                    errors.fetch_add(1, Ordering::SeqCst);
                    false
                }
            })
            .build()
            .unwrap();

        assert!(connection.open(None).await.unwrap());
        wait_until(|| !connection.is_monitored()).await;
        wait_until(|| !connection.is_connecting()).await;
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(!connection.is_channel_connected());
    }

    #[tokio::test]
    async fn test_connect_error_without_hook_stays_monitored() {
        let connection = ConnectionBuilder::new("refused", closed_port_uri(), ())
            .build()
            .unwrap();

        connection.open(None).await.unwrap();
        wait_until(|| !connection.is_connecting()).await;
        assert!(connection.is_monitored());
    }

    #[tokio::test]
    async fn test_overlapping_open_is_rejected() {
        // Accepts TCP but never answers the handshake
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let timed_out = counter();
        let connection = ConnectionBuilder::new("stuck", format!("ws://{address}/"), ())
            .connect_timeout(Duration::from_millis(200))
            .on_connect_error({
                let timed_out = timed_out.clone();
                move |error, _| {
                    if matches!(error, ErrorKind::Timeout(_)) {
                        timed_out.fetch_add(1, Ordering::SeqCst);
                    }
                    true
                }
            })
            .build()
            .unwrap();

        assert!(connection.open(None).await.unwrap());
        assert!(connection.is_connecting());
        assert!(!connection.open(None).await.unwrap());

        wait_until(|| !connection.is_connecting()).await;
        assert_eq!(timed_out.load(Ordering::SeqCst), 1);
        assert!(connection.is_monitored());
    }

    #[tokio::test]
    async fn test_stop_while_connecting_closes_session() {
        // Answers the handshake late, then reports when the client hung up
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let hung_up = Arc::new(AtomicBool::new(false));
        let _server = tokio::spawn({
            let hung_up = hung_up.clone();
            async move {
                let (stream, _) = listener.accept().await.unwrap();
                sleep(Duration::from_millis(300)).await;
                let mut socket = tokio_tungstenite::accept_async(stream).await.unwrap();
                while let Some(Ok(_)) = socket.next().await {}
                hung_up.store(true, Ordering::SeqCst);
            }
        });

        let connected = counter();
        let connection = ConnectionBuilder::new("slow", format!("ws://{address}/"), ())
            .on_connected({
                let connected = connected.clone();
                move |_, _| {
                    connected.fetch_add(1, Ordering::SeqCst);
                }
            })
            .build()
            .unwrap();

        assert!(connection.open(None).await.unwrap());
        assert!(connection.is_connecting());
        connection.stop().await;

        sleep(Duration::from_secs(1)).await;
        assert!(!connection.is_channel_connected());
        assert!(!connection.is_connected());
        assert!(!connection.is_connecting());
        assert_eq!(connected.load(Ordering::SeqCst), 0);
        assert!(hung_up.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_action_may_query_connected_state() {
        let uri = ws_server!();
        let connection = ConnectionBuilder::new("nested", uri, ()).build().unwrap();

        connection.open(None).await.unwrap();
        wait_until(|| connection.is_connected()).await;
        assert!(connection.if_connected(|| assert!(connection.is_connected())));
        connection.stop().await;
    }

    #[tokio::test]
    async fn test_inactive_connection_is_dropped() {
        let uri = ws_server!(|_: Message| None);
        let connection = ConnectionBuilder::new("silent", uri, ())
            .max_inactive_time(Duration::from_millis(100))
            .build()
            .unwrap();

        connection.open(None).await.unwrap();
        wait_until(|| connection.is_connected()).await;
        assert!(!connection.disconnect_if_inactive().await);

        sleep(Duration::from_millis(150)).await;
        assert!(connection.disconnect_if_inactive().await);
        assert!(!connection.is_channel_connected());
        assert!(!connection.disconnect_if_inactive().await);
    }

    #[tokio::test]
    async fn test_periodic_refresh() {
        let uri = ws_server!();
        let connection = ConnectionBuilder::new("refresh", uri, ())
            .reconnect_interval(Duration::from_millis(100))
            .build()
            .unwrap();

        connection.open(None).await.unwrap();
        wait_until(|| connection.is_connected()).await;
        assert!(!connection.disconnect_if_reconnect().await);

        sleep(Duration::from_millis(150)).await;
        assert!(connection.disconnect_if_reconnect().await);
        assert!(!connection.is_channel_connected());
    }

    #[tokio::test]
    async fn test_heartbeat_hook_uses_channel() {
        let uri = ws_server!();
        let (tx, mut rx) = unbounded_channel();
        let connection = ConnectionBuilder::new("heartbeat", uri, tx)
            .on_heartbeat(|channel, _| channel.send_text("ping"))
            .on_frame(|_, message, tx| {
                let _ = tx.send(message);
            })
            .build()
            .unwrap();

        assert!(connection.heartbeat_time().is_none());
        connection.open(None).await.unwrap();
        wait_until(|| connection.is_connected()).await;

        let before = connection.heartbeat_time().unwrap();
        sleep(Duration::from_millis(10)).await;
        connection.heartbeat().unwrap();
        assert!(connection.heartbeat_time().unwrap() > before);

        let echoed = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(echoed, Message::text("ping"));
        connection.stop().await;
    }

    #[tokio::test]
    async fn test_starting_hook_can_change_target() {
        let uri = ws_server!();
        let connection = ConnectionBuilder::new("redirected", closed_port_uri(), uri.clone())
            .on_starting(|connection| {
                let uri = connection.payload().clone();
                connection.set_target(&uri).unwrap();
            })
            .build()
            .unwrap();

        connection.open(None).await.unwrap();
        wait_until(|| connection.is_connected()).await;
        assert_eq!(connection.target().as_str(), uri);
        connection.stop().await;
    }

    #[tokio::test]
    async fn test_reconnect_replaces_session() {
        let uri = ws_server!();
        let connected = counter();
        let connection = ConnectionBuilder::new("echo", uri, ())
            .on_connected({
                let connected = connected.clone();
                move |_, _| {
                    connected.fetch_add(1, Ordering::SeqCst);
                }
            })
            .build()
            .unwrap();

        connection
            .open(Some("127.0.0.1".parse().unwrap()))
            .await
            .unwrap();
        wait_until(|| connection.is_connected()).await;
        let first = connection.channel().unwrap();

        assert!(connection.reconnect().await.unwrap());
        wait_until(|| connected.load(Ordering::SeqCst) == 2).await;
        wait_until(|| connection.is_connected()).await;

        assert!(!first.is_open());
        assert_ne!(connection.channel().unwrap().id(), first.id());
        assert_eq!(connection.local_ip(), Some("127.0.0.1".parse().unwrap()));
        connection.stop().await;
    }

    #[tokio::test]
    async fn test_paced_sends_arrive_in_order() {
        let uri = ws_server!();
        let (tx, mut rx) = unbounded_channel();
        let connection = ConnectionBuilder::new("paced", uri, tx)
            .send_interval(Duration::from_millis(50))
            .on_frame(|_, message, tx| {
                let _ = tx.send(message);
            })
            .build()
            .unwrap();

        connection.open(None).await.unwrap();
        wait_until(|| connection.is_connected()).await;

        let outcomes: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|text| connection.send_text(text).unwrap())
            .collect();
        assert_eq!(
            outcomes,
            vec![SendOutcome::Sent, SendOutcome::Queued, SendOutcome::Queued]
        );

        let mut received = Vec::new();
        for _ in 0..3 {
            let message = timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            received.push(message.to_text().unwrap().to_string());
        }
        assert_eq!(received, vec!["a", "b", "c"]);
        connection.stop().await;
    }

    #[tokio::test]
    async fn test_hooks_run_on_context() {
        let uri = ws_server!();
        let context = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("connection-hooks")
            .enable_all()
            .build()
            .unwrap();
        let (tx, mut rx) = unbounded_channel();
        let connection = ConnectionBuilder::new("context", uri, tx)
            .context(context.handle().clone())
            .on_connected(|_, tx| {
                let _ = tx.send(std::thread::current().name().map(str::to_string));
            })
            .build()
            .unwrap();

        connection.open(None).await.unwrap();
        let thread = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(thread.as_deref(), Some("connection-hooks"));
        connection.stop().await;
        context.shutdown_background();
    }

    #[tokio::test]
    async fn test_weak_handle_does_not_keep_connection_alive() {
        let connection = ConnectionBuilder::new("weak", "ws://localhost/", ())
            .build()
            .unwrap();
        let weak = connection.downgrade();
        assert_eq!(weak.upgrade().unwrap().key(), "weak");

        drop(connection);
        assert!(weak.upgrade().is_none());
    }

    #[tokio::test]
    async fn test_send_without_session_fails() {
        let connection = ConnectionBuilder::new("idle", "ws://127.0.0.1:9/", ())
            .build()
            .unwrap();
        assert!(matches!(
            connection.send_text("x"),
            Err(ErrorKind::NotConnected(key)) if key == "idle"
        ));
    }

    #[test]
    fn test_endpoint_defaults() {
        let ws = Url::parse("ws://example.com/stream").unwrap();
        let wss = Url::parse("wss://example.com/stream").unwrap();
        let ipv6 = Url::parse("ws://[::1]:9000/").unwrap();
        assert_eq!(endpoint(&ws).unwrap(), ("example.com".to_string(), 80));
        assert_eq!(endpoint(&wss).unwrap(), ("example.com".to_string(), 443));
        assert_eq!(endpoint(&ipv6).unwrap(), ("::1".to_string(), 9000));
    }
}
