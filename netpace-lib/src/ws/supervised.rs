use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::Result;

/// A long-lived connection which can be driven by a
/// [`Supervisor`](super::Supervisor).
///
/// [`Connection`](super::Connection) is the implementation used in practice;
/// the trait keeps the supervisor independent of the payload type.
#[async_trait]
pub trait Supervised: Send + Sync {
    /// Unique id, used to avoid duplicate roster entries
    fn id(&self) -> u64;

    /// Name used in logs
    fn key(&self) -> &str;

    /// Put the connection (back) under supervision
    fn set_monitored(&self);

    /// `false` once the owner stopped the connection for good
    fn is_monitored(&self) -> bool;

    /// True while a connection attempt is in flight
    fn is_connecting(&self) -> bool;

    /// True while a session is established
    fn is_channel_connected(&self) -> bool;

    /// True once the connected hook of the current session ran
    fn is_connected(&self) -> bool;

    /// Disconnect if there was no inbound traffic for too long
    async fn disconnect_if_inactive(&self) -> bool;

    /// Disconnect if the session is due for a periodic refresh
    async fn disconnect_if_reconnect(&self) -> bool;

    /// Time of the last heartbeat, `None` if heartbeats do not apply
    fn heartbeat_time(&self) -> Option<Instant>;

    /// Send a heartbeat now
    ///
    /// # Errors
    ///
    /// Returns the error of the heartbeat hook, if it ran inline.
    fn heartbeat(&self) -> Result<()>;

    /// Time since the last inbound traffic
    fn inactive_time(&self) -> Duration;

    /// Start a connection attempt bound to `local_ip`.
    ///
    /// Returns `false` if an attempt is already in flight.
    ///
    /// # Errors
    ///
    /// Fails if the attempt could not be started at all.
    async fn open(&self, local_ip: Option<IpAddr>) -> Result<bool>;

    /// Log a one-line summary of the connection state
    fn log_stats(&self);
}

#[async_trait]
impl<S: Supervised + ?Sized> Supervised for std::sync::Arc<S> {
    fn id(&self) -> u64 {
        (**self).id()
    }

    fn key(&self) -> &str {
        (**self).key()
    }

    fn set_monitored(&self) {
        (**self).set_monitored();
    }

    fn is_monitored(&self) -> bool {
        (**self).is_monitored()
    }

    fn is_connecting(&self) -> bool {
        (**self).is_connecting()
    }

    fn is_channel_connected(&self) -> bool {
        (**self).is_channel_connected()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    async fn disconnect_if_inactive(&self) -> bool {
        (**self).disconnect_if_inactive().await
    }

    async fn disconnect_if_reconnect(&self) -> bool {
        (**self).disconnect_if_reconnect().await
    }

    fn heartbeat_time(&self) -> Option<Instant> {
        (**self).heartbeat_time()
    }

    fn heartbeat(&self) -> Result<()> {
        (**self).heartbeat()
    }

    fn inactive_time(&self) -> Duration {
        (**self).inactive_time()
    }

    async fn open(&self, local_ip: Option<IpAddr>) -> Result<bool> {
        (**self).open(local_ip).await
    }

    fn log_stats(&self) {
        (**self).log_stats();
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

    use super::*;
    use crate::ErrorKind;

    static NEXT_ID: AtomicU64 = AtomicU64::new(1_000_000);

    /// In-memory stand-in for a connection, recording what the supervisor
    /// asked it to do
    pub(crate) struct FakeClient {
        id: u64,
        key: String,
        pub(crate) monitored: AtomicBool,
        pub(crate) channel: AtomicBool,
        pub(crate) inactive: AtomicBool,
        pub(crate) failing: AtomicBool,
        pub(crate) heartbeat_at: Mutex<Option<Instant>>,
        pub(crate) heartbeats: AtomicUsize,
        pub(crate) stats: AtomicUsize,
        pub(crate) opened: Mutex<Vec<(Instant, Option<IpAddr>)>>,
    }

    impl FakeClient {
        pub(crate) fn new(key: &str) -> Self {
            Self {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                key: key.to_string(),
                monitored: AtomicBool::new(true),
                channel: AtomicBool::new(false),
                inactive: AtomicBool::new(false),
                failing: AtomicBool::new(false),
                heartbeat_at: Mutex::new(None),
                heartbeats: AtomicUsize::new(0),
                stats: AtomicUsize::new(0),
                opened: Mutex::default(),
            }
        }

        pub(crate) fn opened(&self) -> usize {
            self.opened.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Supervised for FakeClient {
        fn id(&self) -> u64 {
            self.id
        }

        fn key(&self) -> &str {
            &self.key
        }

        fn set_monitored(&self) {
            self.monitored.store(true, Ordering::SeqCst);
        }

        fn is_monitored(&self) -> bool {
            self.monitored.load(Ordering::SeqCst)
        }

        fn is_connecting(&self) -> bool {
            false
        }

        fn is_channel_connected(&self) -> bool {
            self.channel.load(Ordering::SeqCst)
        }

        fn is_connected(&self) -> bool {
            self.is_channel_connected()
        }

        async fn disconnect_if_inactive(&self) -> bool {
            if self.inactive.swap(false, Ordering::SeqCst) {
                self.channel.store(false, Ordering::SeqCst);
                return true;
            }
            false
        }

        async fn disconnect_if_reconnect(&self) -> bool {
            false
        }

        fn heartbeat_time(&self) -> Option<Instant> {
            *self.heartbeat_at.lock().unwrap()
        }

        fn heartbeat(&self) -> Result<()> {
            self.heartbeats.fetch_add(1, Ordering::SeqCst);
            *self.heartbeat_at.lock().unwrap() = Some(Instant::now());
            Ok(())
        }

        fn inactive_time(&self) -> Duration {
            Duration::ZERO
        }

        async fn open(&self, local_ip: Option<IpAddr>) -> Result<bool> {
            self.opened.lock().unwrap().push((Instant::now(), local_ip));
            if self.failing.load(Ordering::SeqCst) {
                return Err(ErrorKind::NotConnected(self.key.clone()));
            }
            self.channel.store(true, Ordering::SeqCst);
            *self.heartbeat_at.lock().unwrap() = Some(Instant::now());
            Ok(true)
        }

        fn log_stats(&self) {
            self.stats.fetch_add(1, Ordering::SeqCst);
        }
    }
}
