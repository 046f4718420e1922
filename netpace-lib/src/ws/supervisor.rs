//! Keeps a roster of connections alive.
//!
//! Every check interval the supervisor walks its roster once:
//!
//! - connections which were stopped leave the roster
//! - connections without a session are queued for (re)opening
//! - connections idle for too long, or due for a periodic refresh, are
//!   disconnected and queued as well
//! - all others get a heartbeat once it is due
//!
//! Queued connections are then opened one after another, spaced by the
//! connect interval, so that a burst of reconnects does not hit the remote
//! end all at once.

use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, error, info};
use tokio::sync::watch;
use tokio::time::{Instant, sleep};

use super::Supervised;
use crate::config::SupervisorConfig;

/// How often the supervisor logs a summary of its roster
const REPORT_INTERVAL: Duration = Duration::from_secs(60);

struct SupervisorInner {
    name: String,
    bind_ip: Option<IpAddr>,
    connect_interval: Duration,
    heartbeat_interval: Duration,
    check_interval: Duration,
    roster: Mutex<Vec<Arc<dyn Supervised>>>,
    size: watch::Sender<usize>,
    started: AtomicBool,
}

/// Drives connections: opens them, keeps them alive and reopens them.
///
/// The supervision loop starts with the first client and ends once every
/// handle to the supervisor is dropped. Cloning yields another handle to the
/// same supervisor.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    /// Create a supervisor whose connections bind to `bind_ip`, if given
    #[must_use]
    pub fn new(name: impl Into<String>, bind_ip: Option<IpAddr>, config: &SupervisorConfig) -> Self {
        let (size, _) = watch::channel(0);
        Self {
            inner: Arc::new(SupervisorInner {
                name: name.into(),
                bind_ip,
                connect_interval: config.connect_interval,
                heartbeat_interval: config.heartbeat_interval,
                check_interval: config.check_interval,
                roster: Mutex::default(),
                size,
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Name used in logs
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Local address connections of this supervisor bind to
    #[must_use]
    pub fn bind_ip(&self) -> Option<IpAddr> {
        self.inner.bind_ip
    }

    /// Put a client under supervision. It is opened on the next check.
    ///
    /// A client which is already on the roster is not added twice.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime, or if the roster mutex
    /// is poisoned
    pub fn start_client<S>(&self, client: S)
    where
        S: Supervised + 'static,
    {
        client.set_monitored();
        {
            let mut roster = self.inner.roster.lock().unwrap();
            if roster.iter().any(|known| known.id() == client.id()) {
                debug!("[{}] {} is already supervised", self.inner.name, client.key());
                return;
            }
            info!("[{}] Supervising {}", self.inner.name, client.key());
            roster.push(Arc::new(client));
            self.inner.size.send_replace(roster.len());
        }

        if !self.inner.started.swap(true, Ordering::SeqCst) {
            tokio::spawn(supervise(Arc::downgrade(&self.inner)));
        }
    }

    /// Number of clients on the roster
    ///
    /// # Panics
    ///
    /// Panics if the roster mutex is poisoned
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.inner.roster.lock().unwrap().len()
    }

    /// Wait until every client has been stopped and left the roster
    pub async fn sync(&self) {
        let mut size = self.inner.size.subscribe();
        // Only fails once the supervisor is gone, nothing to wait for then
        let _ = size.wait_for(|size| *size == 0).await;
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("name", &self.inner.name)
            .field("bind_ip", &self.inner.bind_ip)
            .field("clients", &self.client_count())
            .finish()
    }
}

impl SupervisorInner {
    /// Drop stopped clients and return the remaining ones
    fn snapshot(&self) -> Vec<Arc<dyn Supervised>> {
        let mut roster = self.roster.lock().unwrap();
        roster.retain(|client| {
            let monitored = client.is_monitored();
            if !monitored {
                info!("[{}] No longer supervising {}", self.name, client.key());
            }
            monitored
        });
        self.size.send_replace(roster.len());
        roster.clone()
    }

    async fn check(&self, last_report: &mut Instant) {
        let clients = self.snapshot();
        let mut reopen = Vec::new();

        for client in &clients {
            if client.is_connecting() {
                continue;
            }
            if !client.is_channel_connected() {
                reopen.push(client.clone());
            } else if client.disconnect_if_inactive().await {
                info!(
                    "[{}] {} inactive for {:.1?}, reconnecting",
                    self.name,
                    client.key(),
                    client.inactive_time()
                );
                reopen.push(client.clone());
            } else if client.disconnect_if_reconnect().await {
                info!("[{}] {} due for refresh, reconnecting", self.name, client.key());
                reopen.push(client.clone());
            } else if client
                .heartbeat_time()
                .is_some_and(|at| at + self.heartbeat_interval <= Instant::now())
            {
                if let Err(e) = client.heartbeat() {
                    error!("[{}] Heartbeat of {} failed: {e}", self.name, client.key());
                }
            }
        }

        if last_report.elapsed() >= REPORT_INTERVAL {
            self.report(&clients);
            *last_report = Instant::now();
        }

        for (index, client) in reopen.iter().enumerate() {
            if index > 0 {
                sleep(self.connect_interval).await;
            }
            match client.open(self.bind_ip).await {
                Ok(true) => {}
                Ok(false) => debug!("[{}] {} is still connecting", self.name, client.key()),
                Err(e) => error!("[{}] Cannot open {}: {e}", self.name, client.key()),
            }
        }
    }

    fn report(&self, clients: &[Arc<dyn Supervised>]) {
        let connected = clients.iter().filter(|client| client.is_connected()).count();
        info!(
            "[{}] {connected}/{} clients connected",
            self.name,
            clients.len()
        );
        for client in clients {
            client.log_stats();
        }
    }
}

async fn supervise(inner: Weak<SupervisorInner>) {
    let mut last_report = Instant::now();
    loop {
        let Some(supervisor) = inner.upgrade() else {
            return;
        };
        let check_interval = supervisor.check_interval;
        supervisor.check(&mut last_report).await;
        drop(supervisor);
        sleep(check_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::time::timeout;

    use super::*;
    use crate::ws::supervised::fake::FakeClient;

    fn config() -> SupervisorConfig {
        SupervisorConfig {
            connect_interval: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(5),
            check_interval: Duration::from_secs(1),
            bind_ips: Vec::new(),
        }
    }

    fn offsets(client: &FakeClient, start: Instant) -> Vec<u128> {
        client
            .opened
            .lock()
            .unwrap()
            .iter()
            .map(|(at, _)| at.duration_since(start).as_millis())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_clients_are_opened_one_interval_apart() {
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let supervisor = Supervisor::new("test", Some(ip), &config());
        let clients: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|key| Arc::new(FakeClient::new(key)))
            .collect();

        let start = Instant::now();
        for client in &clients {
            supervisor.start_client(client.clone());
        }
        assert_eq!(supervisor.client_count(), 3);

        sleep(Duration::from_millis(250)).await;
        let opened: Vec<_> = clients.iter().map(|c| offsets(c, start)).collect();
        assert_eq!(opened, vec![vec![0], vec![100], vec![200]]);
        assert_eq!(clients[0].opened.lock().unwrap()[0].1, Some(ip));
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_client_is_supervised_once() {
        let supervisor = Supervisor::new("test", None, &config());
        let client = Arc::new(FakeClient::new("a"));
        supervisor.start_client(client.clone());
        supervisor.start_client(client.clone());
        assert_eq!(supervisor.client_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_clients_leave_and_sync_returns() {
        let supervisor = Supervisor::new("test", None, &config());
        let a = Arc::new(FakeClient::new("a"));
        let b = Arc::new(FakeClient::new("b"));
        supervisor.start_client(a.clone());
        supervisor.start_client(b.clone());

        sleep(Duration::from_millis(500)).await;
        a.monitored.store(false, Ordering::SeqCst);
        b.monitored.store(false, Ordering::SeqCst);

        timeout(Duration::from_secs(5), supervisor.sync())
            .await
            .expect("roster should drain");
        assert_eq!(supervisor.client_count(), 0);

        // A stopped client can come back
        supervisor.start_client(a.clone());
        assert!(a.is_monitored());
        assert_eq!(supervisor.client_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_once_due() {
        let supervisor = Supervisor::new("test", None, &config());
        let client = Arc::new(FakeClient::new("a"));
        supervisor.start_client(client.clone());

        sleep(Duration::from_millis(4500)).await;
        assert_eq!(client.heartbeats.load(Ordering::SeqCst), 0);

        sleep(Duration::from_secs(1)).await;
        assert_eq!(client.heartbeats.load(Ordering::SeqCst), 1);
        assert_eq!(client.opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_reported_once_per_interval() {
        let supervisor = Supervisor::new("test", None, &config());
        let client = Arc::new(FakeClient::new("a"));
        supervisor.start_client(client.clone());

        sleep(Duration::from_secs(59)).await;
        assert_eq!(client.stats.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(91_500)).await;
        assert_eq!(client.stats.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_open_does_not_stop_the_batch() {
        let supervisor = Supervisor::new("test", None, &config());
        let failing = Arc::new(FakeClient::new("failing"));
        failing.failing.store(true, Ordering::SeqCst);
        let healthy = Arc::new(FakeClient::new("healthy"));
        supervisor.start_client(failing.clone());
        supervisor.start_client(healthy.clone());

        sleep(Duration::from_millis(150)).await;
        assert_eq!(failing.opened(), 1);
        assert_eq!(healthy.opened(), 1);
        assert!(healthy.is_channel_connected());

        // Retried on the next check
        sleep(Duration::from_secs(1)).await;
        assert_eq!(failing.opened(), 2);
        assert_eq!(healthy.opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactive_client_is_reopened() {
        let supervisor = Supervisor::new("test", None, &config());
        let client = Arc::new(FakeClient::new("a"));
        supervisor.start_client(client.clone());

        sleep(Duration::from_millis(500)).await;
        assert_eq!(client.opened(), 1);
        client.inactive.store(true, Ordering::SeqCst);

        sleep(Duration::from_secs(1)).await;
        assert_eq!(client.opened(), 2);
        assert!(client.is_channel_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_ends_with_supervisor() {
        let client = Arc::new(FakeClient::new("a"));
        {
            let supervisor = Supervisor::new("test", None, &config());
            supervisor.start_client(client.clone());
            sleep(Duration::from_millis(500)).await;
        }
        client.channel.store(false, Ordering::SeqCst);

        sleep(Duration::from_secs(3)).await;
        assert_eq!(client.opened(), 1);
    }
}
