use std::net::IpAddr;

use futures::future::join_all;
use log::debug;

use super::{Supervised, Supervisor};
use crate::config::SupervisorConfig;

/// Spreads connections over one supervisor per local address.
///
/// Without configured bind addresses the group holds a single supervisor
/// which lets the OS pick the local address.
#[derive(Debug, Clone)]
pub struct SupervisorGroup {
    supervisors: Vec<Supervisor>,
}

impl SupervisorGroup {
    /// Create one supervisor per address in `config.bind_ips`, named
    /// `name@address`
    #[must_use]
    pub fn new(name: &str, config: &SupervisorConfig) -> Self {
        let supervisors = if config.bind_ips.is_empty() {
            vec![Supervisor::new(name, None, config)]
        } else {
            config
                .bind_ips
                .iter()
                .map(|ip| Supervisor::new(format!("{name}@{ip}"), Some(*ip), config))
                .collect()
        };
        Self { supervisors }
    }

    /// Hand a client to the supervisor with the fewest clients. Ties go to
    /// the supervisor configured first.
    ///
    /// # Panics
    ///
    /// See [`Supervisor::start_client`].
    pub fn start_client<S>(&self, client: S) -> &Supervisor
    where
        S: Supervised + 'static,
    {
        let supervisor = self.least_loaded();
        debug!("Assigning {} to {}", client.key(), supervisor.name());
        supervisor.start_client(client);
        supervisor
    }

    /// The supervisors of this group, in configuration order
    #[must_use]
    pub fn supervisors(&self) -> &[Supervisor] {
        &self.supervisors
    }

    /// Local addresses of the supervisors
    #[must_use]
    pub fn bind_ips(&self) -> Vec<IpAddr> {
        self.supervisors.iter().filter_map(Supervisor::bind_ip).collect()
    }

    /// Number of clients over all supervisors
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.supervisors.iter().map(Supervisor::client_count).sum()
    }

    /// Wait until every supervisor's roster has drained
    pub async fn sync(&self) {
        join_all(self.supervisors.iter().map(Supervisor::sync)).await;
    }

    fn least_loaded(&self) -> &Supervisor {
        // Never empty, `new` creates at least one supervisor
        let first = &self.supervisors[0];
        self.supervisors.iter().skip(1).fold(first, |best, supervisor| {
            if supervisor.client_count() < best.client_count() {
                supervisor
            } else {
                best
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use tokio::time::{sleep, timeout};

    use super::*;
    use crate::ws::supervised::fake::FakeClient;

    fn config(bind_ips: &[&str]) -> SupervisorConfig {
        SupervisorConfig {
            bind_ips: bind_ips.iter().map(|ip| ip.parse().unwrap()).collect(),
            ..SupervisorConfig::default()
        }
    }

    #[test]
    fn test_single_unbound_supervisor_without_addresses() {
        let group = SupervisorGroup::new("ticker", &config(&[]));
        assert_eq!(group.supervisors().len(), 1);
        assert_eq!(group.supervisors()[0].name(), "ticker");
        assert_eq!(group.supervisors()[0].bind_ip(), None);
        assert!(group.bind_ips().is_empty());
    }

    #[test]
    fn test_one_supervisor_per_address() {
        let group = SupervisorGroup::new("ticker", &config(&["10.0.0.1", "::1"]));
        let names: Vec<_> = group.supervisors().iter().map(Supervisor::name).collect();
        assert_eq!(names, vec!["ticker@10.0.0.1", "ticker@::1"]);
        assert_eq!(
            group.bind_ips(),
            vec![
                "10.0.0.1".parse::<IpAddr>().unwrap(),
                "::1".parse::<IpAddr>().unwrap()
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_clients_go_to_least_loaded_supervisor() {
        let group = SupervisorGroup::new("ticker", &config(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]));

        let assigned: Vec<_> = ["a", "b", "c", "d", "e"]
            .into_iter()
            .map(|key| {
                group
                    .start_client(Arc::new(FakeClient::new(key)))
                    .name()
                    .to_string()
            })
            .collect();

        assert_eq!(
            assigned,
            vec![
                "ticker@10.0.0.1",
                "ticker@10.0.0.2",
                "ticker@10.0.0.3",
                "ticker@10.0.0.1",
                "ticker@10.0.0.2"
            ]
        );
        assert_eq!(group.client_count(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clients_bind_to_their_supervisor_address() {
        let group = SupervisorGroup::new("ticker", &config(&["10.0.0.1", "10.0.0.2"]));
        let a = Arc::new(FakeClient::new("a"));
        let b = Arc::new(FakeClient::new("b"));
        group.start_client(a.clone());
        group.start_client(b.clone());

        sleep(Duration::from_millis(100)).await;
        assert_eq!(
            a.opened.lock().unwrap()[0].1,
            Some("10.0.0.1".parse().unwrap())
        );
        assert_eq!(
            b.opened.lock().unwrap()[0].1,
            Some("10.0.0.2".parse().unwrap())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_waits_for_all_supervisors() {
        let group = SupervisorGroup::new("ticker", &config(&["10.0.0.1", "10.0.0.2"]));
        let clients: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|key| Arc::new(FakeClient::new(key)))
            .collect();
        for client in &clients {
            group.start_client(client.clone());
        }

        clients[0].monitored.store(false, Ordering::SeqCst);
        assert!(
            timeout(Duration::from_secs(3), group.sync()).await.is_err(),
            "one client is still supervised"
        );

        clients[1].monitored.store(false, Ordering::SeqCst);
        timeout(Duration::from_secs(3), group.sync())
            .await
            .expect("all rosters should drain");
        assert_eq!(group.client_count(), 0);
    }
}
