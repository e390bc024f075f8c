use std::{net::SocketAddr, sync::Arc, time::Duration};

use dashmap::DashMap;
use tokio::time::Instant;

use crate::mr::transport::WorkerTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Alive,
    Unresponsive,
}

#[derive(Debug, Clone)]
pub struct WorkerEndpoint {
    pub addr: SocketAddr,
    pub health: Health,
    /// Time of the last successful probe, `None` if the endpoint never answered
    pub last_probe: Option<Instant>,
}

/// Tracks which worker endpoints answer pings.
///
/// Health only gates new dispatches. Tasks already running on an endpoint
/// that stops answering are left to their own deadline.
pub struct LivenessMonitor<T> {
    endpoints: DashMap<SocketAddr, WorkerEndpoint>,
    transport: Arc<T>,
    interval: Duration,
    probe_timeout: Duration,
}

impl<T: WorkerTransport> LivenessMonitor<T> {
    /// Every endpoint starts out unresponsive until its first probe succeeds
    pub fn new(
        workers: impl IntoIterator<Item = SocketAddr>,
        transport: Arc<T>,
        interval: Duration,
        probe_timeout: Duration,
    ) -> Self {
        let endpoints = DashMap::new();
        for addr in workers {
            endpoints.insert(
                addr,
                WorkerEndpoint {
                    addr,
                    health: Health::Unresponsive,
                    last_probe: None,
                },
            );
        }
        Self {
            endpoints,
            transport,
            interval,
            probe_timeout,
        }
    }

    /// Alive endpoints in ascending address order
    pub fn alive_endpoints(&self) -> Vec<SocketAddr> {
        let mut alive = self
            .endpoints
            .iter()
            .filter(|entry| entry.value().health == Health::Alive)
            .map(|entry| *entry.key())
            .collect::<Vec<_>>();
        alive.sort_unstable();
        alive
    }

    pub fn endpoint(&self, addr: SocketAddr) -> Option<WorkerEndpoint> {
        self.endpoints.get(&addr).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Probe one endpoint and record the outcome
    pub async fn probe(&self, addr: SocketAddr) -> Health {
        let outcome = tokio::time::timeout(self.probe_timeout, self.transport.ping(addr)).await;
        let health = match outcome {
            Ok(Ok(_)) => Health::Alive,
            Ok(Err(e)) => {
                tracing::debug!("[Liveness] Probe of {} failed: {}", addr, e);
                Health::Unresponsive
            }
            Err(_) => {
                tracing::debug!("[Liveness] Probe of {} timed out", addr);
                Health::Unresponsive
            }
        };
        self.record(addr, health);
        health
    }

    fn record(&self, addr: SocketAddr, health: Health) {
        let mut endpoint = self.endpoints.entry(addr).or_insert_with(|| WorkerEndpoint {
            addr,
            health: Health::Unresponsive,
            last_probe: None,
        });
        if health == Health::Alive {
            endpoint.last_probe = Some(Instant::now());
        }
        if endpoint.health != health {
            match health {
                Health::Alive => tracing::info!("[Liveness] Worker {} is alive", addr),
                Health::Unresponsive => tracing::warn!("[Liveness] Worker {} is unresponsive", addr),
            }
            endpoint.health = health;
        }
    }

    /// Probe every known endpoint concurrently
    pub async fn probe_all(&self) {
        let addrs = self.endpoints.iter().map(|entry| *entry.key()).collect::<Vec<_>>();
        futures::future::join_all(addrs.into_iter().map(|addr| self.probe(addr))).await;
    }

    /// Probe loop, runs until the task is aborted
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.interval);
        loop {
            interval.tick().await;
            self.probe_all().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mr::testing::{addr, FakeCluster, Behavior};

    fn monitor(cluster: &Arc<FakeCluster>, workers: &[SocketAddr]) -> LivenessMonitor<FakeCluster> {
        LivenessMonitor::new(
            workers.iter().copied(),
            Arc::clone(cluster),
            Duration::from_millis(20),
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn endpoints_start_unresponsive() {
        let cluster = FakeCluster::new();
        let monitor = monitor(&cluster, &[addr(1), addr(2)]);

        assert_eq!(monitor.len(), 2);
        assert!(monitor.alive_endpoints().is_empty());
        assert!(monitor.endpoint(addr(1)).unwrap().last_probe.is_none());
    }

    #[tokio::test]
    async fn probes_mark_health_both_ways() {
        let cluster = FakeCluster::new();
        cluster.set(addr(2), Behavior::Healthy);
        cluster.set(addr(1), Behavior::Healthy);
        cluster.set(addr(3), Behavior::Unreachable);
        let monitor = monitor(&cluster, &[addr(2), addr(1), addr(3)]);

        monitor.probe_all().await;
        assert_eq!(monitor.alive_endpoints(), vec![addr(1), addr(2)]);
        assert!(monitor.endpoint(addr(1)).unwrap().last_probe.is_some());

        cluster.set(addr(1), Behavior::Unreachable);
        cluster.set(addr(3), Behavior::Healthy);
        monitor.probe_all().await;
        assert_eq!(monitor.alive_endpoints(), vec![addr(2), addr(3)]);
        assert_eq!(monitor.endpoint(addr(1)).unwrap().health, Health::Unresponsive);
    }

    #[tokio::test]
    async fn slow_ping_counts_as_unresponsive() {
        let cluster = FakeCluster::new();
        cluster.set(addr(1), Behavior::Silent);
        let monitor = monitor(&cluster, &[addr(1)]);

        assert_eq!(monitor.probe(addr(1)).await, Health::Unresponsive);
    }

    #[tokio::test]
    async fn probe_loop_brings_workers_online() {
        let cluster = FakeCluster::new();
        cluster.set(addr(1), Behavior::Healthy);
        let monitor = Arc::new(monitor(&cluster, &[addr(1)]));

        let handle = tokio::spawn(Arc::clone(&monitor).run());
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();

        assert_eq!(monitor.alive_endpoints(), vec![addr(1)]);
        assert!(cluster.pings(addr(1)) >= 2);
    }
}
