//! Active health checking.
//!
//! A periodic ticker probes every registered upstream by dialing it with
//! the shared retry/backoff budget. Health state lives in a map written
//! only by the monitor; availability transitions are pushed into the group
//! trackers on state change. Every upstream starts unhealthy and earns its
//! way into rotation with a first successful probe.
//!
//! Probes run concurrently, one task per upstream per tick, because a
//! single probe may legitimately spend the whole retry budget. The map is
//! snapshotted before dispatch so no probe runs under the lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Config, Upstream};
use crate::proxy::dial::dial_with_backoff;
use crate::proxy::tracker::GroupTracker;

/// Probe-health per upstream. Written only by the health monitor.
#[derive(Debug, Default)]
pub(crate) struct HealthMap {
    upstreams: Mutex<HashMap<Uuid, bool>>,
}

impl HealthMap {
    /// Seed every id as unhealthy.
    pub fn new(ids: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            upstreams: Mutex::new(ids.into_iter().map(|id| (id, false)).collect()),
        }
    }

    pub fn set(&self, id: Uuid, healthy: bool) {
        self.upstreams.lock().expect("health lock").insert(id, healthy);
    }

    /// Copy of the current state, for iterating outside the lock.
    pub fn snapshot(&self) -> Vec<(Uuid, bool)> {
        self.upstreams
            .lock()
            .expect("health lock")
            .iter()
            .map(|(&id, &healthy)| (id, healthy))
            .collect()
    }
}

/// Drives probe ticks and availability transitions for all upstreams.
pub(crate) struct HealthMonitor {
    config: Config,
    upstreams: Arc<HashMap<Uuid, Upstream>>,
    trackers: Arc<HashMap<String, Arc<GroupTracker>>>,
    health: HealthMap,
}

impl HealthMonitor {
    pub fn new(
        config: Config,
        upstreams: Arc<HashMap<Uuid, Upstream>>,
        trackers: Arc<HashMap<String, Arc<GroupTracker>>>,
    ) -> Self {
        let health = HealthMap::new(upstreams.keys().copied());
        Self {
            config,
            upstreams,
            trackers,
            health,
        }
    }

    /// Run probe ticks until the shutdown signal fires.
    ///
    /// In-flight probes also watch the signal, so shutdown is bounded by a
    /// single select rather than a full retry budget.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.health_check_interval);
        // The first tick completes immediately; consume it so probing
        // starts one full interval after startup.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for (id, was_healthy) in self.health.snapshot() {
                        let monitor = Arc::clone(&self);
                        let mut probe_shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            tokio::select! {
                                is_healthy = monitor.probe(id) => {
                                    monitor.apply_transition(id, was_healthy, is_healthy);
                                }
                                _ = probe_shutdown.changed() => {
                                    debug!(upstream_id = %id, "Probe cancelled by shutdown");
                                }
                            }
                        });
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown signalled, ending health checks");
                        return;
                    }
                }
            }
        }
    }

    /// Dial the upstream once (with retries) and close the socket.
    ///
    /// Any dial or close failure reports unhealthy.
    async fn probe(&self, id: Uuid) -> bool {
        let addr = match self.upstreams.get(&id) {
            Some(upstream) => upstream.addr,
            None => return false,
        };
        let mut stream = match dial_with_backoff(addr, &self.config).await {
            Ok(stream) => stream,
            Err(_) => return false,
        };
        if let Err(err) = stream.shutdown().await {
            warn!(upstream_id = %id, error = %err, "Health probe failed to close");
            return false;
        }
        true
    }

    /// Apply one probe result, flipping availability on state change.
    pub(crate) fn apply_transition(&self, id: Uuid, was_healthy: bool, is_healthy: bool) {
        match (was_healthy, is_healthy) {
            (false, false) => {
                debug!(upstream_id = %id, "Upstream still failing health checks");
            }
            (false, true) => {
                self.health.set(id, true);
                if let Some(tracker) = self.tracker_for(id) {
                    tracker.mark_available(id);
                }
                info!(upstream_id = %id, "Upstream passed health check, returned to availability");
            }
            (true, false) => {
                self.health.set(id, false);
                if let Some(tracker) = self.tracker_for(id) {
                    tracker.mark_unavailable(id);
                }
                warn!(upstream_id = %id, "Upstream failed health check, removed from availability");
            }
            (true, true) => {}
        }
    }

    fn tracker_for(&self, id: Uuid) -> Option<&Arc<GroupTracker>> {
        let upstream = self.upstreams.get(&id)?;
        self.trackers.get(&upstream.group)
    }

    #[cfg(test)]
    pub(crate) fn health_snapshot(&self) -> Vec<(Uuid, bool)> {
        self.health.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use super::*;

    fn monitor_with_one_upstream(addr: SocketAddr) -> (Arc<HealthMonitor>, Uuid) {
        let id = Uuid::new_v4();
        let upstream = Upstream::new(id, "api", addr);

        let mut upstreams = HashMap::new();
        upstreams.insert(id, upstream);

        let tracker = Arc::new(GroupTracker::new());
        tracker.add(id);
        let mut trackers = HashMap::new();
        trackers.insert("api".to_string(), tracker);

        let config = Config {
            health_check_interval: Duration::from_millis(50),
            retry_attempts: 1,
            retry_backoff_interval: Duration::from_millis(5),
            retry_backoff_max: Duration::from_millis(10),
        };

        (
            Arc::new(HealthMonitor::new(
                config,
                Arc::new(upstreams),
                Arc::new(trackers),
            )),
            id,
        )
    }

    #[test]
    fn health_map_starts_all_false() {
        let ids = [Uuid::new_v4(), Uuid::new_v4()];
        let map = HealthMap::new(ids);
        for (_, healthy) in map.snapshot() {
            assert!(!healthy);
        }
    }

    #[tokio::test]
    async fn transition_to_healthy_marks_available() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let (monitor, id) = monitor_with_one_upstream(addr);
        let tracker = monitor.trackers.get("api").unwrap();

        monitor.apply_transition(id, false, true);
        assert_eq!(tracker.available_count(), 1);
        assert_eq!(monitor.health_snapshot(), vec![(id, true)]);

        // Repeat success leaves everything as-is.
        monitor.apply_transition(id, true, true);
        assert_eq!(tracker.available_count(), 1);
    }

    #[tokio::test]
    async fn transition_to_unhealthy_removes_from_availability() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let (monitor, id) = monitor_with_one_upstream(addr);
        let tracker = monitor.trackers.get("api").unwrap();

        monitor.apply_transition(id, false, true);
        assert_eq!(tracker.available_count(), 1);

        monitor.apply_transition(id, true, false);
        assert_eq!(tracker.available_count(), 0);
        assert_eq!(monitor.health_snapshot(), vec![(id, false)]);

        // Still failing is a no-op.
        monitor.apply_transition(id, false, false);
        assert_eq!(tracker.available_count(), 0);
    }

    #[tokio::test]
    async fn probe_reflects_backend_liveness() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (monitor, id) = monitor_with_one_upstream(addr);

        assert!(monitor.probe(id).await);

        drop(listener);
        assert!(!monitor.probe(id).await);
    }

    #[tokio::test]
    async fn monitor_loop_promotes_live_backend_and_stops_on_shutdown() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });

        let (monitor, _id) = monitor_with_one_upstream(addr);
        let tracker = Arc::clone(monitor.trackers.get("api").unwrap());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let run = tokio::spawn(Arc::clone(&monitor).run(shutdown_rx));

        // Wait out a few ticks for the first successful probe to land.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while tracker.available_count() == 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(tracker.available_count(), 1);

        shutdown_tx.send(true).unwrap();
        run.await.unwrap();
        accept.abort();
    }
}
