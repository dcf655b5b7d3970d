//! Per-connection steering: admit, select, dial, pump, release.
//!
//! The trafficker owns the group trackers, the admission limiter, and the
//! health monitor. Each accepted connection flows through one call to
//! [`Trafficker::handle`]; every successful admission is paired with
//! exactly one release and every selection with exactly one
//! connection-ended, on every exit path, via drop guards acquired
//! immediately after the corresponding success.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{Config, Downstream, Upstream};
use crate::proxy::dial::dial_with_backoff;
use crate::proxy::health::HealthMonitor;
use crate::proxy::limiter::AdmissionLimiter;
use crate::proxy::pump::{self, PumpOutcome};
use crate::proxy::tracker::GroupTracker;

/// Steers authenticated connections to healthy upstreams.
pub struct Trafficker {
    config: Config,
    /// Downstream descriptors by identity. Read-only after construction.
    downstreams: HashMap<String, Downstream>,
    /// Upstream descriptors by id. Read-only after construction.
    upstreams: Arc<HashMap<Uuid, Upstream>>,
    /// Connection tracking and availability per group. Read-only map;
    /// the trackers themselves are concurrent.
    trackers: Arc<HashMap<String, Arc<GroupTracker>>>,
    limiter: AdmissionLimiter,
    monitor: Arc<HealthMonitor>,
}

impl Trafficker {
    /// Build a trafficker over fixed upstream and downstream sets.
    ///
    /// Every upstream starts unavailable until its first successful health
    /// probe.
    pub fn new(config: Config, downstreams: Vec<Downstream>, upstreams: Vec<Upstream>) -> Self {
        let mut trackers: HashMap<String, Arc<GroupTracker>> = HashMap::new();
        let mut upstream_map = HashMap::with_capacity(upstreams.len());
        for upstream in upstreams {
            let tracker = trackers
                .entry(upstream.group.clone())
                .or_insert_with(|| Arc::new(GroupTracker::new()));
            tracker.add(upstream.id);
            upstream_map.insert(upstream.id, upstream);
        }
        let upstreams = Arc::new(upstream_map);
        let trackers = Arc::new(trackers);

        let monitor = Arc::new(HealthMonitor::new(
            config.clone(),
            Arc::clone(&upstreams),
            Arc::clone(&trackers),
        ));

        Self {
            config,
            downstreams: downstreams
                .into_iter()
                .map(|down| (down.id.clone(), down))
                .collect(),
            upstreams,
            trackers,
            limiter: AdmissionLimiter::new(),
            monitor,
        }
    }

    /// Start the health-check loop. It runs until `shutdown` fires.
    pub fn start(&self, shutdown: watch::Receiver<bool>) {
        tokio::spawn(Arc::clone(&self.monitor).run(shutdown));
    }

    /// Steer one authenticated connection.
    ///
    /// Ownership of the socket transfers here; it is closed on every path.
    /// Rate-limited and group-exhausted downstreams are closed without any
    /// diagnostic bytes.
    pub async fn handle<S>(&self, downstream_id: &str, upstream_group: &str, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let cap = self.downstream_conn_limit(downstream_id);
        if !self.limiter.try_admit(downstream_id, cap) {
            info!(downstream = %downstream_id, cap, "Rate limiting downstream");
            close_downstream(downstream_id, stream).await;
            return;
        }
        let _release = ReleaseGuard {
            limiter: &self.limiter,
            downstream_id,
        };

        let Some(tracker) = self.trackers.get(upstream_group) else {
            warn!(
                downstream = %downstream_id,
                group = %upstream_group,
                "Requested group has no registered upstreams"
            );
            close_downstream(downstream_id, stream).await;
            return;
        };

        let upstream_id = match tracker.select_next() {
            Ok(id) => id,
            Err(err) => {
                info!(
                    downstream = %downstream_id,
                    group = %upstream_group,
                    error = %err,
                    "No available upstream"
                );
                close_downstream(downstream_id, stream).await;
                return;
            }
        };
        let _ended = ConnectionEndedGuard {
            tracker: tracker.as_ref(),
            upstream_id,
        };

        let Some(upstream) = self.upstreams.get(&upstream_id) else {
            error!(upstream_id = %upstream_id, "Selected upstream has no descriptor");
            close_downstream(downstream_id, stream).await;
            return;
        };

        let upstream_conn = match dial_with_backoff(upstream.addr, &self.config).await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(
                    downstream = %downstream_id,
                    upstream_id = %upstream_id,
                    error = %err,
                    "Failed to connect downstream with chosen upstream"
                );
                close_downstream(downstream_id, stream).await;

                // An upstream that refused a dial while supposedly healthy
                // is demoted now rather than waiting out the next tick.
                tracker.mark_unavailable(upstream_id);
                warn!(upstream_id = %upstream_id, "Upstream failed to connect, removed from availability");
                return;
            }
        };

        let outcome = pump::bidirectional(stream, upstream_conn).await;
        log_pump_outcome(downstream_id, upstream_id, &outcome);

        // Guards record the connection ending, selection first.
    }

    fn downstream_conn_limit(&self, downstream_id: &str) -> u32 {
        self.downstreams
            .get(downstream_id)
            .map(|down| down.max_connections)
            .unwrap_or(0)
    }

    /// Downstream descriptor lookup for the authorization gate.
    pub fn downstream(&self, downstream_id: &str) -> Option<&Downstream> {
        self.downstreams.get(downstream_id)
    }
}

/// Pairs a successful admission with its release.
struct ReleaseGuard<'a> {
    limiter: &'a AdmissionLimiter,
    downstream_id: &'a str,
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        self.limiter.release(self.downstream_id);
    }
}

/// Pairs a successful selection with its connection-ended.
struct ConnectionEndedGuard<'a> {
    tracker: &'a GroupTracker,
    upstream_id: Uuid,
}

impl Drop for ConnectionEndedGuard<'_> {
    fn drop(&mut self) {
        self.tracker.connection_ended(self.upstream_id);
    }
}

async fn close_downstream<S>(downstream_id: &str, mut stream: S)
where
    S: AsyncWrite + Unpin,
{
    if let Err(err) = stream.shutdown().await {
        if !pump::is_benign_close(&err) {
            debug!(downstream = %downstream_id, error = %err, "Error closing downstream");
        }
    }
}

/// Classify the four pump outcomes for the log.
///
/// Close errors from an endpoint that was already closed are the normal end
/// of a proxied pair and are not reported.
fn log_pump_outcome(downstream_id: &str, upstream_id: Uuid, outcome: &PumpOutcome) {
    let to_up = &outcome.to_upstream;
    let to_down = &outcome.to_downstream;

    match (&to_up.data_error, &to_down.data_error) {
        (Some(up_err), Some(down_err)) => {
            warn!(
                downstream = %downstream_id,
                upstream_id = %upstream_id,
                to_upstream_error = %up_err,
                to_downstream_error = %down_err,
                "Errors while proxying both directions"
            );
        }
        (Some(up_err), None) => {
            warn!(
                downstream = %downstream_id,
                upstream_id = %upstream_id,
                error = %up_err,
                "Error while proxying to upstream"
            );
        }
        (None, Some(down_err)) => {
            warn!(
                downstream = %downstream_id,
                upstream_id = %upstream_id,
                error = %down_err,
                "Error while proxying to downstream"
            );
        }
        (None, None) => {
            let up_close = to_up
                .close_error
                .as_ref()
                .filter(|err| !pump::is_benign_close(err));
            let down_close = to_down
                .close_error
                .as_ref()
                .filter(|err| !pump::is_benign_close(err));

            if let Some(err) = up_close {
                warn!(
                    downstream = %downstream_id,
                    upstream_id = %upstream_id,
                    error = %err,
                    "Error while closing upstream"
                );
            }
            if let Some(err) = down_close {
                warn!(
                    downstream = %downstream_id,
                    upstream_id = %upstream_id,
                    error = %err,
                    "Error while closing downstream"
                );
            }
            if up_close.is_none() && down_close.is_none() {
                debug!(
                    downstream = %downstream_id,
                    upstream_id = %upstream_id,
                    "Proxied pair finished cleanly"
                );
            }
        }
    }
}
