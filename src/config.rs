//! Balancer configuration and the static upstream/downstream descriptors.
//!
//! Upstreams and downstreams are value records created at startup and never
//! mutated; the balancer needs only their data, not behavior.

use std::net::SocketAddr;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::RootCertStore;
use uuid::Uuid;

/// Default period between health-check ticks.
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(15);

/// Default maximum dial attempts per dial call.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 5;

/// Default base backoff after a failed dial.
pub const DEFAULT_RETRY_BACKOFF_INTERVAL: Duration = Duration::from_secs(5);

/// Default cap on backoff duration.
pub const DEFAULT_RETRY_BACKOFF_MAX: Duration = Duration::from_secs(5 * 60);

/// Tunables for the connection-steering engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Period between health-check ticks.
    pub health_check_interval: Duration,

    /// Maximum TCP dial attempts per dial call.
    pub retry_attempts: u32,

    /// Base backoff slept after a failed dial attempt.
    pub retry_backoff_interval: Duration,

    /// Cap on the exponential backoff duration.
    pub retry_backoff_max: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_backoff_interval: DEFAULT_RETRY_BACKOFF_INTERVAL,
            retry_backoff_max: DEFAULT_RETRY_BACKOFF_MAX,
        }
    }
}

/// A backend server to which traffic is forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    /// Opaque identifier, unique across all groups.
    pub id: Uuid,
    /// Name of the group this upstream serves.
    pub group: String,
    /// Address dialed for proxied connections and health probes.
    pub addr: SocketAddr,
}

impl Upstream {
    pub fn new(id: Uuid, group: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            id,
            group: group.into(),
            addr,
        }
    }
}

/// An authenticated client of the balancer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Downstream {
    /// Identity string, taken from the peer certificate subject common name.
    pub id: String,
    /// Groups this downstream may open connections to.
    pub allowed_groups: Vec<String>,
    /// Maximum concurrent connections admitted for this downstream.
    pub max_connections: u32,
}

impl Downstream {
    pub fn new(
        id: impl Into<String>,
        allowed_groups: Vec<String>,
        max_connections: u32,
    ) -> Self {
        Self {
            id: id.into(),
            allowed_groups,
            max_connections,
        }
    }

    /// Whether this downstream may connect to `group`.
    pub fn allows_group(&self, group: &str) -> bool {
        self.allowed_groups.iter().any(|g| g == group)
    }
}

/// Certificate material for terminating TLS and verifying client
/// certificates.
pub struct TlsSettings {
    /// Roots trusted to have issued downstream client certificates.
    pub roots: RootCertStore,
    /// Certificate chain presented to downstreams.
    pub cert_chain: Vec<CertificateDer<'static>>,
    /// Private key for the presented certificate.
    pub key: PrivateKeyDer<'static>,
}
