//! mTLS-terminating layer-4 TCP load balancer.
//!
//! Authenticated downstreams open TLS connections; the balancer picks a
//! healthy upstream from the group named by the SNI server name, splices
//! bytes both ways until either side closes, and keeps per-downstream
//! connection counts under their caps. Selection is strict
//! least-connections within a group; availability is driven by an active
//! health-check loop.
//!
//! The [`Server`] owns the full front door (TLS termination, peer identity,
//! authorization). Embedders that terminate TLS themselves can drive the
//! steering engine directly through [`Trafficker`].

pub mod config;
pub mod error;
pub mod proxy;
pub mod server;

pub use config::{Config, Downstream, TlsSettings, Upstream};
pub use error::Error;
pub use proxy::{AdmissionLimiter, GroupTracker, Trafficker};
pub use server::Server;
