//! Error types for the balancer.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors surfaced by the balancer.
///
/// Connection-level failures (pump read/write errors, close errors) are not
/// represented here; they are classified and logged at the connection
/// handler and never propagate further.
#[derive(Debug, Error)]
pub enum Error {
    /// The requested group has no member currently available for selection.
    #[error("no available upstream")]
    NoAvailableUpstream,

    /// Every dial attempt to an upstream address failed.
    #[error("all {attempts} dial attempts to {addr} failed: {last}")]
    AllAttemptsFailed {
        addr: SocketAddr,
        attempts: u32,
        #[source]
        last: io::Error,
    },

    /// The authenticated peer identity is not a configured downstream.
    #[error("unknown downstream {0:?}")]
    UnknownDownstream(String),

    /// The downstream requested a group outside its allowed set.
    #[error("downstream {downstream:?} is not authorized for group {group:?}")]
    UnauthorizedGroup { downstream: String, group: String },

    /// The client hello carried no server name to select a group with.
    #[error("client hello carried no server name")]
    MissingServerName,

    /// The peer certificate subject carried no common name.
    #[error("peer certificate carried no common name")]
    MissingPeerIdentity,

    /// The peer certificate could not be parsed.
    #[error("peer certificate could not be parsed: {0}")]
    PeerCertificate(String),

    /// Building the client certificate verifier failed.
    #[error("building client certificate verifier: {0}")]
    ClientVerifier(#[from] rustls::server::VerifierBuilderError),

    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
