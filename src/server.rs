//! TLS-terminating front door.
//!
//! The server accepts TCP connections, terminates TLS with mandatory client
//! certificate verification, and derives the two routing inputs from the
//! handshake: the downstream identity from the peer certificate subject
//! common name, and the requested upstream group from the SNI server name.
//! Authorized connections are handed to the trafficker; everything else is
//! closed without writing any bytes, so an unauthenticated peer learns
//! nothing about the upstream topology.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::CertificateDer;
use rustls::server::WebPkiClientVerifier;
use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, Instrument};
use x509_parser::prelude::FromDer;
use x509_parser::certificate::X509Certificate;

use crate::config::{Config, Downstream, TlsSettings, Upstream};
use crate::error::{Error, Result};
use crate::proxy::Trafficker;

/// mTLS-terminating layer-4 load balancing server.
pub struct Server {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    trafficker: Arc<Trafficker>,
}

impl Server {
    /// Bind the listening socket and prepare TLS termination.
    ///
    /// Client certificates are required and verified against
    /// `tls.roots`.
    pub async fn bind(
        addr: SocketAddr,
        config: Config,
        tls: TlsSettings,
        downstreams: Vec<Downstream>,
        upstreams: Vec<Upstream>,
    ) -> Result<Self> {
        ensure_crypto_provider();

        let verifier = WebPkiClientVerifier::builder(Arc::new(tls.roots)).build()?;
        let server_config = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(tls.cert_chain, tls.key)?;
        let acceptor = TlsAcceptor::from(Arc::new(server_config));

        let listener = TcpListener::bind(addr).await?;
        info!(bind_addr = %listener.local_addr()?, "Balancer bound");

        Ok(Self {
            listener,
            acceptor,
            trafficker: Arc::new(Trafficker::new(config, downstreams, upstreams)),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and steer connections until the shutdown signal fires.
    ///
    /// Accept errors are logged and do not end the loop. Per-connection
    /// failures never reach this loop either; they end that connection
    /// only.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.trafficker.start(shutdown.clone());
        info!("Balancer accepting connections");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(&self);
                            tokio::spawn(
                                async move {
                                    if let Err(err) = server.handle_connection(stream).await {
                                        debug!(error = %err, "Connection rejected");
                                    }
                                }
                                .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                            );
                        }
                        Err(err) => {
                            error!(error = %err, "Accept error");
                            // Avoid a tight loop on persistent accept failures.
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown signalled, closing listener");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Terminate TLS, authenticate, authorize, and hand off one connection.
    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        let tls_stream = self.acceptor.accept(stream).await?;

        let (downstream_id, upstream_group) = {
            let (_, connection) = tls_stream.get_ref();

            let upstream_group = connection
                .server_name()
                .ok_or(Error::MissingServerName)?
                .to_string();

            let peer_certs = connection
                .peer_certificates()
                .ok_or(Error::MissingPeerIdentity)?;
            let leaf = peer_certs.first().ok_or(Error::MissingPeerIdentity)?;
            (subject_common_name(leaf)?, upstream_group)
        };

        authorize(
            self.trafficker.downstream(&downstream_id),
            &downstream_id,
            &upstream_group,
        )?;
        debug!(
            downstream = %downstream_id,
            group = %upstream_group,
            "Downstream authenticated and authorized"
        );

        self.trafficker
            .handle(&downstream_id, &upstream_group, tls_stream)
            .await;
        Ok(())
    }
}

fn ensure_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Check a downstream against its allowed groups.
fn authorize(
    downstream: Option<&Downstream>,
    downstream_id: &str,
    upstream_group: &str,
) -> Result<()> {
    let downstream =
        downstream.ok_or_else(|| Error::UnknownDownstream(downstream_id.to_string()))?;
    if !downstream.allows_group(upstream_group) {
        return Err(Error::UnauthorizedGroup {
            downstream: downstream_id.to_string(),
            group: upstream_group.to_string(),
        });
    }
    Ok(())
}

/// Subject common name of a DER-encoded certificate.
fn subject_common_name(cert: &CertificateDer<'_>) -> Result<String> {
    let (_, parsed) = X509Certificate::from_der(cert.as_ref())
        .map_err(|err| Error::PeerCertificate(err.to_string()))?;
    let common_name = parsed
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_string)
        .ok_or(Error::MissingPeerIdentity);
    common_name
}
