//! Development certificate generation.
//!
//! Writes a certificate authority plus CA-signed client and server
//! certificates as PEM files under `certs/`, then reloads and verifies
//! what it wrote. The client certificate's subject common name is the
//! downstream identity the balancer will see; the server certificate
//! carries the group names downstreams dial by SNI.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SanType,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

const CERT_DIR: &str = "certs";

/// DNS name downstreams use as SNI; doubles as the demo group name.
const SERVER_NAME: &str = "balancer.test";

/// Subject common name for both generated leaves. On the client side this
/// is the downstream identity the balancer derives from the certificate.
const LEAF_COMMON_NAME: &str = "localhost";

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    generate().context("failed to generate certs")?;
    info!(dir = CERT_DIR, "Client and server cert generation succeeded");

    verify().context("failed to verify certs")?;
    info!("Client and server cert verification succeeded");
    Ok(())
}

fn cert_path(name: &str) -> PathBuf {
    Path::new(CERT_DIR).join(name)
}

fn generate() -> Result<()> {
    fs::create_dir_all(CERT_DIR).context("creating certificate directory")?;

    let ca_key = KeyPair::generate()?;
    let mut ca_params = CertificateParams::new(Vec::<String>::new())?;
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "balancer dev ca");
    ca_params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::CrlSign,
    ];
    let ca_cert = ca_params.self_signed(&ca_key)?;

    fs::write(cert_path("ca.pem"), ca_cert.pem()).context("writing ca.pem")?;
    fs::write(cert_path("ca.key"), ca_key.serialize_pem()).context("writing ca.key")?;

    gen_and_save(&ca_cert, &ca_key, LEAF_COMMON_NAME, "client")
        .context("generating client certificate")?;
    gen_and_save(&ca_cert, &ca_key, LEAF_COMMON_NAME, "server")
        .context("generating server certificate")?;
    Ok(())
}

/// Generate one CA-signed leaf and write `<name>.pem` / `<name>.key`.
fn gen_and_save(ca_cert: &Certificate, ca_key: &KeyPair, common_name: &str, name: &str) -> Result<()> {
    let key = KeyPair::generate()?;

    let mut params = CertificateParams::new(vec![
        "localhost".to_string(),
        SERVER_NAME.to_string(),
        format!("*.{SERVER_NAME}"),
    ])?;
    params
        .subject_alt_names
        .push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    params
        .subject_alt_names
        .push(SanType::IpAddress(IpAddr::V6(Ipv6Addr::LOCALHOST)));
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ClientAuth,
        ExtendedKeyUsagePurpose::ServerAuth,
    ];

    let cert = params.signed_by(&key, ca_cert, ca_key)?;

    fs::write(cert_path(&format!("{name}.pem")), cert.pem())?;
    fs::write(cert_path(&format!("{name}.key")), key.serialize_pem())?;
    Ok(())
}

fn verify() -> Result<()> {
    let ca_der = load_first_cert(&cert_path("ca.pem"))?;
    let (_, ca) = X509Certificate::from_der(&ca_der)
        .map_err(|err| anyhow::anyhow!("parsing ca.pem: {err}"))?;

    for name in ["client", "server"] {
        let der = load_first_cert(&cert_path(&format!("{name}.pem")))?;
        let (_, cert) = X509Certificate::from_der(&der)
            .map_err(|err| anyhow::anyhow!("parsing {name}.pem: {err}"))?;

        ensure!(
            cert.issuer() == ca.subject(),
            "{name} certificate was not issued by the generated ca"
        );
        cert.verify_signature(Some(ca.public_key()))
            .map_err(|err| anyhow::anyhow!("{name} certificate signature: {err}"))?;
        ensure!(
            cert.validity().is_valid(),
            "{name} certificate is outside its validity window"
        );
    }
    Ok(())
}

fn load_first_cert(path: &Path) -> Result<Vec<u8>> {
    let pem = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut reader = pem.as_slice();
    let cert = rustls_pemfile::certs(&mut reader)
        .next()
        .with_context(|| format!("no certificate in {}", path.display()))?
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(cert.as_ref().to_vec())
}
