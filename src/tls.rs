//! Mutual-TLS contexts for the sensor↔master link.
//!
//! Both ends load the same kind of material: a combined PEM (certificate
//! chain + private key) and a CA file acting as the trust anchor. The
//! cipher allowlist is pinned; the server always demands a client
//! certificate and derives the sensor identity from its commonName.

use std::path::PathBuf;
use std::pin::Pin;

use openssl::nid::Nid;
use openssl::ssl::{
    Ssl, SslAcceptor, SslConnector, SslContextBuilder, SslFiletype, SslMethod, SslOptions,
    SslVerifyMode, SslVersion,
};
use tokio::net::TcpStream;
use tokio_openssl::SslStream;

use crate::config::{BlacknetConfig, ConfigError};
use crate::types::BLACKNET_CIPHERS;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("openssl: {0}")]
    Ssl(#[from] openssl::error::ErrorStack),

    #[error("tls handshake: {0}")]
    Handshake(String),
}

/// TLS material as configured for one role.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    /// Combined certificate chain + private key (PEM).
    pub cert: PathBuf,
    /// Trust anchor.
    pub cafile: PathBuf,
    /// Enables client-side hostname verification when set.
    pub server_hostname: Option<String>,
}

impl TlsSettings {
    pub fn from_config(config: &BlacknetConfig, role: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            cert: config.get_required(role, "cert")?.into(),
            cafile: config.get_required(role, "cafile")?.into(),
            server_hostname: config.get(role, "server_hostname"),
        })
    }
}

fn apply_common(
    ctx: &mut SslContextBuilder,
    settings: &TlsSettings,
) -> Result<(), openssl::error::ErrorStack> {
    ctx.set_min_proto_version(Some(SslVersion::TLS1_2))?;
    ctx.set_cipher_list(&BLACKNET_CIPHERS.join(":"))?;
    ctx.set_options(SslOptions::SINGLE_ECDH_USE);
    ctx.set_ca_file(&settings.cafile)?;
    ctx.set_certificate_chain_file(&settings.cert)?;
    ctx.set_private_key_file(&settings.cert, SslFiletype::PEM)?;
    ctx.check_private_key()?;
    Ok(())
}

/// Build the sensor-side (outbound) TLS context.
pub fn build_connector(settings: &TlsSettings) -> Result<SslConnector, TlsError> {
    let mut builder = SslConnector::builder(SslMethod::tls_client())?;
    apply_common(&mut builder, settings)?;
    builder.set_verify(SslVerifyMode::PEER);
    Ok(builder.build())
}

/// Build the master-side (inbound) TLS context.
/// The peer certificate is mandatory; it carries the sensor identity.
pub fn build_acceptor(settings: &TlsSettings) -> Result<SslAcceptor, TlsError> {
    let mut builder = SslAcceptor::mozilla_intermediate(SslMethod::tls_server())?;
    apply_common(&mut builder, settings)?;
    builder.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);
    Ok(builder.build())
}

/// Wrap an outbound TCP stream. Hostname checking is performed only when a
/// `server_hostname` is configured.
pub async fn connect(
    connector: &SslConnector,
    settings: &TlsSettings,
    host: &str,
    tcp: TcpStream,
) -> Result<SslStream<TcpStream>, TlsError> {
    let mut config = connector.configure()?;
    let domain = match &settings.server_hostname {
        Some(name) => {
            config.set_verify_hostname(true);
            name.clone()
        }
        None => {
            config.set_verify_hostname(false);
            host.to_owned()
        }
    };

    let ssl = config.into_ssl(&domain)?;
    let mut stream = SslStream::new(ssl, tcp)?;
    Pin::new(&mut stream)
        .connect()
        .await
        .map_err(|e| TlsError::Handshake(e.to_string()))?;
    Ok(stream)
}

/// Wrap an accepted TCP stream server-side.
pub async fn accept(
    acceptor: &SslAcceptor,
    tcp: TcpStream,
) -> Result<SslStream<TcpStream>, TlsError> {
    let ssl = Ssl::new(acceptor.context())?;
    let mut stream = SslStream::new(ssl, tcp)?;
    Pin::new(&mut stream)
        .accept()
        .await
        .map_err(|e| TlsError::Handshake(e.to_string()))?;
    Ok(stream)
}

/// Extract the peer certificate's commonName, the canonical sensor
/// identity. Peers without one read as "unknown".
pub fn peer_common_name(stream: &SslStream<TcpStream>) -> String {
    stream
        .ssl()
        .peer_certificate()
        .and_then(|cert| {
            cert.subject_name()
                .entries_by_nid(Nid::COMMONNAME)
                .next()
                .and_then(|entry| entry.data().as_utf8().ok())
                .map(|name| name.to_string())
        })
        .unwrap_or_else(|| "unknown".to_owned())
}
