//! The SSH trap.
//!
//! A protocol-correct SSH server that never authenticates anyone. Every
//! password and public key offer is harvested into a payload and handed to
//! the outbound client; the attacker only ever sees a rejection. The
//! session keeps the dialogue going long enough to collect an entire
//! credential list, then cuts the line.

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;

use russh::server::{Auth, Config as SshConfig, Handler};
use russh::MethodSet;
use russh_keys::key::{KeyPair, PublicKey};
use russh_keys::PublicKeyBase64;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, info};

use crate::client::SensorClient;
use crate::types::{ensure_utf8, now, BLACKNET_SSH_AUTH_RETRIES, BLACKNET_SSH_CLIENT_TIMEOUT};
use crate::wire::{CredentialPayload, PublickeyPayload};

#[derive(Debug, thiserror::Error)]
pub enum SshTrapError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("key error: {0}")]
    Key(#[from] russh_keys::Error),

    #[error("host key generation failed")]
    KeyGeneration,
}

// =============================================================================
// HOST KEY
// =============================================================================

/// The persistent host key presented to attackers.
pub struct HostKey {
    pub keypair: KeyPair,
    /// Hex SHA-256 over the public key blob, logged at boot.
    pub fingerprint: String,
}

/// Load the host key, generating and persisting a fresh one when the
/// configured file does not exist. The public half lives next to it with a
/// `.pub` suffix.
pub fn load_host_key(path: &Path) -> Result<HostKey, SshTrapError> {
    let keypair = if path.exists() {
        russh_keys::load_secret_key(path, None)?
    } else {
        info!("generating {}", path.display());
        let keypair = KeyPair::generate_ed25519().ok_or(SshTrapError::KeyGeneration)?;
        let file = std::fs::File::create(path)?;
        russh_keys::encode_pkcs8_pem(&keypair, file)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(path)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(path, perms)?;
        }
        keypair
    };

    let public = keypair.clone_public_key()?;
    let pubfile = PathBuf::from(format!("{}.pub", path.display()));
    if !pubfile.exists() {
        info!("generating {}", pubfile.display());
        std::fs::write(
            &pubfile,
            format!("{} {}\n", public.name(), public.public_key_base64()),
        )?;
    }

    let fingerprint = hex::encode(Sha256::digest(public.public_key_bytes()));
    Ok(HostKey { keypair, fingerprint })
}

/// Build the server configuration for trap sessions.
///
/// Rejections carry no artificial delay: fast retries are the point, one
/// TCP session should yield as many attempts as the attacker will offer.
pub fn trap_config(banner: &str, host_key: KeyPair) -> SshConfig {
    SshConfig {
        server_id: russh::SshId::Standard(banner.to_owned()),
        methods: MethodSet::PUBLICKEY | MethodSet::PASSWORD,
        keys: vec![host_key],
        auth_rejection_time: Duration::from_millis(0),
        auth_rejection_time_initial: Some(Duration::from_millis(0)),
        ..Default::default()
    }
}

// =============================================================================
// KEY METRICS
// =============================================================================

/// Bit length of an offered public key, derived from its wire blob.
fn pubkey_bits(name: &str, blob: &[u8]) -> u64 {
    match name {
        "ssh-ed25519" => 256,
        "ecdsa-sha2-nistp256" => 256,
        "ecdsa-sha2-nistp384" => 384,
        "ecdsa-sha2-nistp521" => 521,
        "ssh-rsa" | "rsa-sha2-256" | "rsa-sha2-512" => rsa_modulus_bits(blob).unwrap_or(0),
        _ => 0,
    }
}

/// RSA blob layout: string algo, mpint e, mpint n. The modulus size is the
/// advertised key size.
fn rsa_modulus_bits(blob: &[u8]) -> Option<u64> {
    fn take<'a>(blob: &'a [u8], off: &mut usize) -> Option<&'a [u8]> {
        let len_bytes = blob.get(*off..*off + 4)?;
        let len = u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]);
        let start = *off + 4;
        let end = start.checked_add(len as usize)?;
        let field = blob.get(start..end)?;
        *off = end;
        Some(field)
    }

    let mut off = 0;
    take(blob, &mut off)?; // algorithm name
    take(blob, &mut off)?; // public exponent
    let modulus = take(blob, &mut off)?;

    let stripped: &[u8] = match modulus.iter().position(|&b| b != 0) {
        Some(pos) => &modulus[pos..],
        None => return Some(0),
    };
    let first = stripped.first()?;
    Some((stripped.len() as u64 - 1) * 8 + (8 - u64::from(first.leading_zeros())))
}

// =============================================================================
// BANNER CAPTURE
// =============================================================================

/// Transparent stream wrapper recording the remote version-exchange line.
///
/// The first line the client sends is its `SSH-2.0-...` identification;
/// the SSH library consumes it internally, so it is captured here on the
/// way through. Bounded at 255 bytes, the protocol line limit.
pub struct VersionCapture<S> {
    inner: S,
    banner: Arc<OnceLock<String>>,
    partial: Vec<u8>,
    done: bool,
}

impl<S> VersionCapture<S> {
    pub fn new(inner: S, banner: Arc<OnceLock<String>>) -> Self {
        Self {
            inner,
            banner,
            partial: Vec::new(),
            done: false,
        }
    }

    fn finish(&mut self) {
        self.done = true;
        let line = ensure_utf8(&self.partial);
        let _ = self.banner.set(line.trim_end_matches('\r').to_owned());
        self.partial = Vec::new();
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for VersionCapture<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);

        if let Poll::Ready(Ok(())) = &result {
            if !this.done {
                for &byte in &buf.filled()[before..] {
                    if byte == b'\n' {
                        this.finish();
                        break;
                    }
                    this.partial.push(byte);
                    if this.partial.len() >= 255 {
                        this.finish();
                        break;
                    }
                }
            }
        }
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for VersionCapture<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

// =============================================================================
// TRAP SESSION
// =============================================================================

/// Per-connection handler collecting authentication attempts.
struct TrapSession {
    client: Arc<SensorClient>,
    peer_ip: String,
    remote_version: Arc<OnceLock<String>>,
    failures: Arc<AtomicU32>,
    failure_limit: u32,
    publickey_allowed: bool,
}

impl TrapSession {
    fn credential(&self, user: &str) -> CredentialPayload {
        CredentialPayload {
            client: self.peer_ip.clone(),
            version: self
                .remote_version
                .get()
                .cloned()
                .unwrap_or_default(),
            user: ensure_utf8(user.as_bytes()),
            passwd: None,
            time: now(),
        }
    }

    fn pubkey_payload(&self, user: &str, public_key: &PublicKey) -> PublickeyPayload {
        let common = self.credential(user);
        let blob = public_key.public_key_bytes();
        PublickeyPayload {
            client: common.client,
            version: common.version,
            user: common.user,
            time: common.time,
            k64: public_key.public_key_base64(),
            ksize: pubkey_bits(public_key.name(), &blob),
            kfp: hex::encode(Sha256::digest(&blob)),
            ktype: public_key.name().to_owned(),
        }
    }

    /// Record an offered key and degrade the dialogue to password so the
    /// attacker falls through to credentials. Best-effort: a second key
    /// already in flight may still arrive.
    async fn harvest_pubkey(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth, russh::Error> {
        let payload = self.pubkey_payload(user, public_key);
        self.client.send_ssh_publickey(payload).await;
        self.publickey_allowed = false;
        self.auth_failed()
    }

    /// Account one failed attempt. Once the counter reaches the limit the
    /// transport is cut so one attacker cannot hold a worker forever; the
    /// attempt that trips it has already been harvested.
    fn auth_failed(&mut self) -> Result<Auth, russh::Error> {
        let failed = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failed >= self.failure_limit {
            return Err(russh::Error::Disconnect);
        }

        let methods = if self.publickey_allowed {
            MethodSet::PUBLICKEY | MethodSet::PASSWORD
        } else {
            MethodSet::PASSWORD
        };
        Ok(Auth::Reject {
            proceed_with_methods: Some(methods),
        })
    }
}

#[async_trait::async_trait]
impl Handler for TrapSession {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let mut payload = self.credential(user);
        payload.passwd = Some(ensure_utf8(password.as_bytes()));
        self.client.send_ssh_credential(payload).await;
        self.auth_failed()
    }

    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        self.harvest_pubkey(user, public_key).await
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        // Reached directly when a client skips the offer probe and sends a
        // signed request straight away; harvest it the same way.
        if self.publickey_allowed {
            return self.harvest_pubkey(user, public_key).await;
        }
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::PASSWORD),
        })
    }
}

/// Drive one attacker connection to completion.
///
/// The session ends when the attacker leaves, the failure limit trips, or
/// the hard wall-clock deadline forces a teardown.
pub async fn run_trap_session<S>(
    config: Arc<SshConfig>,
    client: Arc<SensorClient>,
    stream: S,
    peer_ip: String,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    debug!("{}: SSH: starting session", peer_ip);

    let banner = Arc::new(OnceLock::new());
    let failures = Arc::new(AtomicU32::new(0));
    let session = TrapSession {
        client,
        peer_ip: peer_ip.clone(),
        remote_version: banner.clone(),
        failures: failures.clone(),
        failure_limit: BLACKNET_SSH_AUTH_RETRIES,
        publickey_allowed: true,
    };

    let wrapped = VersionCapture::new(stream, banner);
    let dialogue = async {
        match russh::server::run_stream(config, wrapped, session).await {
            Ok(running) => {
                if let Err(e) = running.await {
                    debug!("{}: SSH: {}", peer_ip, e);
                }
            }
            Err(e) => debug!("{}: SSH: {}", peer_ip, e),
        }
    };

    let deadline = Duration::from_secs(BLACKNET_SSH_CLIENT_TIMEOUT);
    if tokio::time::timeout(deadline, dialogue).await.is_err() {
        debug!("{}: SSH: session deadline reached, tearing down", peer_ip);
    }
    debug!(
        "{}: SSH: stopping session ({} failed retries)",
        peer_ip,
        failures.load(Ordering::Relaxed)
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn ssh_string(field: &[u8]) -> Vec<u8> {
        let mut out = (field.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(field);
        out
    }

    #[test]
    fn test_rsa_modulus_bits() {
        // 2048-bit modulus: leading zero byte then 256 bytes with the top
        // bit set.
        let mut modulus = vec![0x00, 0x80];
        modulus.extend(vec![0x01; 255]);

        let mut blob = ssh_string(b"ssh-rsa");
        blob.extend(ssh_string(&[0x01, 0x00, 0x01]));
        blob.extend(ssh_string(&modulus));

        assert_eq!(pubkey_bits("ssh-rsa", &blob), 2048);
        assert_eq!(pubkey_bits("ssh-ed25519", &[]), 256);
        assert_eq!(pubkey_bits("unknown-type", &[]), 0);
    }

    #[test]
    fn test_rsa_modulus_bits_truncated_blob() {
        assert_eq!(rsa_modulus_bits(&[0, 0, 0]), None);
        assert_eq!(rsa_modulus_bits(&ssh_string(b"ssh-rsa")), None);
    }

    #[tokio::test]
    async fn test_version_capture() {
        let (client, server) = tokio::io::duplex(256);
        let banner = Arc::new(OnceLock::new());
        let mut capture = VersionCapture::new(server, banner.clone());

        let mut client = client;
        client.write_all(b"SSH-2.0-OpenSSH_9.6\r\nmore-data").await.unwrap();

        let mut buf = [0u8; 64];
        let mut read = 0;
        while banner.get().is_none() && read < 64 {
            let n = tokio::io::AsyncReadExt::read(&mut capture, &mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            read += n;
        }
        assert_eq!(banner.get().map(String::as_str), Some("SSH-2.0-OpenSSH_9.6"));
    }

    #[tokio::test]
    async fn test_version_capture_bounded() {
        let (client, server) = tokio::io::duplex(1024);
        let banner = Arc::new(OnceLock::new());
        let mut capture = VersionCapture::new(server, banner.clone());

        let mut client = client;
        client.write_all(&[b'A'; 600]).await.unwrap();

        let mut buf = [0u8; 1024];
        let _ = tokio::io::AsyncReadExt::read(&mut capture, &mut buf).await.unwrap();
        let captured = banner.get().expect("banner capped");
        assert_eq!(captured.len(), 255);
    }

    #[test]
    fn test_host_key_generation() {
        let dir = std::env::temp_dir().join(format!("blacknet_ssh_{}", std::process::id()));
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join("ssh_host_key");
        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(format!("{}.pub", path.display()));

        let generated = load_host_key(&path).unwrap();
        assert!(path.exists());
        assert!(PathBuf::from(format!("{}.pub", path.display())).exists());
        assert_eq!(generated.fingerprint.len(), 64);

        // A second load reuses the persisted key.
        let loaded = load_host_key(&path).unwrap();
        assert_eq!(loaded.fingerprint, generated.fingerprint);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
