//! Outbound link from a sensor to the master.
//!
//! One process-wide client holds at most one connection. Everything that
//! touches the link (connects, sends, the ping probe, the goodbye drain)
//! serializes through a single connection-state mutex, which is what makes
//! the retry bookkeeping safe without a lock-ordering rule.
//!
//! Delivery is best-effort: bounded connect retries, bounded send retries,
//! then the event is dropped and the sensor keeps trapping.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use openssl::ssl::SslConnector;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::Mutex;
use tokio_openssl::SslStream;
use tracing::{debug, error, info};

use crate::config::{BlacknetConfig, ConfigError};
use crate::tls::{self, TlsError, TlsSettings};
use crate::types::{
    MsgType, BLACKNET_CLIENT_CONN_RETRIES, BLACKNET_CLIENT_GOODBYE_TIMEOUT,
    BLACKNET_CLIENT_PING_TIMEOUT, BLACKNET_HELLO, BLACKNET_SSL_DEFAULT_ADDRESS,
    BLACKNET_SSL_DEFAULT_PORT,
};
use crate::wire::{CredentialPayload, Message, PublickeyPayload, Unpacker, WireError};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Where the master lives. Paths get a raw UNIX stream (no TLS).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAddress {
    Tcp(String, u16),
    Unix(PathBuf),
}

impl ServerAddress {
    fn from_config(config: &BlacknetConfig) -> Self {
        let server = config
            .get("honeypot", "server")
            .unwrap_or_else(|| {
                format!("{}:{}", BLACKNET_SSL_DEFAULT_ADDRESS, BLACKNET_SSL_DEFAULT_PORT)
            });
        let server = server.trim().to_owned();

        if server.starts_with('/') {
            return ServerAddress::Unix(PathBuf::from(server));
        }
        match server.split_once(':') {
            Some((host, port)) => match port.parse() {
                Ok(port) => ServerAddress::Tcp(host.to_owned(), port),
                Err(e) => {
                    error!("address port: {}", e);
                    ServerAddress::Tcp(host.to_owned(), BLACKNET_SSL_DEFAULT_PORT)
                }
            },
            None => ServerAddress::Tcp(server, BLACKNET_SSL_DEFAULT_PORT),
        }
    }

    pub fn is_sockfile(&self) -> bool {
        matches!(self, ServerAddress::Unix(_))
    }
}

enum ServerStream {
    Tls(Box<SslStream<TcpStream>>),
    Unix(UnixStream),
}

impl ServerStream {
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            ServerStream::Tls(stream) => stream.write_all(buf).await,
            ServerStream::Unix(stream) => stream.write_all(buf).await,
        }
    }

    async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ServerStream::Tls(stream) => stream.read(buf).await,
            ServerStream::Unix(stream) => stream.read(buf).await,
        }
    }

    async fn close(&mut self) {
        let _ = match self {
            ServerStream::Tls(stream) => stream.shutdown().await,
            ServerStream::Unix(stream) => stream.shutdown().await,
        };
    }
}

struct LinkState {
    address: ServerAddress,
    client_name: Option<String>,
    tls_settings: Option<TlsSettings>,
    connector: Option<SslConnector>,
    stream: Option<ServerStream>,
    /// Set after a failed connect so retry storms log only once.
    server_error: bool,
    unpacker: Unpacker,
}

impl LinkState {
    fn from_config(config: &BlacknetConfig) -> Self {
        Self {
            address: ServerAddress::from_config(config),
            client_name: config.get("honeypot", "name"),
            tls_settings: TlsSettings::from_config(config, "honeypot").ok(),
            connector: None,
            stream: None,
            server_error: false,
            unpacker: Unpacker::new(),
        }
    }
}

/// Holds all the protocol exchanges with the master.
pub struct SensorClient {
    state: Mutex<LinkState>,
}

impl SensorClient {
    pub fn new(config: &BlacknetConfig) -> Self {
        Self {
            state: Mutex::new(LinkState::from_config(config)),
        }
    }

    /// Whether the master is reached over a UNIX socket file.
    pub async fn server_is_sockfile(&self) -> bool {
        self.state.lock().await.address.is_sockfile()
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.stream.is_some()
    }

    /// Re-read the master address; a change forces a reconnect on the next
    /// send.
    pub async fn reload(&self, config: &BlacknetConfig) {
        let mut state = self.state.lock().await;
        let fresh = LinkState::from_config(config);

        let address_changed = fresh.address != state.address;
        state.client_name = fresh.client_name;
        state.tls_settings = fresh.tls_settings;
        state.connector = None;

        if address_changed {
            state.address = fresh.address;
            Self::disconnect_locked(&mut state, true).await;
        }
    }

    pub async fn send_ssh_credential(&self, payload: CredentialPayload) {
        self.send_retry(Message::SshCredential(payload)).await;
    }

    pub async fn send_ssh_publickey(&self, payload: PublickeyPayload) {
        self.send_retry(Message::SshPublickey(payload)).await;
    }

    /// Send a keep-alive probe and wait briefly for the pong. No pong means
    /// the link is half-open: drop it without a goodbye so the next send
    /// reconnects.
    pub async fn send_ping(&self) {
        let mut state = self.state.lock().await;
        let mut answered = false;

        let probe = async {
            Self::ensure_connected(&mut state).await?;
            Self::write_frame(&mut state, &Message::Ping.encode()?).await?;

            let deadline = Duration::from_secs(BLACKNET_CLIENT_PING_TIMEOUT);
            if let Some(code) = Self::read_reply(&mut state, deadline).await? {
                if code == MsgType::Pong.code() {
                    debug!("client received pong acknowledgement");
                    return Ok::<bool, ClientError>(true);
                }
            }
            info!("client did not receive pong from server, disconnecting");
            Ok(false)
        };

        match probe.await {
            Ok(ok) => answered = ok,
            Err(e) => error!("pong error: {}", e),
        }
        if !answered {
            Self::disconnect_locked(&mut state, false).await;
        }
    }

    /// Tear the link down. `goodbye` performs the GOODBYE exchange first.
    pub async fn disconnect(&self, goodbye: bool) {
        let mut state = self.state.lock().await;
        Self::disconnect_locked(&mut state, goodbye).await;
    }

    // =========================================================================
    // INTERNALS (all under the connection-state lock)
    // =========================================================================

    async fn ensure_connected(state: &mut LinkState) -> Result<(), ClientError> {
        if state.stream.is_some() {
            return Ok(());
        }

        let mut tries = BLACKNET_CLIENT_CONN_RETRIES;
        let stream = loop {
            match Self::connect_once(state).await {
                Ok(stream) => break stream,
                Err(e) => {
                    // First failure logs; retry storms stay quiet until the
                    // link comes back.
                    if tries == BLACKNET_CLIENT_CONN_RETRIES && !state.server_error {
                        error!("socket error: {}", e);
                    }
                    tries -= 1;
                    if tries == 0 {
                        state.server_error = true;
                        return Err(e);
                    }
                }
            }
        };

        if state.server_error {
            info!("client reconnected successfully");
        } else {
            info!("client connected successfully");
        }
        state.server_error = false;
        state.stream = Some(stream);
        state.unpacker = Unpacker::new();

        // Handshake: HELLO, then the advisory name when configured.
        Self::write_frame(state, &Message::Hello(BLACKNET_HELLO.to_owned()).encode()?).await?;
        if let Some(name) = state.client_name.clone() {
            Self::write_frame(state, &Message::ClientName(name).encode()?).await?;
        }
        Ok(())
    }

    async fn connect_once(state: &mut LinkState) -> Result<ServerStream, ClientError> {
        match state.address.clone() {
            ServerAddress::Unix(path) => {
                let stream = UnixStream::connect(&path).await?;
                Ok(ServerStream::Unix(stream))
            }
            ServerAddress::Tcp(host, port) => {
                let tcp = TcpStream::connect((host.as_str(), port)).await?;

                // Keep-alive closes half-open links the pings cannot see.
                let keepalive = socket2::TcpKeepalive::new()
                    .with_time(Duration::from_secs(15))
                    .with_interval(Duration::from_secs(30))
                    .with_retries(BLACKNET_CLIENT_CONN_RETRIES);
                socket2::SockRef::from(&tcp).set_tcp_keepalive(&keepalive)?;

                let settings = state.tls_settings.clone().ok_or(ConfigError::Missing {
                    role: "honeypot".into(),
                    key: "cert".into(),
                })?;
                if state.connector.is_none() {
                    state.connector = Some(tls::build_connector(&settings)?);
                }
                let connector = state.connector.as_ref().ok_or(ConfigError::Missing {
                    role: "honeypot".into(),
                    key: "cert".into(),
                })?;
                let stream = tls::connect(connector, &settings, &host, tcp).await?;
                Ok(ServerStream::Tls(Box::new(stream)))
            }
        }
    }

    async fn write_frame(state: &mut LinkState, frame: &[u8]) -> Result<(), ClientError> {
        match state.stream.as_mut() {
            Some(stream) => {
                stream.write_all(frame).await?;
                Ok(())
            }
            None => Err(ClientError::Io(io::ErrorKind::NotConnected.into())),
        }
    }

    /// One read with a deadline, returning the first decoded opcode.
    async fn read_reply(
        state: &mut LinkState,
        deadline: Duration,
    ) -> Result<Option<u64>, ClientError> {
        let stream = match state.stream.as_mut() {
            Some(stream) => stream,
            None => return Ok(None),
        };

        let mut buf = [0u8; 4096];
        let n = match tokio::time::timeout(deadline, stream.read_chunk(&mut buf)).await {
            Ok(read) => read?,
            Err(_) => return Ok(None),
        };
        if n == 0 {
            return Ok(None);
        }

        state.unpacker.feed(&buf[..n]);
        match state.unpacker.next_frame()? {
            Some((code, _)) => Ok(Some(code)),
            None => Ok(None),
        }
    }

    async fn send_retry(&self, msg: Message) {
        let frame = match msg.encode() {
            Ok(frame) => frame,
            Err(e) => {
                error!("encode error: {}", e);
                return;
            }
        };

        let mut tries = 2;
        while tries > 0 {
            let mut state = self.state.lock().await;
            let sent = match Self::ensure_connected(&mut state).await {
                Ok(()) => Self::write_frame(&mut state, &frame).await,
                Err(e) => Err(e),
            };
            match sent {
                Ok(()) => return,
                Err(e) => {
                    debug!("send error: {}", e);
                    Self::disconnect_locked(&mut state, false).await;
                    tries -= 1;
                }
            }
        }
        // Out of retries: the event is dropped, the sensor carries on.
    }

    async fn disconnect_locked(state: &mut LinkState, goodbye: bool) {
        if state.stream.is_none() {
            return;
        }

        if goodbye {
            let exchange = async {
                Self::write_frame(state, &Message::Goodbye.encode()?).await?;
                let deadline = Duration::from_secs(BLACKNET_CLIENT_GOODBYE_TIMEOUT);
                match Self::read_reply(state, deadline).await? {
                    Some(code) if code == MsgType::Goodbye.code() => {
                        debug!("client received goodbye acknowledgement");
                    }
                    _ => info!("client did not receive goodbye from server, quitting"),
                }
                Ok::<(), ClientError>(())
            };
            if let Err(e) = exchange.await {
                error!("goodbye error: {}", e);
            }
        }

        if let Some(mut stream) = state.stream.take() {
            stream.close().await;
        }
    }
}
