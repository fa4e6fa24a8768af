//! The master: terminates TLS from every sensor and persists what they saw.
//!
//! One worker task per inbound connection. A worker owns its stream, its
//! database connection and its caches; nothing is shared across workers
//! except the read-mostly blacklist and the database settings channel used
//! to propagate reloads.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use openssl::ssl::SslAcceptor;
use rmpv::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_openssl::SslStream;
use tracing::{debug, error, info, warn};

use crate::acceptor::{Accepted, Acceptor, Endpoint, SocketPermissions};
use crate::config::{Blacklist, BlacknetConfig, ConfigError};
use crate::db::{Database, DatabaseSettings};
use crate::tls::{self, TlsError, TlsSettings};
use crate::types::{
    ipv4_to_u32, reverse_dns, MsgType, BLACKNET_DATABASE_RETRIES,
    BLACKNET_DEFAULT_LOCID, BLACKNET_DEFAULT_SESSION_INTERVAL, BLACKNET_HELLO,
    BLACKNET_SSL_DEFAULT_ADDRESS, BLACKNET_SSL_DEFAULT_PORT,
};
use crate::wire::{CredentialPayload, Message, PublickeyPayload, Unpacker};

/// Accept window; also the cadence of finished-worker reaping.
const MASTER_SERVE_TIMEOUT: Duration = Duration::from_secs(60);

/// IP recorded for every attempt when test mode is active.
const TEST_MODE_CLIENT: &str = "1.0.204.42";

#[derive(Debug, thiserror::Error)]
pub enum MasterError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

// =============================================================================
// SERVER
// =============================================================================

pub struct Master {
    config: BlacknetConfig,
    acceptor: Acceptor,
    tls: Option<Arc<SslAcceptor>>,
    blacklist: Arc<RwLock<Blacklist>>,
    session_interval: u64,
    test_mode: bool,
    db_settings: watch::Sender<DatabaseSettings>,
    workers: JoinSet<()>,
}

impl Master {
    pub async fn new(cfg_file: Option<&Path>) -> Result<Self, MasterError> {
        let config = BlacknetConfig::load(cfg_file)?;
        let settings = DatabaseSettings::from_config(&config)?;
        let (db_settings, _) = watch::channel(settings);

        let mut master = Self {
            config,
            acceptor: Acceptor::new(),
            tls: None,
            blacklist: Arc::new(RwLock::new(Blacklist::default())),
            session_interval: BLACKNET_DEFAULT_SESSION_INTERVAL,
            test_mode: false,
            db_settings,
            workers: JoinSet::new(),
        };
        master.apply_config().await?;
        info!("== blacknet master is starting");
        Ok(master)
    }

    fn listen_endpoints(config: &BlacknetConfig) -> Vec<Endpoint> {
        let listen = config.get("server", "listen").unwrap_or_else(|| {
            format!("{}:{}", BLACKNET_SSL_DEFAULT_ADDRESS, BLACKNET_SSL_DEFAULT_PORT)
        });
        Endpoint::parse_list(&listen, BLACKNET_SSL_DEFAULT_PORT)
    }

    async fn apply_config(&mut self) -> Result<(), MasterError> {
        self.session_interval = self
            .config
            .get("server", "session_interval")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(BLACKNET_DEFAULT_SESSION_INTERVAL);
        self.test_mode = self.config.get_bool("server", "test_mode");

        if let Ok(mut blacklist) = self.blacklist.write() {
            blacklist.reload(&self.config);
        }

        let endpoints = Self::listen_endpoints(&self.config);

        // TLS is mandatory as soon as a TCP endpoint exists; UNIX-only
        // deployments run without a context.
        self.tls = match TlsSettings::from_config(&self.config, "server") {
            Ok(settings) => Some(Arc::new(tls::build_acceptor(&settings)?)),
            Err(missing) => {
                if endpoints.iter().any(|e| matches!(e, Endpoint::Tcp(_, _))) {
                    return Err(missing.into());
                }
                None
            }
        };

        let permissions = SocketPermissions::from_config(&self.config, "server");
        self.acceptor.reconfigure(&endpoints, &permissions).await?;

        self.db_settings
            .send_replace(DatabaseSettings::from_config(&self.config)?);
        Ok(())
    }

    /// Reload configuration, listen set, blacklist and database settings.
    /// Workers pick the database change up between read batches.
    pub async fn reload(&mut self) {
        info!("reloading configuration");
        if let Err(e) = self.config.reload() {
            error!("reload: {}", e);
            return;
        }
        if let Err(e) = self.apply_config().await {
            error!("reload: {}", e);
        }
    }

    /// One accept pass: reap finished workers, then serve new sensors.
    pub async fn serve_once(&mut self) {
        while self.workers.try_join_next().is_some() {}

        for accepted in self.acceptor.serve(MASTER_SERVE_TIMEOUT).await {
            let tls = self.tls.clone();
            let blacklist = self.blacklist.clone();
            let db_settings = self.db_settings.subscribe();
            let session_interval = self.session_interval;
            let test_mode = self.test_mode;
            self.workers.spawn(run_worker(
                accepted,
                tls,
                blacklist,
                db_settings,
                session_interval,
                test_mode,
            ));
        }
    }

    pub async fn shutdown(&mut self) {
        self.acceptor.shutdown().await;
        self.workers.shutdown().await;
        info!("== blacknet master stopped");
    }
}

// =============================================================================
// PER-SENSOR WORKER
// =============================================================================

enum WorkerStream {
    Tls(Box<SslStream<TcpStream>>),
    Unix(UnixStream),
}

impl WorkerStream {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            WorkerStream::Tls(stream) => stream.read(buf).await,
            WorkerStream::Unix(stream) => stream.read(buf).await,
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            WorkerStream::Tls(stream) => stream.write_all(buf).await,
            WorkerStream::Unix(stream) => stream.write_all(buf).await,
        }
    }

    async fn close(&mut self) {
        let _ = match self {
            WorkerStream::Tls(stream) => stream.shutdown().await,
            WorkerStream::Unix(stream) => stream.shutdown().await,
        };
    }
}

async fn run_worker(
    accepted: Accepted,
    tls: Option<Arc<SslAcceptor>>,
    blacklist: Arc<RwLock<Blacklist>>,
    db_settings: watch::Receiver<DatabaseSettings>,
    session_interval: u64,
    test_mode: bool,
) {
    let peer = accepted.peer_label();

    let (stream, sensor_name, used_tls) = match accepted {
        Accepted::Tcp { stream, .. } => {
            let Some(tls) = tls else {
                warn!("{}: inbound sensor without a TLS context", peer);
                return;
            };
            if let Err(e) = socket2::SockRef::from(&stream).set_keepalive(true) {
                debug!("{}: keepalive: {}", peer, e);
            }
            match tls::accept(&tls, stream).await {
                Ok(stream) => {
                    let name = tls::peer_common_name(&stream);
                    (WorkerStream::Tls(Box::new(stream)), name, true)
                }
                Err(e) => {
                    warn!("{}: tls error: {}", peer, e);
                    return;
                }
            }
        }
        Accepted::Unix { stream } => (WorkerStream::Unix(stream), "unknown".to_owned(), false),
    };

    let database = {
        let settings = db_settings.borrow().clone();
        Database::new(settings)
    };
    let mut worker = SensorWorker {
        stream,
        peer,
        name: sensor_name.clone(),
        sensor_name: sensor_name.clone(),
        blacklist,
        test_mode,
        unpacker: Unpacker::new(),
        attempt_count: 0,
        dropped_count: 0,
        ingest: Some(Ingest {
            database,
            db_settings,
            sensor_name,
            session_interval,
            atk_cache: HashMap::new(),
            ses_cache: HashMap::new(),
            key_cache: HashMap::new(),
            last_error: None,
        }),
    };

    info!("{}: starting session (TLS: {})", worker.prefix(), used_tls);
    worker.handle_sensor().await;
    info!(
        "{}: stopping session ({} attempts, {} dropped)",
        worker.prefix(),
        worker.attempt_count,
        worker.dropped_count
    );
}

struct SensorWorker {
    stream: WorkerStream,
    peer: String,
    /// Logical name: starts as the certificate CN, may be renamed by
    /// CLIENT_NAME. Log prefixes only; the CN stays the DB target.
    name: String,
    /// Certificate-derived identity, also the blacklist key.
    sensor_name: String,
    blacklist: Arc<RwLock<Blacklist>>,
    test_mode: bool,
    unpacker: Unpacker,
    attempt_count: u64,
    dropped_count: u64,
    /// Taken while an ingest batch runs on the blocking pool; None only
    /// inside that window (or after a panicked ingest task).
    ingest: Option<Ingest>,
}

impl SensorWorker {
    fn prefix(&self) -> String {
        format!("{} ({})", self.name, self.peer)
    }

    async fn handle_sensor(&mut self) {
        let mut buf = [0u8; 8192];
        let mut running = true;

        while running {
            let n = match self.stream.read_chunk(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    warn!("{}: socket error: {}", self.prefix(), e);
                    break;
                }
            };
            if n == 0 {
                break;
            }
            self.unpacker.feed(&buf[..n]);

            loop {
                match self.unpacker.next_frame() {
                    Ok(Some((code, payload))) => {
                        if !self.dispatch(code, payload).await {
                            running = false;
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("{}: protocol error: {}", self.prefix(), e);
                        running = false;
                        break;
                    }
                }
            }

            self.commit_batch().await;
        }
        self.stream.close().await;
    }

    /// Handle one decoded frame; false terminates the session.
    async fn dispatch(&mut self, code: u64, payload: Value) -> bool {
        let Some(msgtype) = MsgType::from_code(code) else {
            error!("{}: unknown msgtype {}", self.prefix(), code);
            return true;
        };

        let msg = match Message::from_wire(msgtype, &payload) {
            Ok(msg) => msg,
            Err(e) => {
                return match msgtype {
                    // A malformed greeting or rename is a protocol
                    // violation: drop the sensor.
                    MsgType::Hello | MsgType::ClientName => {
                        error!("{}: {}", self.prefix(), e);
                        false
                    }
                    MsgType::SshCredential | MsgType::SshPublickey => {
                        info!("{}: {}", self.prefix(), e);
                        self.dropped_count += 1;
                        true
                    }
                    _ => true,
                };
            }
        };

        match msg {
            Message::Hello(greeting) => {
                if greeting != BLACKNET_HELLO {
                    error!(
                        "{}: client reported buggy hello (got {}, expected {})",
                        self.prefix(),
                        greeting,
                        BLACKNET_HELLO
                    );
                    return false;
                }
                true
            }
            Message::ClientName(name) => {
                if name != self.name {
                    info!("{}: changing client name to {}", self.prefix(), name);
                    self.name = name;
                }
                true
            }
            Message::Ping => {
                debug!("{}: responding to ping request", self.prefix());
                self.reply(Message::Pong).await;
                true
            }
            Message::Goodbye => {
                self.reply(Message::Goodbye).await;
                false
            }
            Message::SshCredential(payload) => {
                self.handle_ssh_credential(payload).await;
                true
            }
            Message::SshPublickey(payload) => {
                self.handle_ssh_publickey(payload).await;
                true
            }
            // The sensor never sends PONG; ignore it like any other noise.
            Message::Pong => true,
        }
    }

    async fn reply(&mut self, msg: Message) {
        let frame = match msg.encode() {
            Ok(frame) => frame,
            Err(e) => {
                error!("{}: encode error: {}", self.prefix(), e);
                return;
            }
        };
        if let Err(e) = self.stream.write_all(&frame).await {
            warn!("{}: socket error: {}", self.prefix(), e);
        }
    }

    async fn handle_ssh_credential(&mut self, payload: CredentialPayload) {
        let event = IngestEvent {
            client: payload.client,
            version: payload.version,
            user: payload.user,
            passwd: payload.passwd,
            time: payload.time,
        };
        match self.handle_ssh_common(event, None).await {
            Ok(()) => self.attempt_count += 1,
            Err(e) => {
                info!("{}: credential error: {}", self.prefix(), e);
                self.dropped_count += 1;
            }
        }
    }

    async fn handle_ssh_publickey(&mut self, payload: PublickeyPayload) {
        let event = IngestEvent {
            client: payload.client.clone(),
            version: payload.version.clone(),
            user: payload.user.clone(),
            passwd: None,
            time: payload.time,
        };
        match self.handle_ssh_common(event, Some(payload)).await {
            Ok(()) => self.attempt_count += 1,
            Err(e) => {
                info!("{}: pubkey error: {}", self.prefix(), e);
                self.dropped_count += 1;
            }
        }
    }

    /// Shared ingest path: blacklist gate, then attacker, session and
    /// attempt rows (plus the key link for pubkey events). The store is
    /// synchronous, so the ingest state moves onto the blocking pool for
    /// the duration of the chain and comes back when it is done.
    async fn handle_ssh_common(
        &mut self,
        mut event: IngestEvent,
        pubkey: Option<PublickeyPayload>,
    ) -> Result<(), IngestError> {
        if self.test_mode {
            event.client = TEST_MODE_CLIENT.to_owned();
        }

        self.check_blacklist(&event)?;

        let atk_id = ipv4_to_u32(&event.client)
            .ok_or_else(|| IngestError::BadAddress(event.client.clone()))?;

        let mut ingest = self.ingest.take().ok_or(IngestError::Lost)?;
        let outcome = tokio::task::spawn_blocking(move || {
            let result = ingest.record_attempt(atk_id, &event, pubkey.as_ref());
            (ingest, result)
        })
        .await;

        match outcome {
            Ok((ingest, result)) => {
                self.ingest = Some(ingest);
                result.map_err(IngestError::Db)
            }
            Err(e) => {
                error!("{}: ingest task failed: {}", self.prefix(), e);
                Err(IngestError::Lost)
            }
        }
    }

    /// Commit the open batch on the blocking pool. Nothing to do while the
    /// worker has not touched the store.
    async fn commit_batch(&mut self) {
        let connected = self
            .ingest
            .as_ref()
            .map(|ingest| ingest.database.is_connected())
            .unwrap_or(false);
        if !connected {
            return;
        }

        let Some(mut ingest) = self.ingest.take() else {
            return;
        };
        let outcome = tokio::task::spawn_blocking(move || {
            let result = ingest.database.commit();
            (ingest, result)
        })
        .await;

        match outcome {
            Ok((ingest, result)) => {
                self.ingest = Some(ingest);
                if let Err(e) = result {
                    warn!("{}: commit error: {}", self.prefix(), e);
                }
            }
            Err(e) => error!("{}: ingest task failed: {}", self.prefix(), e),
        }
    }

    fn check_blacklist(&self, event: &IngestEvent) -> Result<(), IngestError> {
        let hit = self
            .blacklist
            .read()
            .map(|blacklist| blacklist.has(&self.sensor_name, &event.user))
            .unwrap_or(false);
        if hit {
            let message = format!(
                "blacklisted user {} from {} using {}",
                event.user, event.client, event.version
            );
            info!("{}: {}", self.prefix(), message);
            return Err(IngestError::Blacklisted(message));
        }
        Ok(())
    }
}

// =============================================================================
// INGEST
// =============================================================================

struct IngestEvent {
    client: String,
    version: String,
    user: String,
    passwd: Option<String>,
    time: u64,
}

#[derive(Debug, thiserror::Error)]
enum IngestError {
    #[error("{0}")]
    Blacklisted(String),

    #[error("bad client address {0}")]
    BadAddress(String),

    #[error("database: {0}")]
    Db(rusqlite::Error),

    /// The ingest state did not come back from the blocking pool.
    #[error("ingest state lost")]
    Lost,
}

/// Worker-owned ingest state: the database handle plus the coalescing
/// caches keyed by attacker identity.
struct Ingest {
    database: Database,
    db_settings: watch::Receiver<DatabaseSettings>,
    /// Certificate-derived sensor identity; the `target` of every write.
    sensor_name: String,
    session_interval: u64,
    atk_cache: HashMap<u32, (u64, u64)>,
    ses_cache: HashMap<u32, (i64, u64)>,
    key_cache: HashMap<String, i64>,
    last_error: Option<rusqlite::ErrorCode>,
}

impl Ingest {
    /// Full ingest chain for one event; every step runs under the retry
    /// wrapper. Runs on the blocking pool, the store is synchronous.
    fn record_attempt(
        &mut self,
        atk_id: u32,
        event: &IngestEvent,
        pubkey: Option<&PublickeyPayload>,
    ) -> rusqlite::Result<()> {
        let atk_id = self.retry(|ingest| ingest.attacker_step(atk_id, event))?;
        let ses_id = self.retry(|ingest| ingest.session_step(atk_id, event.time))?;
        let att_id = self.retry(|ingest| ingest.attempt_step(event, atk_id, ses_id))?;
        if let Some(payload) = pubkey {
            self.retry(|ingest| ingest.pubkey_step(payload, att_id))?;
        }
        Ok(())
    }

    /// Run one ingest step, reconnecting and retrying on database errors.
    /// The error is logged once per distinct code to keep retry storms out
    /// of the logs; exhaustion hands the error back to the caller.
    fn retry<T>(
        &mut self,
        mut f: impl FnMut(&mut Self) -> rusqlite::Result<T>,
    ) -> rusqlite::Result<T> {
        if self.db_settings.has_changed().unwrap_or(false) {
            let settings = self.db_settings.borrow_and_update().clone();
            self.database.reload(settings);
        }

        let mut tries = 0;
        loop {
            match f(self) {
                Ok(value) => {
                    self.last_error = None;
                    return Ok(value);
                }
                Err(e) => {
                    tries += 1;
                    let code = e.sqlite_error_code();
                    if self.last_error != code {
                        self.last_error = code;
                        warn!("database error: {}", e);
                    }
                    self.database.disconnect();
                    if tries >= BLACKNET_DATABASE_RETRIES {
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Ensure the attacker row exists and its seen-range covers `time`.
    fn attacker_step(&mut self, atk_id: u32, event: &IngestEvent) -> rusqlite::Result<u32> {
        self.database.begin_batch()?;

        let (first_seen, last_seen) = match self.atk_cache.get(&atk_id).copied() {
            Some(cached) => cached,
            None => {
                let dates = match self.database.check_attacker(atk_id)? {
                    Some(dates) => dates,
                    None => {
                        let locid = self.database.get_locid(atk_id)?;
                        if locid == BLACKNET_DEFAULT_LOCID {
                            info!("no geolocation for client {}", event.client);
                        }
                        let dns = reverse_dns(&event.client);
                        self.database
                            .insert_attacker(atk_id, &event.client, &dns, event.time, locid)?;
                        (event.time, event.time)
                    }
                };
                self.atk_cache.insert(atk_id, dates);
                dates
            }
        };

        if event.time < first_seen {
            self.atk_cache.insert(atk_id, (event.time, last_seen));
            self.database.update_attacker_first_seen(atk_id, event.time)?;
        }
        if event.time > last_seen {
            self.atk_cache.insert(atk_id, (first_seen, event.time));
            self.database.update_attacker_last_seen(atk_id, event.time)?;
        }
        Ok(atk_id)
    }

    /// Find or open the enclosing session. A gap strictly larger than the
    /// session interval starts a new one.
    fn session_step(&mut self, atk_id: u32, time: u64) -> rusqlite::Result<i64> {
        let (ses_id, last_seen) = match self.ses_cache.get(&atk_id).copied() {
            Some(cached) => cached,
            None => self
                .database
                .check_session(atk_id, &self.sensor_name)?
                .unwrap_or((0, 0)),
        };

        let ses_id = if time > last_seen + self.session_interval {
            self.database.insert_session(atk_id, time, &self.sensor_name)?
        } else {
            self.database.update_session_last_seen(ses_id, time)?;
            ses_id
        };
        self.ses_cache.insert(atk_id, (ses_id, time));
        Ok(ses_id)
    }

    fn attempt_step(
        &mut self,
        event: &IngestEvent,
        atk_id: u32,
        ses_id: i64,
    ) -> rusqlite::Result<i64> {
        self.database.insert_attempt(
            atk_id,
            ses_id,
            &event.user,
            event.passwd.as_deref(),
            &self.sensor_name,
            event.time,
            &event.version,
        )
    }

    /// Register the offered key (unique by fingerprint) and link it to the
    /// attempt row.
    fn pubkey_step(&mut self, payload: &PublickeyPayload, att_id: i64) -> rusqlite::Result<i64> {
        let key_id = match self.key_cache.get(&payload.kfp).copied() {
            Some(cached) => cached,
            None => {
                let key_id = match self.database.check_pubkey(&payload.kfp)? {
                    Some(existing) => existing,
                    None => self.database.insert_pubkey(
                        &payload.ktype,
                        &payload.kfp,
                        &payload.k64,
                        payload.ksize,
                    )?,
                };
                self.key_cache.insert(payload.kfp.clone(), key_id);
                key_id
            }
        };
        self.database.insert_attempts_pubkeys(att_id, key_id)?;
        Ok(key_id)
    }
}
