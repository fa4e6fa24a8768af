//! Sensor↔master integration tests over UNIX sockets.
//!
//! UNIX transports skip TLS by design, which lets these tests drive the
//! real client, the real worker and the real store end to end. Each test
//! gets its own socket and database under a private temp directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use blacknet::types::MsgType;
use blacknet::wire::{encode_frame, CredentialPayload, Message, PublickeyPayload, Unpacker};
use blacknet::{BlacknetConfig, Master, SensorClient};
use rusqlite::Connection;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

const T: u64 = 1700000000;

struct TestEnv {
    root: PathBuf,
}

impl TestEnv {
    fn new(tag: &str) -> Self {
        let root = std::env::temp_dir().join(format!("blacknet_link_{}_{}", tag, std::process::id()));
        let _ = std::fs::remove_dir_all(&root);
        std::fs::create_dir_all(&root).unwrap();
        Self { root }
    }

    fn sock(&self) -> PathBuf {
        self.root.join("master.sock")
    }

    fn db(&self) -> PathBuf {
        self.root.join("blacknet.sqlite")
    }

    fn master_config(&self, extra_server: &str) -> PathBuf {
        let path = self.root.join("master.cfg");
        std::fs::write(
            &path,
            format!(
                "[server]\nlisten = {}\n{}\n[database]\npath = {}\n",
                self.sock().display(),
                extra_server,
                self.db().display()
            ),
        )
        .unwrap();
        path
    }

    fn sensor_config(&self, name: Option<&str>) -> BlacknetConfig {
        let path = self.root.join("sensor.cfg");
        let name_line = name.map(|n| format!("name = {}\n", n)).unwrap_or_default();
        std::fs::write(
            &path,
            format!("[honeypot]\nserver = {}\n{}", self.sock().display(), name_line),
        )
        .unwrap();
        BlacknetConfig::load(Some(&path)).unwrap()
    }
}

impl Drop for TestEnv {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

async fn start_master(cfg: &Path) -> tokio::task::JoinHandle<()> {
    let mut master = Master::new(Some(cfg)).await.expect("master starts");
    tokio::spawn(async move {
        loop {
            master.serve_once().await;
        }
    })
}

fn query(db: &Path, sql: &str) -> i64 {
    Connection::open(db)
        .ok()
        .and_then(|conn| conn.query_row(sql, [], |row| row.get(0)).ok())
        .unwrap_or(-1)
}

async fn wait_count(db: &Path, sql: &str, expect: i64) {
    for _ in 0..200 {
        if query(db, sql) == expect {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out: {} != {} ({})", sql, expect, query(db, sql));
}

fn credential(client: &str, user: &str, passwd: &str, time: u64) -> CredentialPayload {
    CredentialPayload {
        client: client.to_owned(),
        version: "SSH-2.0-x".to_owned(),
        user: user.to_owned(),
        passwd: Some(passwd.to_owned()),
        time,
    }
}

// =============================================================================
// INGEST SCENARIOS
// =============================================================================

#[tokio::test]
async fn test_single_credential_cold_caches() {
    let env = TestEnv::new("cold");
    let master = start_master(&env.master_config("")).await;

    let client = SensorClient::new(&env.sensor_config(None));
    client.send_ssh_credential(credential("1.2.3.4", "root", "toor", T)).await;

    wait_count(&env.db(), "SELECT COUNT(*) FROM attempts", 1).await;
    let db = env.db();

    assert_eq!(query(&db, "SELECT id FROM attackers"), 16909060);
    assert_eq!(
        query(&db, "SELECT COUNT(*) FROM attackers WHERE ip = '1.2.3.4' AND n_attempts = 0"),
        1
    );
    assert_eq!(
        query(&db, &format!("SELECT COUNT(*) FROM attackers WHERE first_seen = {T} AND last_seen = {T}")),
        1
    );
    assert_eq!(
        query(&db, &format!(
            "SELECT COUNT(*) FROM sessions WHERE attacker_id = 16909060 \
             AND first_attempt = {T} AND last_attempt = {T} AND target = 'unknown'"
        )),
        1
    );
    assert_eq!(
        query(&db, &format!(
            "SELECT COUNT(*) FROM attempts WHERE user = 'root' AND password = 'toor' \
             AND date = {T} AND target = 'unknown'"
        )),
        1
    );

    client.disconnect(true).await;
    master.abort();
}

#[tokio::test]
async fn test_session_coalescing_within_interval() {
    let env = TestEnv::new("coalesce");
    let master = start_master(&env.master_config("session_interval = 3600")).await;

    let client = SensorClient::new(&env.sensor_config(None));
    client.send_ssh_credential(credential("1.2.3.4", "root", "a", T)).await;
    client.send_ssh_credential(credential("1.2.3.4", "root", "b", T + 60)).await;

    wait_count(&env.db(), "SELECT COUNT(*) FROM attempts", 2).await;
    let db = env.db();

    assert_eq!(query(&db, "SELECT COUNT(*) FROM attackers"), 1);
    assert_eq!(query(&db, "SELECT COUNT(*) FROM sessions"), 1);
    assert_eq!(
        query(&db, &format!(
            "SELECT COUNT(*) FROM sessions WHERE first_attempt = {T} AND last_attempt = {}",
            T + 60
        )),
        1
    );

    client.disconnect(true).await;
    master.abort();
}

#[tokio::test]
async fn test_session_break_past_interval() {
    let env = TestEnv::new("break");
    let master = start_master(&env.master_config("session_interval = 3600")).await;

    let client = SensorClient::new(&env.sensor_config(None));
    client.send_ssh_credential(credential("1.2.3.4", "root", "a", T)).await;
    client.send_ssh_credential(credential("1.2.3.4", "root", "b", T + 3601)).await;

    wait_count(&env.db(), "SELECT COUNT(*) FROM attempts", 2).await;
    let db = env.db();

    assert_eq!(query(&db, "SELECT COUNT(*) FROM attackers"), 1);
    assert_eq!(query(&db, "SELECT COUNT(*) FROM sessions"), 2);
    assert_eq!(
        query(&db, &format!(
            "SELECT COUNT(*) FROM attackers WHERE first_seen = {T} AND last_seen = {}",
            T + 3601
        )),
        1
    );

    client.disconnect(true).await;
    master.abort();
}

#[tokio::test]
async fn test_pubkey_then_password() {
    let env = TestEnv::new("pubkey");
    let master = start_master(&env.master_config("")).await;

    let client = SensorClient::new(&env.sensor_config(None));
    client
        .send_ssh_publickey(PublickeyPayload {
            client: "1.2.3.4".into(),
            version: "SSH-2.0-x".into(),
            user: "root".into(),
            time: T,
            k64: "Zm9vYmFy".into(),
            ksize: 2048,
            kfp: "AA:BB".into(),
            ktype: "ssh-rsa".into(),
        })
        .await;
    client.send_ssh_credential(credential("1.2.3.4", "root", "toor", T + 1)).await;

    wait_count(&env.db(), "SELECT COUNT(*) FROM attempts", 2).await;
    let db = env.db();

    assert_eq!(query(&db, "SELECT COUNT(*) FROM attackers"), 1);
    assert_eq!(query(&db, "SELECT COUNT(*) FROM sessions"), 1);
    assert_eq!(
        query(&db, "SELECT COUNT(*) FROM pubkeys WHERE fingerprint = 'AA:BB' AND bits = 2048"),
        1
    );
    // The link row points at the pubkey attempt, which came first.
    assert_eq!(query(&db, "SELECT COUNT(*) FROM attempts_pubkeys"), 1);
    assert_eq!(
        query(&db, "SELECT attempt_id FROM attempts_pubkeys"),
        query(&db, "SELECT MIN(id) FROM attempts")
    );
    assert_eq!(
        query(&db, "SELECT COUNT(*) FROM attempts WHERE password IS NULL"),
        1
    );

    client.disconnect(true).await;
    master.abort();
}

#[tokio::test]
async fn test_blacklisted_user_is_dropped() {
    let env = TestEnv::new("blacklist");
    let blacklist = env.root.join("blacklist.cfg");
    std::fs::write(&blacklist, "[*]\nroot\n").unwrap();

    let extra = format!("blacklist_file = {}", blacklist.display());
    let master = start_master(&env.master_config(&extra)).await;

    let client = SensorClient::new(&env.sensor_config(None));
    client.send_ssh_credential(credential("1.2.3.4", "root", "toor", T)).await;
    client.send_ssh_credential(credential("1.2.3.4", "admin", "toor", T)).await;

    wait_count(&env.db(), "SELECT COUNT(*) FROM attempts", 1).await;
    let db = env.db();

    // The blacklisted attempt created nothing at all.
    assert_eq!(query(&db, "SELECT COUNT(*) FROM attempts WHERE user = 'root'"), 0);
    assert_eq!(query(&db, "SELECT COUNT(*) FROM attempts WHERE user = 'admin'"), 1);
    assert_eq!(query(&db, "SELECT COUNT(*) FROM attackers"), 1);

    client.disconnect(true).await;
    master.abort();
}

#[tokio::test]
async fn test_test_mode_overrides_client_address() {
    let env = TestEnv::new("testmode");
    let master = start_master(&env.master_config("test_mode = true")).await;

    let client = SensorClient::new(&env.sensor_config(None));
    client.send_ssh_credential(credential("9.9.9.9", "root", "toor", T)).await;

    wait_count(&env.db(), "SELECT COUNT(*) FROM attempts", 1).await;
    // 1.0.204.42 encoded big-endian.
    assert_eq!(query(&env.db(), "SELECT id FROM attackers"), 16829482);
    assert_eq!(
        query(&env.db(), "SELECT COUNT(*) FROM attempts WHERE client = 'SSH-2.0-x'"),
        1
    );

    client.disconnect(true).await;
    master.abort();
}

// =============================================================================
// LINK BEHAVIOR
// =============================================================================

#[tokio::test]
async fn test_reconnect_resends_after_master_restart() {
    let env = TestEnv::new("reconnect");
    let cfg = env.master_config("");

    let first = start_master(&cfg).await;
    let client = SensorClient::new(&env.sensor_config(Some("sensor-one")));
    client.send_ssh_credential(credential("1.2.3.4", "root", "one", T)).await;
    wait_count(&env.db(), "SELECT COUNT(*) FROM attempts", 1).await;

    // Cut the master; the client still believes it is connected.
    first.abort();
    let _ = tokio::time::timeout(Duration::from_secs(1), first).await;
    let second = start_master(&cfg).await;

    // The send fails, the client reconnects (HELLO, CLIENT_NAME) and
    // retries the frame, so exactly one new attempt lands.
    client.send_ssh_credential(credential("1.2.3.4", "root", "two", T + 1)).await;
    wait_count(&env.db(), "SELECT COUNT(*) FROM attempts", 2).await;
    assert_eq!(
        query(&env.db(), "SELECT COUNT(*) FROM attempts WHERE password = 'two'"),
        1
    );

    client.disconnect(true).await;
    second.abort();
}

#[tokio::test]
async fn test_ping_pong_keeps_connection() {
    let env = TestEnv::new("pong");
    let master = start_master(&env.master_config("")).await;

    let client = SensorClient::new(&env.sensor_config(None));
    client.send_ssh_credential(credential("1.2.3.4", "root", "toor", T)).await;
    wait_count(&env.db(), "SELECT COUNT(*) FROM attempts", 1).await;

    client.send_ping().await;
    assert!(client.is_connected().await);

    client.disconnect(true).await;
    assert!(!client.is_connected().await);
    master.abort();
}

#[tokio::test]
async fn test_ping_timeout_disconnects_without_goodbye() {
    let env = TestEnv::new("pingdead");
    let sock = env.sock();
    let listener = UnixListener::bind(&sock).unwrap();

    // A mute master: accepts, reads, never answers.
    let mute = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4096];
        while let Ok(n) = stream.read(&mut buf).await {
            if n == 0 {
                break;
            }
        }
    });

    let client = SensorClient::new(&env.sensor_config(None));
    client.send_ping().await;
    assert!(!client.is_connected().await);

    mute.abort();
}

#[tokio::test]
async fn test_bad_hello_terminates_connection() {
    let env = TestEnv::new("badhello");
    let master = start_master(&env.master_config("")).await;

    // Wrong greeting string.
    let mut stream = UnixStream::connect(env.sock()).await.unwrap();
    let frame = Message::Hello("NOT-THE-CODE".into()).encode().unwrap();
    stream.write_all(&frame).await.unwrap();
    let mut buf = [0u8; 64];
    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(n, 0, "master must close on a bad hello");

    // Non-string greeting payload.
    let mut stream = UnixStream::connect(env.sock()).await.unwrap();
    let frame = encode_frame(MsgType::Hello.code(), &rmpv::Value::from(1234)).unwrap();
    stream.write_all(&frame).await.unwrap();
    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(n, 0, "master must close on a non-string hello");

    master.abort();
}

#[tokio::test]
async fn test_goodbye_is_acknowledged() {
    let env = TestEnv::new("goodbye");
    let master = start_master(&env.master_config("")).await;

    let mut stream = UnixStream::connect(env.sock()).await.unwrap();
    stream
        .write_all(&Message::Hello("CPE1704TKS".into()).encode().unwrap())
        .await
        .unwrap();
    stream.write_all(&Message::Goodbye.encode().unwrap()).await.unwrap();

    let mut unpacker = Unpacker::new();
    let mut buf = [0u8; 4096];
    let mut reply = None;
    while reply.is_none() {
        let n = stream.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        unpacker.feed(&buf[..n]);
        reply = unpacker.next_frame().unwrap();
    }
    let (code, _) = reply.expect("goodbye acknowledgement");
    assert_eq!(code, MsgType::Goodbye.code());

    master.abort();
}
