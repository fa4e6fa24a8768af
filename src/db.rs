//! Embedded relational store for the master.
//!
//! Entity and column names are load-bearing: the offline reporting tooling
//! queries them directly. Dates are epoch seconds. The connection is lazy:
//! callers get a handle on first use and can drop it at any time (the
//! ingest retry path disconnects between attempts).

use std::path::PathBuf;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::config::{BlacknetConfig, ConfigError};
use crate::types::BLACKNET_DEFAULT_LOCID;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS attackers (
    id          INTEGER PRIMARY KEY,
    ip          TEXT NOT NULL,
    dns         TEXT NOT NULL DEFAULT '',
    first_seen  INTEGER NOT NULL,
    last_seen   INTEGER NOT NULL,
    locId       INTEGER NOT NULL DEFAULT 1,
    n_attempts  INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS sessions (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    attacker_id   INTEGER NOT NULL,
    first_attempt INTEGER NOT NULL,
    last_attempt  INTEGER NOT NULL,
    target        TEXT NOT NULL,
    n_attempts    INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS attempts (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    attacker_id INTEGER NOT NULL,
    session_id  INTEGER NOT NULL,
    user        TEXT NOT NULL,
    password    TEXT,
    target      TEXT NOT NULL,
    date        INTEGER NOT NULL,
    client      TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS pubkeys (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL,
    fingerprint TEXT NOT NULL UNIQUE,
    data        TEXT NOT NULL,
    bits        INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS attempts_pubkeys (
    attempt_id  INTEGER NOT NULL,
    pubkey_id   INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS blocks (
    startIpNum  INTEGER NOT NULL,
    endIpNum    INTEGER NOT NULL,
    locId       INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS locations (
    locId       INTEGER PRIMARY KEY,
    country     TEXT,
    region      TEXT,
    city        TEXT,
    postalCode  TEXT,
    latitude    REAL,
    longitude   REAL,
    metroCode   TEXT,
    areaCode    TEXT
);
CREATE INDEX IF NOT EXISTS sessions_attacker_target
    ON sessions (attacker_id, target, last_attempt);
CREATE INDEX IF NOT EXISTS blocks_range ON blocks (startIpNum, endIpNum);
";

/// Where the store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseSettings {
    pub path: PathBuf,
}

impl DatabaseSettings {
    pub fn from_config(config: &BlacknetConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            path: config.get_required("database", "path")?.into(),
        })
    }
}

/// One database connection. Each master worker owns its own.
pub struct Database {
    settings: DatabaseSettings,
    conn: Option<Connection>,
}

impl Database {
    pub fn new(settings: DatabaseSettings) -> Self {
        Self { settings, conn: None }
    }

    fn handle(&mut self) -> rusqlite::Result<&Connection> {
        if self.conn.is_none() {
            let conn = Connection::open(&self.settings.path)?;
            conn.execute_batch(SCHEMA)?;
            info!("database connection successful ({})", self.settings.path.display());
            self.conn = Some(conn);
        }
        // The branch above just filled it.
        self.conn.as_ref().ok_or(rusqlite::Error::InvalidQuery)
    }

    /// Whether a live handle exists (and a commit could have work to do).
    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Drop the handle. The next query reconnects.
    pub fn disconnect(&mut self) {
        if let Some(conn) = self.conn.take() {
            if !conn.is_autocommit() {
                let _ = conn.execute_batch("COMMIT");
            }
        }
    }

    /// Adopt new settings; an unchanged path keeps the live handle.
    pub fn reload(&mut self, settings: DatabaseSettings) {
        if settings != self.settings {
            self.disconnect();
            self.settings = settings;
        }
    }

    /// Open a write batch unless one is already active.
    pub fn begin_batch(&mut self) -> rusqlite::Result<()> {
        let conn = self.handle()?;
        if conn.is_autocommit() {
            conn.execute_batch("BEGIN")?;
        }
        Ok(())
    }

    /// Commit the active write batch, if any.
    pub fn commit(&mut self) -> rusqlite::Result<()> {
        if let Some(conn) = &self.conn {
            if !conn.is_autocommit() {
                conn.execute_batch("COMMIT")?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // ATTACKERS
    // =========================================================================

    /// Fetch (first_seen, last_seen) for an attacker id.
    pub fn check_attacker(&mut self, atk_id: u32) -> rusqlite::Result<Option<(u64, u64)>> {
        self.handle()?
            .query_row(
                "SELECT first_seen, last_seen FROM attackers WHERE id = ?1",
                params![atk_id as i64],
                |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64)),
            )
            .optional()
    }

    pub fn insert_attacker(
        &mut self,
        atk_id: u32,
        ip: &str,
        dns: &str,
        time: u64,
        locid: u32,
    ) -> rusqlite::Result<()> {
        self.handle()?.execute(
            "INSERT INTO attackers (id, ip, dns, first_seen, last_seen, locId, n_attempts) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
            params![atk_id as i64, ip, dns, time as i64, time as i64, locid],
        )?;
        Ok(())
    }

    /// Conditional: only moves first_seen backwards.
    pub fn update_attacker_first_seen(&mut self, atk_id: u32, time: u64) -> rusqlite::Result<()> {
        self.handle()?.execute(
            "UPDATE attackers SET first_seen = ?1 WHERE id = ?2 AND first_seen > ?1",
            params![time as i64, atk_id as i64],
        )?;
        Ok(())
    }

    /// Conditional: only moves last_seen forwards.
    pub fn update_attacker_last_seen(&mut self, atk_id: u32, time: u64) -> rusqlite::Result<()> {
        self.handle()?.execute(
            "UPDATE attackers SET last_seen = ?1 WHERE id = ?2 AND last_seen < ?1",
            params![time as i64, atk_id as i64],
        )?;
        Ok(())
    }

    // =========================================================================
    // SESSIONS AND ATTEMPTS
    // =========================================================================

    /// Most recent session for (attacker, sensor): (id, last_attempt).
    pub fn check_session(
        &mut self,
        atk_id: u32,
        sensor: &str,
    ) -> rusqlite::Result<Option<(i64, u64)>> {
        self.handle()?
            .query_row(
                "SELECT id, last_attempt FROM sessions \
                 WHERE attacker_id = ?1 AND target = ?2 \
                 ORDER BY last_attempt DESC LIMIT 1",
                params![atk_id as i64, sensor],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)? as u64)),
            )
            .optional()
    }

    pub fn insert_session(
        &mut self,
        atk_id: u32,
        time: u64,
        sensor: &str,
    ) -> rusqlite::Result<i64> {
        let conn = self.handle()?;
        conn.execute(
            "INSERT INTO sessions (attacker_id, first_attempt, last_attempt, target) \
             VALUES (?1, ?2, ?3, ?4)",
            params![atk_id as i64, time as i64, time as i64, sensor],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Conditional: only moves last_attempt forwards.
    pub fn update_session_last_seen(&mut self, ses_id: i64, time: u64) -> rusqlite::Result<()> {
        self.handle()?.execute(
            "UPDATE sessions SET last_attempt = ?1 WHERE id = ?2 AND last_attempt < ?1",
            params![time as i64, ses_id],
        )?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn insert_attempt(
        &mut self,
        atk_id: u32,
        ses_id: i64,
        user: &str,
        password: Option<&str>,
        sensor: &str,
        time: u64,
        version: &str,
    ) -> rusqlite::Result<i64> {
        let conn = self.handle()?;
        conn.execute(
            "INSERT INTO attempts (attacker_id, session_id, user, password, target, date, client) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![atk_id as i64, ses_id, user, password, sensor, time as i64, version],
        )?;
        Ok(conn.last_insert_rowid())
    }

    // =========================================================================
    // PUBKEYS
    // =========================================================================

    pub fn check_pubkey(&mut self, fingerprint: &str) -> rusqlite::Result<Option<i64>> {
        self.handle()?
            .query_row(
                "SELECT id FROM pubkeys WHERE fingerprint = ?1",
                params![fingerprint],
                |row| row.get(0),
            )
            .optional()
    }

    pub fn insert_pubkey(
        &mut self,
        name: &str,
        fingerprint: &str,
        data: &str,
        bits: u64,
    ) -> rusqlite::Result<i64> {
        let conn = self.handle()?;
        conn.execute(
            "INSERT INTO pubkeys (name, fingerprint, data, bits) VALUES (?1, ?2, ?3, ?4)",
            params![name, fingerprint, data, bits as i64],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_attempts_pubkeys(&mut self, att_id: i64, key_id: i64) -> rusqlite::Result<()> {
        self.handle()?.execute(
            "INSERT INTO attempts_pubkeys (attempt_id, pubkey_id) VALUES (?1, ?2)",
            params![att_id, key_id],
        )?;
        Ok(())
    }

    // =========================================================================
    // GEOLOCATION
    // =========================================================================

    /// Location id for an encoded IPv4, or the "Other country" sentinel.
    pub fn get_locid(&mut self, atk_id: u32) -> rusqlite::Result<u32> {
        let locid = self
            .handle()?
            .query_row(
                "SELECT locId FROM blocks WHERE ?1 BETWEEN startIpNum AND endIpNum LIMIT 1",
                params![atk_id as i64],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(locid.map(|l| l as u32).unwrap_or(BLACKNET_DEFAULT_LOCID))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db(tag: &str) -> Database {
        let path = std::env::temp_dir().join(format!("blacknet_db_{}_{}.sqlite", tag, std::process::id()));
        let _ = std::fs::remove_file(&path);
        Database::new(DatabaseSettings { path })
    }

    #[test]
    fn test_attacker_conditional_updates() {
        let mut db = temp_db("attacker");

        db.insert_attacker(16909060, "1.2.3.4", "", 1000, 1).unwrap();
        assert_eq!(db.check_attacker(16909060).unwrap(), Some((1000, 1000)));

        // Moves only in the allowed direction.
        db.update_attacker_first_seen(16909060, 2000).unwrap();
        db.update_attacker_last_seen(16909060, 500).unwrap();
        assert_eq!(db.check_attacker(16909060).unwrap(), Some((1000, 1000)));

        db.update_attacker_first_seen(16909060, 500).unwrap();
        db.update_attacker_last_seen(16909060, 2000).unwrap();
        assert_eq!(db.check_attacker(16909060).unwrap(), Some((500, 2000)));
    }

    #[test]
    fn test_session_ordering() {
        let mut db = temp_db("session");

        let first = db.insert_session(1, 1000, "sensor").unwrap();
        let second = db.insert_session(1, 5000, "sensor").unwrap();
        assert_ne!(first, second);

        // Most recent session comes back.
        assert_eq!(db.check_session(1, "sensor").unwrap(), Some((second, 5000)));
        assert_eq!(db.check_session(1, "other").unwrap(), None);

        db.update_session_last_seen(second, 4000).unwrap();
        assert_eq!(db.check_session(1, "sensor").unwrap(), Some((second, 5000)));
        db.update_session_last_seen(second, 6000).unwrap();
        assert_eq!(db.check_session(1, "sensor").unwrap(), Some((second, 6000)));
    }

    #[test]
    fn test_pubkey_fingerprint_unique() {
        let mut db = temp_db("pubkey");

        let id = db.insert_pubkey("ssh-rsa", "AA:BB", "Zm9v", 2048).unwrap();
        assert_eq!(db.check_pubkey("AA:BB").unwrap(), Some(id));
        assert!(db.insert_pubkey("ssh-rsa", "AA:BB", "Zm9v", 2048).is_err());
    }

    #[test]
    fn test_locid_defaults_to_sentinel() {
        let mut db = temp_db("locid");
        assert_eq!(db.get_locid(16909060).unwrap(), 1);

        db.handle()
            .unwrap()
            .execute(
                "INSERT INTO blocks (startIpNum, endIpNum, locId) VALUES (16909056, 16909311, 7)",
                [],
            )
            .unwrap();
        assert_eq!(db.get_locid(16909060).unwrap(), 7);
        assert_eq!(db.get_locid(42).unwrap(), 1);
    }
}
