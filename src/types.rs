//! Protocol constants and small helpers shared by sensor and master.
//!
//! # Design Goals
//!
//! 1. **Bounded work per attacker**: every dialogue with the outside world
//!    has an explicit retry or time limit. A single TCP session can never
//!    hold a worker longer than `SSH_CLIENT_TIMEOUT`.
//!
//! 2. **Best-effort delivery**: the sensor to master path retries within
//!    fixed bounds and then drops; the master's storage layer tolerates the
//!    duplicates a reconnect can produce.

use std::net::Ipv4Addr;
use std::time::{SystemTime, UNIX_EPOCH};

// =============================================================================
// PROTOCOL IDENTIFICATION
// =============================================================================

/// Greeting payload every sensor must present before anything else.
/// A mismatch terminates the connection during the hello exchange.
pub const BLACKNET_HELLO: &str = "CPE1704TKS";

/// Message type codes between sensor and master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum MsgType {
    Hello = 0,
    ClientName = 1,
    SshCredential = 2,
    SshPublickey = 3,
    Ping = 10,
    Pong = 11,
    Goodbye = 16,
}

impl MsgType {
    pub fn from_code(code: u64) -> Option<MsgType> {
        match code {
            0 => Some(MsgType::Hello),
            1 => Some(MsgType::ClientName),
            2 => Some(MsgType::SshCredential),
            3 => Some(MsgType::SshPublickey),
            10 => Some(MsgType::Ping),
            11 => Some(MsgType::Pong),
            16 => Some(MsgType::Goodbye),
            _ => None,
        }
    }

    pub fn code(self) -> u64 {
        self as u64
    }

    pub fn command(self) -> &'static str {
        match self {
            MsgType::Hello => "hello",
            MsgType::ClientName => "client_name",
            MsgType::SshCredential => "ssh_credential",
            MsgType::SshPublickey => "ssh_publickey",
            MsgType::Ping => "ping",
            MsgType::Pong => "pong",
            MsgType::Goodbye => "goodbye",
        }
    }
}

// =============================================================================
// DEFAULT ENDPOINTS
// =============================================================================

/// Default listening interface for the master (TLS side).
pub const BLACKNET_SSL_DEFAULT_ADDRESS: &str = "127.0.0.1";
pub const BLACKNET_SSL_DEFAULT_PORT: u16 = 10443;

/// Default listening interface for the sensor (SSH side).
pub const BLACKNET_SSH_DEFAULT_ADDRESS: &str = "0.0.0.0";
pub const BLACKNET_SSH_DEFAULT_PORT: u16 = 2200;

/// Attempts separated by more than this many seconds open a new session.
pub const BLACKNET_DEFAULT_SESSION_INTERVAL: u64 = 3600;

// =============================================================================
// SSH TRAP LIMITS
// =============================================================================

/// Banner exposed to attackers unless overridden in configuration.
pub const BLACKNET_SSH_DEFAULT_BANNER: &str = "SSH-2.0-OpenSSH_8.4p1 Debian-5+deb11u1";

/// Max. number of auth retries before disconnecting.
/// One TCP session yields up to this many logged attempts.
pub const BLACKNET_SSH_AUTH_RETRIES: u32 = 42;

/// Hard wall-clock limit on a single attacker connection.
pub const BLACKNET_SSH_CLIENT_TIMEOUT: u64 = 20 * BLACKNET_SSH_AUTH_RETRIES as u64;

// =============================================================================
// CLIENT LINK TIMING
// =============================================================================

/// Acceptor idle window after which the sensor probes the master (5 mn).
pub const BLACKNET_PING_INTERVAL: u64 = 5 * 60;

/// How long to wait for the master's goodbye acknowledgement.
pub const BLACKNET_CLIENT_GOODBYE_TIMEOUT: u64 = 5;

/// How long to wait for a pong after a ping probe.
pub const BLACKNET_CLIENT_PING_TIMEOUT: u64 = 3;

/// Connection attempts before a connect error propagates to the caller.
pub const BLACKNET_CLIENT_CONN_RETRIES: u32 = 3;

/// Attempts per ingest step before the event is dropped.
pub const BLACKNET_DATABASE_RETRIES: u32 = 2;

/// Stands for "Other country" in the geolocation database.
pub const BLACKNET_DEFAULT_LOCID: u32 = 1;

// =============================================================================
// TLS CIPHERS
// =============================================================================

/// Supported ciphers for TLS links between master and sensors.
pub const BLACKNET_CIPHERS: [&str; 11] = [
    "ECDHE-RSA-AES256-GCM-SHA384",
    "ECDHE-ECDSA-AES256-SHA384",
    "ECDHE-RSA-AES256-SHA384",
    "ECDHE-ECDSA-AES256-SHA384",
    "ECDHE-RSA-AES128-GCM-SHA256",
    "ECDHE-ECDSA-AES128-GCM-SHA256",
    "ECDHE-RSA-AES128-SHA256",
    "ECDHE-ECDSA-AES128-SHA256",
    "DHE-RSA-AES256-GCM-SHA384",
    "DHE-RSA-AES256-SHA256",
    "AES256-GCM-SHA384",
];

// =============================================================================
// HELPERS
// =============================================================================

/// Current unix timestamp in seconds.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Encode a dotted-quad IPv4 address as its 32-bit big-endian value.
/// This is the attacker identity everywhere in the data model.
pub fn ipv4_to_u32(addr: &str) -> Option<u32> {
    addr.parse::<Ipv4Addr>().ok().map(u32::from)
}

/// Inverse of [`ipv4_to_u32`].
pub fn u32_to_ipv4(value: u32) -> String {
    Ipv4Addr::from(value).to_string()
}

/// Coerce raw protocol bytes into a UTF-8 string.
///
/// Attackers send arbitrary byte sequences as usernames, passwords and
/// banners. Policy: try UTF-8 first, then fall back to Latin-1 (which is
/// total over bytes). The result is what gets persisted, so the policy must
/// stay deterministic.
pub fn ensure_utf8(raw: &[u8]) -> String {
    match std::str::from_utf8(raw) {
        Ok(s) => s.to_owned(),
        Err(_) => raw.iter().map(|&b| b as char).collect(),
    }
}

/// Best-effort reverse DNS. Returns an empty string on any failure.
pub fn reverse_dns(addr: &str) -> String {
    addr.parse::<std::net::IpAddr>()
        .ok()
        .and_then(|ip| dns_lookup::lookup_addr(&ip).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_roundtrip() {
        for addr in ["1.2.3.4", "0.0.0.0", "255.255.255.255", "1.0.204.42"] {
            let value = ipv4_to_u32(addr).unwrap();
            assert_eq!(u32_to_ipv4(value), addr);
        }
        assert_eq!(ipv4_to_u32("1.2.3.4"), Some(16909060));
        assert_eq!(ipv4_to_u32("not-an-ip"), None);
    }

    #[test]
    fn test_msgtype_codes() {
        for code in [0u64, 1, 2, 3, 10, 11, 16] {
            assert_eq!(MsgType::from_code(code).unwrap().code(), code);
        }
        assert!(MsgType::from_code(4).is_none());
        assert!(MsgType::from_code(12).is_none());
    }

    #[test]
    fn test_ensure_utf8_policy() {
        assert_eq!(ensure_utf8(b"root"), "root");
        assert_eq!(ensure_utf8("pâssword".as_bytes()), "pâssword");
        // Invalid UTF-8 falls back to Latin-1: 0xe9 is 'é'.
        assert_eq!(ensure_utf8(&[0x61, 0xe9, 0x62]), "aéb");
    }

    #[test]
    fn test_ssh_timeout_derivation() {
        assert_eq!(BLACKNET_SSH_CLIENT_TIMEOUT, 840);
    }
}
