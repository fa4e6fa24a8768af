//! Blacknet: distributed SSH honeypot.
//!
//! Sensors expose fake SSH endpoints, harvest every authentication attempt
//! and forward them over mutually authenticated TLS to a master that
//! deduplicates, geolocates and persists them in a relational store.

pub mod acceptor;
pub mod client;
pub mod config;
pub mod db;
pub mod master;
pub mod sensor;
pub mod ssh;
pub mod tls;
pub mod types;
pub mod wire;

pub use acceptor::{Accepted, Acceptor, Endpoint, SocketPermissions};
pub use client::{ClientError, SensorClient, ServerAddress};
pub use config::{Blacklist, BlacknetConfig, ConfigError};
pub use db::{Database, DatabaseSettings};
pub use master::{Master, MasterError};
pub use sensor::{Sensor, SensorError};
pub use ssh::{load_host_key, run_trap_session, trap_config, HostKey, SshTrapError};
pub use tls::{TlsError, TlsSettings};
pub use types::*;
pub use wire::{CredentialPayload, Message, PublickeyPayload, Unpacker, WireError};
