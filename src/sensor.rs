//! The sensor: an SSH trap facing the internet, one outbound link to the
//! master behind it.
//!
//! The accept loop doubles as the heartbeat driver: whenever the accept
//! window elapses idle, the sensor pings the master so half-open TLS links
//! are noticed and replaced before the next attempt needs them.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use russh::server::Config as SshConfig;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::acceptor::{Accepted, Acceptor, Endpoint, SocketPermissions};
use crate::client::SensorClient;
use crate::config::{BlacknetConfig, ConfigError};
use crate::ssh::{load_host_key, run_trap_session, trap_config, SshTrapError};
use crate::types::{
    BLACKNET_PING_INTERVAL, BLACKNET_SSH_DEFAULT_ADDRESS, BLACKNET_SSH_DEFAULT_BANNER,
    BLACKNET_SSH_DEFAULT_PORT,
};

#[derive(Debug, thiserror::Error)]
pub enum SensorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Trap(#[from] SshTrapError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub struct Sensor {
    config: BlacknetConfig,
    acceptor: Acceptor,
    client: Arc<SensorClient>,
    ssh_config: Arc<SshConfig>,
    workers: JoinSet<()>,
}

impl Sensor {
    pub async fn new(cfg_file: Option<&Path>) -> Result<Self, SensorError> {
        let config = BlacknetConfig::load(cfg_file)?;
        let client = Arc::new(SensorClient::new(&config));
        let ssh_config = Arc::new(Self::build_trap_config(&config)?);

        let mut sensor = Self {
            config,
            acceptor: Acceptor::new(),
            client,
            ssh_config,
            workers: JoinSet::new(),
        };
        sensor.apply_listen().await?;
        info!("== blacknet sensor is starting");
        Ok(sensor)
    }

    fn build_trap_config(config: &BlacknetConfig) -> Result<SshConfig, SensorError> {
        let key_path = PathBuf::from(config.get_required("honeypot", "ssh_keys")?);
        let host_key = load_host_key(&key_path)?;
        info!("SSH fingerprint: {}", host_key.fingerprint);

        let banner = config
            .get("honeypot", "ssh_banner")
            .unwrap_or_else(|| BLACKNET_SSH_DEFAULT_BANNER.to_owned());
        Ok(trap_config(&banner, host_key.keypair))
    }

    async fn apply_listen(&mut self) -> io::Result<()> {
        let listen = self.config.get("honeypot", "listen").unwrap_or_else(|| {
            format!("{}:{}", BLACKNET_SSH_DEFAULT_ADDRESS, BLACKNET_SSH_DEFAULT_PORT)
        });
        let endpoints = Endpoint::parse_list(&listen, BLACKNET_SSH_DEFAULT_PORT);
        let permissions = SocketPermissions::from_config(&self.config, "honeypot");
        self.acceptor.reconfigure(&endpoints, &permissions).await
    }

    /// One accept pass. An idle window probes the master instead.
    pub async fn serve_once(&mut self) {
        while self.workers.try_join_next().is_some() {}

        let timeout = Duration::from_secs(BLACKNET_PING_INTERVAL);
        let batch = self.acceptor.serve(timeout).await;
        if batch.is_empty() {
            self.do_ping().await;
            return;
        }

        for accepted in batch {
            let config = self.ssh_config.clone();
            let client = self.client.clone();
            let peer = accepted.peer_label();
            match accepted {
                Accepted::Tcp { stream, .. } => {
                    self.workers.spawn(run_trap_session(config, client, stream, peer));
                }
                Accepted::Unix { stream } => {
                    self.workers.spawn(run_trap_session(config, client, stream, peer));
                }
            }
        }
    }

    /// Probe the master. Skipped entirely on UNIX socket transports; the
    /// kernel already reports peer death there.
    async fn do_ping(&self) {
        if !self.client.server_is_sockfile().await {
            self.client.send_ping().await;
        }
    }

    pub async fn reload(&mut self) {
        info!("reloading configuration");
        if let Err(e) = self.config.reload() {
            error!("reload: {}", e);
            return;
        }
        match Self::build_trap_config(&self.config) {
            Ok(config) => self.ssh_config = Arc::new(config),
            Err(e) => error!("reload: {}", e),
        }
        if let Err(e) = self.apply_listen().await {
            error!("reload: {}", e);
        }
        self.client.reload(&self.config).await;
    }

    pub async fn shutdown(&mut self) {
        self.client.disconnect(true).await;
        self.acceptor.shutdown().await;
        self.workers.shutdown().await;
        info!("== blacknet sensor stopped");
    }
}
