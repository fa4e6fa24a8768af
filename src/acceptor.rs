//! Multi-endpoint listener set shared by sensor and master.
//!
//! An acceptor owns a dynamic set of TCP and UNIX listening endpoints.
//! `reconfigure` applies a target set by symmetric difference so a reload
//! only touches what changed; `serve` multiplexes one accept pass across
//! every listener with a timeout window that doubles as the idle-tick
//! driver (the sensor pings the master from it).

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::task::Poll;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tracing::{error, info, warn};

use crate::config::BlacknetConfig;

/// A single listening endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Tcp(String, u16),
    Unix(PathBuf),
}

impl Endpoint {
    /// Parse a comma-separated `listen` string. Entries starting with `/`
    /// are UNIX socket paths; everything else is `host[:port]`.
    pub fn parse_list(listen: &str, default_port: u16) -> Vec<Endpoint> {
        listen
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                if entry.starts_with('/') {
                    Endpoint::Unix(PathBuf::from(entry))
                } else {
                    match entry.split_once(':') {
                        Some((host, port)) => match port.parse() {
                            Ok(port) => Endpoint::Tcp(host.to_owned(), port),
                            Err(e) => {
                                error!("address port: {}", e);
                                Endpoint::Tcp(host.to_owned(), default_port)
                            }
                        },
                        None => Endpoint::Tcp(entry.to_owned(), default_port),
                    }
                }
            })
            .collect()
    }

    pub fn name(&self) -> String {
        match self {
            Endpoint::Tcp(host, port) => format!("{}:{}", host, port),
            Endpoint::Unix(path) => path.display().to_string(),
        }
    }
}

/// Ownership and mode applied to UNIX listening sockets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocketPermissions {
    pub owner: Option<String>,
    pub group: Option<String>,
    pub mode: Option<u32>,
}

impl SocketPermissions {
    pub fn from_config(config: &BlacknetConfig, role: &str) -> Self {
        let mode = config.get(role, "listen_mode").and_then(|raw| {
            match u32::from_str_radix(raw.trim(), 8) {
                Ok(mode) => Some(mode),
                Err(e) => {
                    error!("socket mode: {}", e);
                    None
                }
            }
        });
        Self {
            owner: config.get(role, "listen_owner"),
            group: config.get(role, "listen_group"),
            mode,
        }
    }

    fn apply(&self, path: &Path) -> io::Result<()> {
        if self.owner.is_some() || self.group.is_some() {
            let uid = match &self.owner {
                Some(name) => nix::unistd::User::from_name(name)
                    .map_err(io::Error::from)?
                    .map(|user| user.uid),
                None => None,
            };
            let gid = match &self.group {
                Some(name) => nix::unistd::Group::from_name(name)
                    .map_err(io::Error::from)?
                    .map(|group| group.gid),
                None => None,
            };
            nix::unistd::chown(path, uid, gid).map_err(io::Error::from)?;
        }
        if let Some(mode) = self.mode {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
        }
        Ok(())
    }
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    fn poll_accept(&self, cx: &mut std::task::Context<'_>) -> Poll<io::Result<Accepted>> {
        match self {
            Listener::Tcp(listener) => listener
                .poll_accept(cx)
                .map_ok(|(stream, peer)| Accepted::Tcp { stream, peer }),
            Listener::Unix(listener) => listener
                .poll_accept(cx)
                .map_ok(|(stream, _)| Accepted::Unix { stream }),
        }
    }
}

/// A freshly accepted connection, before any TLS or SSH framing.
pub enum Accepted {
    Tcp {
        stream: TcpStream,
        peer: std::net::SocketAddr,
    },
    Unix {
        stream: UnixStream,
    },
}

impl Accepted {
    /// Peer label for log prefixes. UNIX peers have no address.
    pub fn peer_label(&self) -> String {
        match self {
            Accepted::Tcp { peer, .. } => peer.ip().to_string(),
            Accepted::Unix { .. } => "local".to_owned(),
        }
    }
}

/// Dynamic set of listening endpoints.
#[derive(Default)]
pub struct Acceptor {
    listeners: Vec<(Endpoint, Listener)>,
}

impl Acceptor {
    pub fn new() -> Self {
        Self { listeners: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.listeners.iter().map(|(e, _)| e.clone()).collect()
    }

    /// Apply a target endpoint set.
    ///
    /// Removed endpoints stop listening (UNIX paths are unlinked), new ones
    /// are bound, and UNIX endpoints that stay get their permissions
    /// re-applied since the configuration may have changed them.
    pub async fn reconfigure(
        &mut self,
        targets: &[Endpoint],
        permissions: &SocketPermissions,
    ) -> io::Result<()> {
        let current = self.endpoints();

        for (endpoint, _) in &self.listeners {
            if let Endpoint::Unix(path) = endpoint {
                if targets.contains(endpoint) {
                    permissions.apply(path)?;
                }
            }
        }

        for endpoint in &current {
            if !targets.contains(endpoint) {
                self.listen_stop(endpoint);
            }
        }

        for endpoint in targets {
            if !current.contains(endpoint) {
                self.listen_start(endpoint, permissions).await?;
            }
        }
        Ok(())
    }

    async fn listen_start(
        &mut self,
        endpoint: &Endpoint,
        permissions: &SocketPermissions,
    ) -> io::Result<()> {
        let listener = match endpoint {
            Endpoint::Tcp(host, port) => {
                let listener = TcpListener::bind((host.as_str(), *port)).await?;
                Listener::Tcp(listener)
            }
            Endpoint::Unix(path) => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                let listener = UnixListener::bind(path)?;
                permissions.apply(path)?;
                Listener::Unix(listener)
            }
        };
        info!("starting interface {}", endpoint.name());
        self.listeners.push((endpoint.clone(), listener));
        Ok(())
    }

    fn listen_stop(&mut self, endpoint: &Endpoint) {
        if let Some(pos) = self.listeners.iter().position(|(e, _)| e == endpoint) {
            info!("stopping interface {}", endpoint.name());
            let (endpoint, listener) = self.listeners.remove(pos);
            drop(listener);
            if let Endpoint::Unix(path) = &endpoint {
                let _ = std::fs::remove_file(path);
            }
        }
    }

    /// One multiplexed accept pass.
    ///
    /// Waits up to `timeout` for readiness across all listeners; each ready
    /// listener accepts exactly once. An empty result means the window
    /// elapsed idle (callers use this as their periodic tick). Accept
    /// errors are logged and never terminate the server.
    pub async fn serve(&self, timeout: Duration) -> Vec<Accepted> {
        if self.listeners.is_empty() {
            tokio::time::sleep(timeout).await;
            return Vec::new();
        }

        let accept_pass = std::future::poll_fn(|cx| {
            let mut batch = Vec::new();
            for (endpoint, listener) in &self.listeners {
                match listener.poll_accept(cx) {
                    Poll::Ready(Ok(accepted)) => batch.push(accepted),
                    Poll::Ready(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {}
                    Poll::Ready(Err(e)) => warn!("accept error on {}: {}", endpoint.name(), e),
                    Poll::Pending => {}
                }
            }
            if batch.is_empty() {
                Poll::Pending
            } else {
                Poll::Ready(batch)
            }
        });

        tokio::select! {
            batch = accept_pass => batch,
            _ = tokio::time::sleep(timeout) => Vec::new(),
        }
    }

    /// Stop listening everywhere.
    pub async fn shutdown(&mut self) {
        let _ = self.reconfigure(&[], &SocketPermissions::default()).await;
    }
}
