//! Node configuration.
//!
//! Loaded once by the master from a TOML file and handed to every worker
//! through `ConfigServer.Sync`, so the whole struct round-trips through JSON.

use crate::crypto::PeerKey;
use crate::error::{MeshError, MeshResult};
use crate::mapping::{MappingRecord, DEFAULT_PEER_PORT};
use crate::network::NetworkConfig;
use anyhow::{Context, Result};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default MTU of the TUN device. Leaves room for the envelope and UDP/IP
/// headers inside a 1500-byte link.
pub const DEFAULT_MTU: u16 = 1400;

/// Default TUN interface name.
pub const DEFAULT_DEVICE_NAME: &str = "mesh0";

/// Default private address of this node.
pub const DEFAULT_PRIVATE_IP: Ipv4Addr = Ipv4Addr::new(10, 99, 0, 1);

/// Default grace period for draining pipelines on shutdown.
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;

/// Default pause between worker spawns.
pub const DEFAULT_SPAWN_DELAY_MS: u64 = 10_000;

/// Default interval between aggregator reports.
pub const DEFAULT_STATS_INTERVAL_SECS: u64 = 60;

/// Name of the control channel socket inside the data directory.
pub const CONTROL_SOCKET_NAME: &str = "tunnel-mesh.sock";

/// Full node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Number of worker processes.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Socket and device queues owned by each worker.
    #[serde(default = "default_queues_per_worker")]
    pub queues_per_worker: usize,

    /// Local address to bind the UDP queues to. Defaults to the wildcard of
    /// the preferred family.
    #[serde(default)]
    pub listen_addr: Option<IpAddr>,

    /// UDP port shared by every socket queue.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Send to peers over IPv4.
    #[serde(default = "default_true")]
    pub ipv4_enabled: bool,

    /// Send to peers over IPv6 when they advertise an address.
    #[serde(default)]
    pub ipv6_enabled: bool,

    /// This node's overlay address; written into the address field of every
    /// outbound payload.
    #[serde(default = "default_private_ip")]
    pub private_ip: Ipv4Addr,

    /// Public IPv4 address advertised for this node.
    #[serde(default)]
    pub public_ipv4: Option<Ipv4Addr>,

    /// Public IPv6 address advertised for this node.
    #[serde(default)]
    pub public_ipv6: Option<Ipv6Addr>,

    /// TUN interface name.
    #[serde(default = "default_device_name")]
    pub device_name: String,

    /// TUN MTU.
    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// Directory holding the control socket and the instance lock.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Networks whose peers are considered trusted.
    #[serde(default)]
    pub trusted_networks: Vec<Ipv4Net>,

    /// Overlay address space.
    #[serde(default)]
    pub network: NetworkConfig,

    /// How long pipelines get to drain after a stop request.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Pause between worker spawns, in milliseconds.
    #[serde(default = "default_spawn_delay_ms")]
    pub spawn_delay_ms: u64,

    /// Interval between aggregator reports, in seconds. Zero disables them.
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,

    /// Worker executable. Defaults to `tunnel-rs-mesh-worker` next to the
    /// master binary.
    #[serde(default)]
    pub worker_binary: Option<PathBuf>,

    /// Peers seeded into the mapping datastore.
    #[serde(default)]
    pub peers: Vec<MappingRecord>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queues_per_worker: default_queues_per_worker(),
            listen_addr: None,
            listen_port: DEFAULT_PEER_PORT,
            ipv4_enabled: true,
            ipv6_enabled: false,
            private_ip: DEFAULT_PRIVATE_IP,
            public_ipv4: None,
            public_ipv6: None,
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            mtu: DEFAULT_MTU,
            data_dir: default_data_dir(),
            trusted_networks: vec![],
            network: NetworkConfig::default(),
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
            spawn_delay_ms: DEFAULT_SPAWN_DELAY_MS,
            stats_interval_secs: DEFAULT_STATS_INTERVAL_SECS,
            worker_binary: None,
            peers: vec![],
        }
    }
}

impl Config {
    /// Check the configuration for values the data-plane cannot run with.
    pub fn validate(&self) -> MeshResult<()> {
        if self.workers == 0 {
            return Err(MeshError::Config("workers must be at least 1".into()));
        }
        if self.queues_per_worker == 0 {
            return Err(MeshError::Config(
                "queues_per_worker must be at least 1".into(),
            ));
        }
        if !self.ipv4_enabled && !self.ipv6_enabled {
            return Err(MeshError::Config(
                "at least one of ipv4_enabled or ipv6_enabled must be set".into(),
            ));
        }
        if let Some(IpAddr::V4(addr)) = self.listen_addr {
            if self.ipv6_enabled {
                return Err(MeshError::Config(format!(
                    "listen_addr {} is IPv4 but ipv6_enabled is set",
                    addr
                )));
            }
        }
        if !self.network.contains(self.private_ip) {
            return Err(MeshError::Config(format!(
                "private_ip {} is outside the overlay network {}",
                self.private_ip,
                self.network.network()
            )));
        }
        if self.device_name.is_empty() || self.device_name.len() >= libc::IFNAMSIZ {
            return Err(MeshError::Config(format!(
                "device_name '{}' must be 1-{} characters",
                self.device_name,
                libc::IFNAMSIZ - 1
            )));
        }
        if self.mtu < 576 {
            return Err(MeshError::Config(format!(
                "mtu {} is below the IPv4 minimum of 576",
                self.mtu
            )));
        }

        let mut seen = HashSet::new();
        for peer in &self.peers {
            if !seen.insert(peer.private_ip) {
                return Err(MeshError::Config(format!(
                    "duplicate peer {}",
                    peer.private_ip
                )));
            }
            if peer.ipv4.is_none() && peer.ipv6.is_none() {
                return Err(MeshError::Config(format!(
                    "peer {} has neither ipv4 nor ipv6",
                    peer.private_ip
                )));
            }
            PeerKey::from_base64(&peer.key).map_err(|e| {
                MeshError::Config(format!("peer {}: {}", peer.private_ip, e))
            })?;
        }
        Ok(())
    }

    /// Total queues of each kind the master provisions.
    pub fn total_queues(&self) -> usize {
        self.workers * self.queues_per_worker
    }

    /// Address every socket queue binds to.
    pub fn listen_sockaddr(&self) -> SocketAddr {
        let ip = self.listen_addr.unwrap_or(if self.ipv6_enabled {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        });
        SocketAddr::new(ip, self.listen_port)
    }

    /// Path of the master's control channel socket.
    pub fn control_socket_path(&self) -> PathBuf {
        self.data_dir.join(CONTROL_SOCKET_NAME)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn spawn_delay(&self) -> Duration {
        Duration::from_millis(self.spawn_delay_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    /// Advertised public addresses for the startup summary, `none` when
    /// neither family is set.
    pub fn public_addresses(&self) -> String {
        let addresses: Vec<String> = self
            .public_ipv4
            .map(|ip| ip.to_string())
            .into_iter()
            .chain(self.public_ipv6.map(|ip| ip.to_string()))
            .collect();
        if addresses.is_empty() {
            "none".to_string()
        } else {
            addresses.join(", ")
        }
    }

    /// Returns true if `ip` falls inside one of the trusted networks.
    pub fn is_trusted(&self, ip: Ipv4Addr) -> bool {
        crate::workers::is_trusted(&self.trusted_networks, ip)
    }
}

// Default value functions for serde
fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_queues_per_worker() -> usize {
    1
}

fn default_listen_port() -> u16 {
    DEFAULT_PEER_PORT
}

fn default_true() -> bool {
    true
}

fn default_private_ip() -> Ipv4Addr {
    DEFAULT_PRIVATE_IP
}

fn default_device_name() -> String {
    DEFAULT_DEVICE_NAME.to_string()
}

fn default_mtu() -> u16 {
    DEFAULT_MTU
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("tunnel-mesh"))
        .unwrap_or_else(|| PathBuf::from("/var/lib/tunnel-mesh"))
}

fn default_shutdown_grace_secs() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_SECS
}

fn default_spawn_delay_ms() -> u64 {
    DEFAULT_SPAWN_DELAY_MS
}

fn default_stats_interval_secs() -> u64 {
    DEFAULT_STATS_INTERVAL_SECS
}

// ============================================================================
// Config Loading
// ============================================================================

/// Expand a leading `~` to the home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    if let Some(stripped) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    } else if path_str == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    path.to_path_buf()
}

/// Resolve the default config path (~/.config/tunnel-rs/mesh.toml).
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".config").join("tunnel-rs").join("mesh.toml"))
}

/// Parse a configuration from TOML text.
pub fn parse_config(content: &str) -> Result<Config> {
    let mut config: Config = toml::from_str(content).context("Failed to parse config")?;
    config.data_dir = expand_tilde(&config.data_dir);
    config.worker_binary = config.worker_binary.map(|p| expand_tilde(&p));
    Ok(config)
}

/// Load configuration from an explicit path, or from the default location.
///
/// - `path`: Some(path) loads from the specified path (tilde-expanded)
/// - `path`: None loads from ~/.config/tunnel-rs/mesh.toml if it exists,
///   otherwise returns the defaults
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let config_path = match path {
        Some(p) => expand_tilde(p),
        None => match default_config_path() {
            Some(p) if p.exists() => p,
            _ => {
                log::info!("No config file found, using defaults");
                return Ok(Config::default());
            }
        },
    };
    let content = std::fs::read_to_string(&config_path)
        .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;
    parse_config(&content)
        .with_context(|| format!("Failed to parse config file: {}", config_path.display()))
}

/// Load a persisted network configuration (JSON).
pub fn load_network_config(path: &Path) -> Result<NetworkConfig> {
    let path = expand_tilde(path);
    let data = std::fs::read(&path)
        .with_context(|| format!("Failed to read network config: {}", path.display()))?;
    NetworkConfig::parse(&data)
        .with_context(|| format!("Invalid network config: {}", path.display()))
}
