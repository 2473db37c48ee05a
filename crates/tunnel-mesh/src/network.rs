//! Overlay address space description.
//!
//! A [`NetworkConfig`] is produced once on the master (from persisted JSON
//! bytes or [`NetworkConfig::default`]) and shipped to workers as part of the
//! synced configuration snapshot. The derived fields are recomputed on every
//! parse and never serialized.

use crate::error::{MeshError, MeshResult};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;

/// Default overlay network.
pub const DEFAULT_NETWORK: &str = "10.99.0.0/16";

/// Default reserved static range.
pub const DEFAULT_STATIC_RANGE: &str = "10.99.0.0/23";

/// Lease time used when the field is absent or zero.
pub const DEFAULT_LEASE_TIME: Duration = Duration::from_secs(48 * 60 * 60);

/// Serialized form: `{"network": ..., "staticRange": ..., "leaseTime": <secs>}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawNetworkConfig {
    network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    static_range: Option<String>,
    #[serde(default)]
    lease_time: u64,
}

/// Validated overlay network configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawNetworkConfig", into = "RawNetworkConfig")]
pub struct NetworkConfig {
    network: String,
    static_range: Option<String>,
    lease_time: Duration,
    base_ip: Ipv4Addr,
    ip_net: Ipv4Net,
    static_net: Option<Ipv4Net>,
}

impl NetworkConfig {
    /// Build and validate a configuration.
    ///
    /// A zero `lease_time` is replaced with [`DEFAULT_LEASE_TIME`]. An empty
    /// `static_range` is treated as absent.
    pub fn new(
        network: &str,
        static_range: Option<&str>,
        lease_time: Duration,
    ) -> MeshResult<Self> {
        let (base_ip, ip_net) = parse_cidr(network)?;

        let static_range = static_range.filter(|s| !s.is_empty());
        let static_net = match static_range {
            Some(range) => {
                let (_, static_net) = parse_cidr(range)?;
                if !ip_net.contains(&static_net) {
                    return Err(MeshError::StaticRangeOutsideNetwork {
                        network: network.to_string(),
                        static_range: range.to_string(),
                    });
                }
                Some(static_net)
            }
            None => None,
        };

        let lease_time = if lease_time.is_zero() {
            DEFAULT_LEASE_TIME
        } else {
            lease_time
        };

        Ok(Self {
            network: network.to_string(),
            static_range: static_range.map(str::to_string),
            lease_time,
            base_ip,
            ip_net,
            static_net,
        })
    }

    /// Parse the persisted JSON representation.
    pub fn parse(data: &[u8]) -> MeshResult<Self> {
        let raw: RawNetworkConfig = serde_json::from_slice(data)?;
        Self::try_from(raw)
    }

    /// JSON representation of the configuration. Derived fields are omitted.
    pub fn to_bytes(&self) -> MeshResult<Vec<u8>> {
        Ok(serde_json::to_vec(&RawNetworkConfig::from(self.clone()))?)
    }

    /// The overlay network CIDR as configured.
    pub fn network(&self) -> &str {
        &self.network
    }

    /// The reserved static range as configured, if any.
    pub fn static_range(&self) -> Option<&str> {
        self.static_range.as_deref()
    }

    /// How long an assigned lease is held.
    pub fn lease_time(&self) -> Duration {
        self.lease_time
    }

    /// The address part of the network CIDR exactly as written.
    pub fn base_ip(&self) -> Ipv4Addr {
        self.base_ip
    }

    /// The overlay network, host bits cleared.
    pub fn ip_net(&self) -> Ipv4Net {
        self.ip_net
    }

    /// The reserved static range, host bits cleared.
    pub fn static_net(&self) -> Option<Ipv4Net> {
        self.static_net
    }

    /// Returns true if `ip` belongs to the overlay network.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.ip_net.contains(&ip)
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self::new(DEFAULT_NETWORK, Some(DEFAULT_STATIC_RANGE), DEFAULT_LEASE_TIME)
            .expect("default network configuration is valid")
    }
}

impl TryFrom<RawNetworkConfig> for NetworkConfig {
    type Error = MeshError;

    fn try_from(raw: RawNetworkConfig) -> MeshResult<Self> {
        Self::new(
            &raw.network,
            raw.static_range.as_deref(),
            Duration::from_secs(raw.lease_time),
        )
    }
}

impl From<NetworkConfig> for RawNetworkConfig {
    fn from(cfg: NetworkConfig) -> Self {
        Self {
            network: cfg.network,
            static_range: cfg.static_range,
            lease_time: cfg.lease_time.as_secs(),
        }
    }
}

impl fmt::Display for NetworkConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_bytes() {
            Ok(bytes) => f.write_str(&String::from_utf8_lossy(&bytes)),
            Err(_) => Ok(()),
        }
    }
}

/// Parse `a.b.c.d/len` into the address as written and the masked network.
fn parse_cidr(cidr: &str) -> MeshResult<(Ipv4Addr, Ipv4Net)> {
    let net = Ipv4Net::from_str(cidr.trim()).map_err(|e| MeshError::InvalidCidr {
        cidr: cidr.to_string(),
        reason: e.to_string(),
    })?;
    Ok((net.addr(), net.trunc()))
}
