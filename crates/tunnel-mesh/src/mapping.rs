//! Peer routing and cryptographic records.

use crate::crypto::{Cipher, PeerKey};
use crate::error::{MeshError, MeshResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Default UDP port peers listen on.
pub const DEFAULT_PEER_PORT: u16 = 1099;

/// Serializable peer record, as stored by the datastore and sent over the
/// control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRecord {
    /// The peer's virtual address.
    pub private_ip: Ipv4Addr,
    /// Public IPv4 transport address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<Ipv4Addr>,
    /// Public IPv6 transport address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<Ipv6Addr>,
    /// UDP port the peer listens on.
    #[serde(default = "default_peer_port")]
    pub port: u16,
    /// Base64-encoded 32-byte symmetric key.
    pub key: String,
}

impl MappingRecord {
    /// Create a record for `private_ip` reachable over IPv4.
    pub fn new(private_ip: Ipv4Addr, ipv4: Ipv4Addr, port: u16, key: &PeerKey) -> Self {
        Self {
            private_ip,
            ipv4: Some(ipv4),
            ipv6: None,
            port,
            key: key.to_base64(),
        }
    }

    /// Add an IPv6 transport address.
    pub fn with_ipv6(mut self, ipv6: Ipv6Addr) -> Self {
        self.ipv6 = Some(ipv6);
        self
    }
}

/// A resolved peer: transport addresses plus a ready-to-use cipher.
///
/// Built fresh from a [`MappingRecord`] on every lookup; the pipelines never
/// cache it.
pub struct Mapping {
    private_ip: Ipv4Addr,
    sockaddr_v4: Option<SocketAddr>,
    sockaddr_v6: Option<SocketAddr>,
    cipher: Cipher,
}

impl Mapping {
    /// The peer's virtual address.
    pub fn private_ip(&self) -> Ipv4Addr {
        self.private_ip
    }

    /// IPv4 transport address, if the peer has one.
    pub fn sockaddr_v4(&self) -> Option<SocketAddr> {
        self.sockaddr_v4
    }

    /// IPv6 transport address, if the peer has one.
    pub fn sockaddr_v6(&self) -> Option<SocketAddr> {
        self.sockaddr_v6
    }

    /// Cipher bound to the peer key.
    pub fn cipher(&self) -> &Cipher {
        &self.cipher
    }

    /// Pick the transport address to reach the peer: IPv6 when both sides
    /// support it, else IPv4 when both sides support it.
    pub fn select_sockaddr(&self, ipv4_enabled: bool, ipv6_enabled: bool) -> Option<SocketAddr> {
        if ipv6_enabled && self.sockaddr_v6.is_some() {
            self.sockaddr_v6
        } else if ipv4_enabled && self.sockaddr_v4.is_some() {
            self.sockaddr_v4
        } else {
            None
        }
    }
}

impl TryFrom<MappingRecord> for Mapping {
    type Error = MeshError;

    fn try_from(record: MappingRecord) -> MeshResult<Self> {
        let key = PeerKey::from_base64(&record.key)?;
        let cipher = Cipher::new(&key)?;
        Ok(Self {
            private_ip: record.private_ip,
            sockaddr_v4: record
                .ipv4
                .map(|ip| SocketAddr::new(IpAddr::V4(ip), record.port)),
            sockaddr_v6: record
                .ipv6
                .map(|ip| SocketAddr::new(IpAddr::V6(ip), record.port)),
            cipher,
        })
    }
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("private_ip", &self.private_ip)
            .field("ipv4", &self.sockaddr_v4)
            .field("ipv6", &self.sockaddr_v6)
            .finish()
    }
}

fn default_peer_port() -> u16 {
    DEFAULT_PEER_PORT
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> MappingRecord {
        MappingRecord::new(
            Ipv4Addr::new(10, 99, 0, 5),
            Ipv4Addr::new(198, 51, 100, 7),
            1099,
            &PeerKey::generate(),
        )
    }

    #[test]
    fn test_sockaddrs_precomputed() {
        let mapping = Mapping::try_from(record().with_ipv6("2001:db8::7".parse().unwrap())).unwrap();
        assert_eq!(
            mapping.sockaddr_v4(),
            Some("198.51.100.7:1099".parse().unwrap())
        );
        assert_eq!(
            mapping.sockaddr_v6(),
            Some("[2001:db8::7]:1099".parse().unwrap())
        );
    }

    #[test]
    fn test_select_prefers_ipv6() {
        let mapping = Mapping::try_from(record().with_ipv6("2001:db8::7".parse().unwrap())).unwrap();
        assert_eq!(mapping.select_sockaddr(true, true), mapping.sockaddr_v6());
        assert_eq!(mapping.select_sockaddr(true, false), mapping.sockaddr_v4());
        assert_eq!(mapping.select_sockaddr(false, false), None);
    }

    #[test]
    fn test_select_falls_back_to_ipv4() {
        let mapping = Mapping::try_from(record()).unwrap();
        assert_eq!(mapping.select_sockaddr(true, true), mapping.sockaddr_v4());
        assert_eq!(mapping.select_sockaddr(false, true), None);
    }

    #[test]
    fn test_bad_key_rejected() {
        let mut bad = record();
        bad.key = "not-a-key".into();
        assert!(Mapping::try_from(bad).is_err());
    }

    #[test]
    fn test_record_json_shape() {
        let json = serde_json::to_string(&record()).unwrap();
        assert!(json.contains("\"private_ip\":\"10.99.0.5\""));
        assert!(!json.contains("ipv6"));

        let parsed: MappingRecord =
            serde_json::from_str(r#"{"private_ip":"10.99.0.9","key":"AAAA"}"#).unwrap();
        assert_eq!(parsed.port, DEFAULT_PEER_PORT);
        assert_eq!(parsed.ipv4, None);
    }
}
