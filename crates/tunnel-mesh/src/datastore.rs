//! Mapping datastore backing `DatastoreServer.Mapping`.

use crate::error::{MeshError, MeshResult};
use crate::mapping::MappingRecord;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory table of peer records keyed by private IP.
#[derive(Clone, Default)]
pub struct StaticDatastore {
    records: Arc<RwLock<HashMap<Ipv4Addr, MappingRecord>>>,
}

impl StaticDatastore {
    /// Create a datastore seeded with `peers`. Later duplicates win.
    pub fn new(peers: impl IntoIterator<Item = MappingRecord>) -> Self {
        let records = peers
            .into_iter()
            .map(|record| (record.private_ip, record))
            .collect();
        Self {
            records: Arc::new(RwLock::new(records)),
        }
    }

    /// Look up the record for `private_ip`.
    pub async fn mapping(&self, private_ip: Ipv4Addr) -> MeshResult<MappingRecord> {
        self.records
            .read()
            .await
            .get(&private_ip)
            .cloned()
            .ok_or_else(|| MeshError::MappingNotFound(private_ip.to_string()))
    }

    /// Number of records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PeerKey;

    fn record(last: u8) -> MappingRecord {
        MappingRecord::new(
            Ipv4Addr::new(10, 99, 0, last),
            Ipv4Addr::new(198, 51, 100, last),
            1099,
            &PeerKey::generate(),
        )
    }

    #[tokio::test]
    async fn test_lookup_hit_and_miss() {
        let store = StaticDatastore::new(vec![record(5), record(6)]);
        assert_eq!(store.len().await, 2);

        let hit = store.mapping(Ipv4Addr::new(10, 99, 0, 5)).await.unwrap();
        assert_eq!(hit.ipv4, Some(Ipv4Addr::new(198, 51, 100, 5)));

        let miss = store.mapping(Ipv4Addr::new(10, 99, 0, 9)).await.unwrap_err();
        assert!(matches!(miss, MeshError::MappingNotFound(_)));
    }

    #[tokio::test]
    async fn test_later_duplicate_wins_and_clones_share() {
        let store = StaticDatastore::default();
        assert!(store.is_empty().await);

        let mut moved = record(7);
        moved.ipv4 = Some(Ipv4Addr::new(203, 0, 113, 7));
        let store = StaticDatastore::new(vec![record(7), moved]);
        let shared = store.clone();
        assert_eq!(shared.len().await, 1);
        let hit = shared.mapping(Ipv4Addr::new(10, 99, 0, 7)).await.unwrap();
        assert_eq!(hit.ipv4, Some(Ipv4Addr::new(203, 0, 113, 7)));
    }
}
