//! Persistent peer cache.
//!
//! The whole table serializes as a tagged map with eight fixed field ids so
//! older dumps stay readable as the format grows; new fields may only be
//! appended at higher ids. Bucket contents are written for compatibility and
//! inspection but are never read back on reload: the node's own address may
//! have changed between runs, so every restored record re-derives its bucket
//! indexes from the current hasher and re-enters through the normal insert
//! path. Records that fail to decode or to re-insert are discarded, never
//! fatal.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::PoisonError;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::address::{Address, Uri};
use crate::clock::Timestamp;
use crate::error::TableError;
use crate::peer::{read_peer, PeerInfo};
use crate::table::{DesiredState, KademliaTable, TableState};

/// On-disk form of the table. The serde rename strings are the wire-visible
/// field ids; changing them breaks previously persisted state.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct TableRecord {
    #[serde(rename = "1", default)]
    pub by_logarithm: Vec<Vec<PeerInfo>>,
    #[serde(rename = "2", default)]
    pub by_hamming: Vec<Vec<PeerInfo>>,
    #[serde(rename = "3", default)]
    pub known_peers: HashMap<Address, PeerInfo>,
    #[serde(rename = "4", default)]
    pub known_uris: HashMap<Uri, PeerInfo>,
    #[serde(rename = "5", default)]
    pub connection_expiry: HashMap<Address, Timestamp>,
    #[serde(rename = "6", default)]
    pub desired_uri_expiry: HashMap<Uri, Timestamp>,
    #[serde(rename = "7", default)]
    pub desired_peers: Vec<Address>,
    #[serde(rename = "8", default)]
    pub desired_uris: Vec<Uri>,
}

impl KademliaTable {
    /// Remember where [`dump`](Self::dump) and [`load`](Self::load) should
    /// look. Setting the path has no other effect.
    pub fn set_cache_file(&self, path: impl Into<PathBuf>) {
        let mut cache_file = self
            .cache_file
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *cache_file = Some(path.into());
    }

    fn cache_path(&self) -> Option<PathBuf> {
        self.cache_file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Write the entire table to the cache file.
    ///
    /// In-memory state is untouched whether or not the write succeeds. A
    /// table without a cache file configured skips the dump silently.
    pub fn dump(&self) -> Result<(), TableError> {
        let Some(path) = self.cache_path() else {
            debug!(table = %self.logging_name, "no cache file configured, dump skipped");
            return Ok(());
        };
        let record = self.export_record();
        let blob = serde_json::to_vec(&record)?;
        std::fs::write(&path, blob)?;
        debug!(
            table = %self.logging_name,
            path = %path.display(),
            peers = record.known_peers.len(),
            "peer table dumped"
        );
        Ok(())
    }

    /// Replace the in-memory state with the cache file's contents.
    ///
    /// The table is reset to freshly-constructed state before the file is
    /// touched, so a read or decode failure leaves it empty rather than
    /// half-restored. A table without a cache file configured skips the load
    /// silently.
    pub fn load(&self) -> Result<(), TableError> {
        let Some(path) = self.cache_path() else {
            debug!(table = %self.logging_name, "no cache file configured, load skipped");
            return Ok(());
        };

        {
            let mut state = self.state();
            *state = TableState::new();
        }
        {
            let mut desired = self.desired();
            *desired = DesiredState::default();
        }

        let blob = std::fs::read(&path)?;
        let record: TableRecord = serde_json::from_slice(&blob)?;
        self.import_record(record);
        Ok(())
    }

    fn export_record(&self) -> TableRecord {
        let snapshot_bucket =
            |bucket: &crate::bucket::Bucket| bucket.iter().map(|ptr| read_peer(ptr).clone()).collect();

        let state = self.state();
        let mut record = TableRecord {
            by_logarithm: state.by_logarithm.iter().map(snapshot_bucket).collect(),
            by_hamming: state.by_hamming.iter().map(snapshot_bucket).collect(),
            known_peers: state
                .known_peers
                .iter()
                .map(|(address, ptr)| (address.clone(), read_peer(ptr).clone()))
                .collect(),
            known_uris: state
                .known_uris
                .iter()
                .map(|(uri, ptr)| (uri.clone(), read_peer(ptr).clone()))
                .collect(),
            ..TableRecord::default()
        };

        // state → desired is the sanctioned lock order.
        let desired = self.desired();
        record.connection_expiry = desired.connection_expiry.clone();
        record.desired_uri_expiry = desired.desired_uri_expiry.clone();
        record.desired_peers = desired.desired_peers.clone();
        record.desired_uris = desired.desired_uris.clone();
        record
    }

    fn import_record(&self, record: TableRecord) {
        let mut restored = 0usize;
        let mut discarded = 0usize;

        // The KNOWN_PEERS field is authoritative; the bucket fields carry
        // stale indexes whenever the own address changed. Oldest first, so
        // re-insertion reproduces the most-recently-live bucket order.
        let mut records: Vec<(Address, PeerInfo)> = record.known_peers.into_iter().collect();
        records.sort_by_key(|(_, info)| info.last_seen);

        {
            let mut state = self.state();
            for (key, info) in records {
                if key != info.address || info.address.is_empty() {
                    discarded += 1;
                    warn!(
                        table = %self.logging_name,
                        key = %key.short(),
                        "malformed cached peer record discarded"
                    );
                    continue;
                }
                if info.address == self.own_address {
                    discarded += 1;
                    continue;
                }
                match self.insert_peer_locked(&mut state, info) {
                    Some(_) => restored += 1,
                    None => discarded += 1,
                }
            }
        }

        {
            let mut desired = self.desired();
            desired.connection_expiry = record.connection_expiry;
            desired.desired_uri_expiry = record.desired_uri_expiry;
            for address in record.desired_peers {
                if !desired.desired_peers.contains(&address) {
                    desired.desired_peers.push(address);
                }
            }
            for uri in record.desired_uris {
                if !desired.desired_uris.contains(&uri) {
                    desired.desired_uris.push(uri);
                }
            }
        }

        debug!(
            table = %self.logging_name,
            restored,
            discarded,
            "peer table loaded from cache"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::NetworkId;

    #[test]
    fn record_serializes_under_fixed_field_ids() {
        let table = KademliaTable::new(Address::new(vec![1u8; 32]), NetworkId::from_tag(*b"TEST"));
        let peer = Address::new(vec![2u8; 32]);
        table.report_existence(
            PeerInfo::new(peer.clone()).with_uri(Uri::new("tcp://127.0.0.1:9000")),
            &peer,
        );
        table.add_desired_peer(peer.clone(), std::time::Duration::from_secs(60));

        let record = table.export_record();
        let value = serde_json::to_value(&record).unwrap();
        let map = value.as_object().unwrap();

        for id in 1..=8 {
            assert!(map.contains_key(&id.to_string()), "field id {id} missing");
        }
        assert_eq!(map.len(), 8);
        assert_eq!(map["1"].as_array().unwrap().len(), 161);

        let key = peer.to_string();
        let cached = map["3"].get(&key).unwrap();
        for field in [
            "address",
            "uri",
            "liveness",
            "last_seen",
            "verified",
            "last_reporter",
            "trust_rank",
        ] {
            assert!(cached.get(field).is_some(), "peer field {field} missing");
        }
        assert!(cached.get("kademlia_address").is_none());
    }

    #[test]
    fn import_discards_mismatched_and_own_records() {
        let own = Address::new(vec![9u8; 32]);
        let table = KademliaTable::new(own.clone(), NetworkId::from_tag(*b"TEST"));

        let good = Address::new(vec![1u8; 32]);
        let mut record = TableRecord::default();
        record
            .known_peers
            .insert(good.clone(), PeerInfo::new(good.clone()));
        // Key disagrees with the record's own address.
        record.known_peers.insert(
            Address::new(vec![2u8; 32]),
            PeerInfo::new(Address::new(vec![3u8; 32])),
        );
        // The node itself must never re-enter its own table.
        record.known_peers.insert(own.clone(), PeerInfo::new(own.clone()));

        table.import_record(record);
        assert_eq!(table.size(), 1);
        assert!(table.get_peer_details(&good).is_some());
    }
}
