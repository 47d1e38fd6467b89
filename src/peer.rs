//! Peer records and the shared handles the table hands around.
//!
//! One [`PeerInfo`] may be referenced from up to four collections at once:
//! both bucket arrays plus the address and URI indexes. The collections hold
//! [`PeerInfoPtr`] handles to the same record, never copies; the record is
//! released when the last handle drops. All mutation happens while the
//! table's state lock is held.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use crate::address::{Address, KademliaAddress, Uri};
use crate::clock::Timestamp;

/// Shared handle to a peer record.
pub type PeerInfoPtr = Arc<RwLock<PeerInfo>>;

/// Everything the table knows about one peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Wire identity of the peer.
    pub address: Address,

    /// Hashed form used for distance math. Derived by the table against its
    /// own hasher on ingest and after reload; never trusted from a report or
    /// from disk.
    #[serde(skip)]
    pub kademlia_address: KademliaAddress,

    /// Canonical reachable endpoint, when one is known.
    #[serde(default)]
    pub uri: Option<Uri>,

    /// The peer that most recently vouched for this one. Stored as an
    /// address, not a handle; reporter records are looked up through the
    /// table on demand so dumped state stays acyclic.
    #[serde(default)]
    pub last_reporter: Address,

    /// True once this node has directly interacted with the peer, as opposed
    /// to hearing about it from a third party.
    #[serde(default)]
    pub verified: bool,

    /// Bounded score of recent successful interactions. Drives eviction
    /// ordering; saturates at the table's configured ceiling.
    #[serde(default)]
    pub liveness: u64,

    /// Instant of the last positive signal.
    #[serde(default)]
    pub last_seen: Timestamp,

    /// Reserved tie-breaking field; persisted but not yet consulted.
    #[serde(default)]
    pub trust_rank: u64,
}

impl PeerInfo {
    /// A fresh record for a newly heard-of peer. The Kademlia address is
    /// filled in by the table when the record is ingested.
    pub fn new(address: Address) -> Self {
        Self {
            address,
            kademlia_address: KademliaAddress::default(),
            uri: None,
            last_reporter: Address::default(),
            verified: false,
            liveness: 0,
            last_seen: 0,
            trust_rank: 0,
        }
    }

    pub fn with_uri(mut self, uri: Uri) -> Self {
        self.uri = Some(uri);
        self
    }

    pub fn with_liveness(mut self, liveness: u64) -> Self {
        self.liveness = liveness;
        self
    }

    pub fn with_last_seen(mut self, last_seen: Timestamp) -> Self {
        self.last_seen = last_seen;
        self
    }
}

/// Read a shared peer record, recovering from a poisoned lock.
///
/// A reporter thread that panicked mid-update must not wedge the rest of the
/// overlay; the record is still internally consistent because every field
/// write is a single store.
pub(crate) fn read_peer(ptr: &PeerInfoPtr) -> RwLockReadGuard<'_, PeerInfo> {
    ptr.read().unwrap_or_else(PoisonError::into_inner)
}

/// Write a shared peer record, recovering from a poisoned lock.
pub(crate) fn write_peer(ptr: &PeerInfoPtr) -> RwLockWriteGuard<'_, PeerInfo> {
    ptr.write().unwrap_or_else(PoisonError::into_inner)
}

/// Wrap a record into a shareable handle.
pub(crate) fn share_peer(info: PeerInfo) -> PeerInfoPtr {
    Arc::new(RwLock::new(info))
}

// ============================================================================
// Ping correlation tokens
// ============================================================================

/// Short opaque token returned by a ping, echoed back in the matching pong so
/// callers can correlate the two.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct VerificationToken([u8; 8]);

impl VerificationToken {
    pub(crate) fn generate() -> Self {
        Self(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Display for VerificationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for VerificationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VerificationToken({})", hex::encode(self.0))
    }
}
