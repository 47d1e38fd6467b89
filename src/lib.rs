//! # Kademlia routing
//!
//! This crate implements the routing table at the navigational core of a
//! peer-to-peer overlay: a bounded, bucket-partitioned view of the global
//! address space with liveness scoring, dual distance metrics, operator
//! pinned "desired peers", and a persistent peer cache. Every outbound
//! connection decision and every closest-peer query of an iterative lookup
//! consults it; the table itself never initiates I/O.
//!
//! The crate is split into a handful of modules that can be reused
//! independently:
//!
//! - [`address`]: wire identities, endpoint URIs, the 160-bit
//!   [`KademliaAddress`] space with XOR / logarithmic / Hamming distance, and
//!   the [`AddressHasher`] seam (SHA-1 in production).
//! - [`peer`]: the shared [`PeerInfo`] record referenced from both bucket
//!   arrays and both lookup indexes.
//! - [`table`]: the [`KademliaTable`] itself: reports, lookups, desired
//!   peers, and connection proposals, all behind two documented locks.
//! - [`clock`]: the [`Clock`] seam so tests drive a virtual clock.
//! - [`error`]: the persistence error surface; everything else in the table
//!   treats "not found" and "bucket full" as ordinary outcomes.
//!
//! ## Getting started
//!
//! Construct a table with the node's own identity, feed it reports from the
//! transport, and ask it for routing candidates:
//!
//! ```
//! use kademlia_routing::{Address, KademliaTable, NetworkId, PeerInfo, Uri};
//!
//! let own = Address::new(vec![0u8; 32]);
//! let table = KademliaTable::new(own, NetworkId::from_tag(*b"MAIN"));
//!
//! let peer = Address::new(vec![1u8; 32]);
//! let info = PeerInfo::new(peer.clone()).with_uri(Uri::new("tcp://127.0.0.1:9000"));
//! table.report_existence(info, &peer);
//!
//! let closest = table.find_peer(&peer);
//! assert_eq!(closest.len(), 1);
//! assert_eq!(closest[0].address, peer);
//! ```
//!
//! For liveness-driven maintenance, transport threads call
//! [`KademliaTable::report_liveliness`] and
//! [`KademliaTable::report_failure`] as interactions succeed or fail, while
//! a peer-tracker thread periodically asks
//! [`KademliaTable::propose_permanent_connections`] which sockets to keep
//! open. [`KademliaTable::dump`] and [`KademliaTable::load`] carry the whole
//! view across restarts.

pub mod address;
pub mod clock;
pub mod error;
pub mod peer;
pub mod table;

mod bucket;
mod persist;

pub use address::{
    Address, AddressHasher, KademliaAddress, NetworkId, Sha1AddressHasher, Uri, KADEMLIA_ID_BITS,
    KADEMLIA_ID_BYTES,
};
pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use error::TableError;
pub use peer::{PeerInfo, PeerInfoPtr, VerificationToken};
pub use table::{
    KademliaTable, TableConfig, TableStats, DEFAULT_MAX_LIVENESS, DEFAULT_MAX_PEERS_PER_BUCKET,
};
