use std::sync::Arc;

use kademlia_routing::{
    Address, AddressHasher, KademliaAddress, KademliaTable, ManualClock, NetworkId, PeerInfo,
    TableConfig, KADEMLIA_ID_BYTES,
};

/// Copies the identity bytes straight into the Kademlia space, zero padded,
/// so tests can place peers in chosen buckets.
pub struct PrefixHasher;

impl AddressHasher for PrefixHasher {
    fn hash(&self, address: &Address) -> KademliaAddress {
        let mut out = [0u8; KADEMLIA_ID_BYTES];
        let bytes = address.as_bytes();
        let len = bytes.len().min(KADEMLIA_ID_BYTES);
        out[..len].copy_from_slice(&bytes[..len]);
        KademliaAddress::from_bytes(out)
    }
}

/// A full-width address with a chosen leading byte (fixes the logarithmic
/// class against an all-zero own address) and a trailing tag byte.
pub fn make_address(first: u8, tag: u8) -> Address {
    let mut bytes = vec![0u8; KADEMLIA_ID_BYTES];
    bytes[0] = first;
    bytes[KADEMLIA_ID_BYTES - 1] = tag;
    Address::new(bytes)
}

pub fn peer(address: &Address, liveness: u64) -> PeerInfo {
    PeerInfo::new(address.clone()).with_liveness(liveness)
}

pub struct TestTable {
    pub table: KademliaTable,
    pub clock: Arc<ManualClock>,
}

pub fn test_table(own: Address) -> TestTable {
    test_table_with(own, TableConfig::default())
}

pub fn test_table_with(own: Address, config: TableConfig) -> TestTable {
    let clock = Arc::new(ManualClock::starting_at(1));
    let table = KademliaTable::with_parts(
        own,
        NetworkId::from_tag(*b"TEST"),
        config,
        Arc::new(PrefixHasher),
        clock.clone(),
    );
    TestTable { table, clock }
}
