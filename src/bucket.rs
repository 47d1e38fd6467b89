//! A single distance-class bucket.
//!
//! Holds up to K peers sharing one distance class, ordered most-recently-live
//! first. When full, a candidate displaces the weakest entry (lowest
//! liveness, then oldest last-seen) only by strict improvement; otherwise it
//! is dropped, which is ordinary Kademlia behavior.

use std::collections::VecDeque;

use crate::address::Address;
use crate::clock::Timestamp;
use crate::peer::{read_peer, PeerInfoPtr};

/// Result of offering a peer to a bucket.
#[derive(Debug)]
pub(crate) enum InsertOutcome {
    /// The peer was added (or was already present and got refreshed).
    Inserted,
    /// The bucket was full; the carried peer was evicted to make room.
    Replaced(PeerInfoPtr),
    /// The bucket was full and the candidate lost the eviction contest.
    Rejected,
}

#[derive(Default)]
pub(crate) struct Bucket {
    /// Freshest first; the eviction candidate is wherever the weakest
    /// (liveness, last_seen) pair sits, not necessarily the back.
    peers: VecDeque<PeerInfoPtr>,
}

impl Bucket {
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.position(address).is_some()
    }

    fn position(&self, address: &Address) -> Option<usize> {
        self.peers
            .iter()
            .position(|ptr| read_peer(ptr).address == *address)
    }

    /// Move a peer to the front, marking it most recently live. Returns false
    /// when the peer is not in this bucket.
    pub fn touch(&mut self, address: &Address) -> bool {
        match self.position(address) {
            Some(0) => true,
            Some(index) => {
                let ptr = self.peers.remove(index).expect("position was just found");
                self.peers.push_front(ptr);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, address: &Address) -> Option<PeerInfoPtr> {
        let index = self.position(address)?;
        self.peers.remove(index)
    }

    /// Whether a candidate with the given (liveness, last_seen) score would
    /// be admitted right now. Lets the table check both distance views
    /// before it mutates either.
    pub fn would_accept(&self, score: (u64, Timestamp), capacity: usize) -> bool {
        if self.peers.len() < capacity {
            return true;
        }
        match self.weakest_index() {
            Some(index) => {
                let weakest = read_peer(&self.peers[index]);
                score > (weakest.liveness, weakest.last_seen)
            }
            None => false,
        }
    }

    /// Offer a peer to the bucket, applying the eviction policy when full.
    pub fn insert(&mut self, ptr: PeerInfoPtr, capacity: usize) -> InsertOutcome {
        let (address, score) = {
            let peer = read_peer(&ptr);
            (peer.address.clone(), (peer.liveness, peer.last_seen))
        };

        if self.touch(&address) {
            return InsertOutcome::Inserted;
        }

        if self.peers.len() < capacity {
            self.peers.push_front(ptr);
            return InsertOutcome::Inserted;
        }

        let Some(weakest_index) = self.weakest_index() else {
            return InsertOutcome::Rejected;
        };
        let weakest_score = {
            let peer = read_peer(&self.peers[weakest_index]);
            (peer.liveness, peer.last_seen)
        };

        // Strict improvement only: higher liveness, or same liveness seen
        // more recently.
        if score > weakest_score {
            let evicted = self
                .peers
                .remove(weakest_index)
                .expect("weakest index is in range");
            self.peers.push_front(ptr);
            InsertOutcome::Replaced(evicted)
        } else {
            InsertOutcome::Rejected
        }
    }

    fn weakest_index(&self) -> Option<usize> {
        self.peers
            .iter()
            .enumerate()
            .min_by_key(|(_, ptr)| {
                let peer = read_peer(ptr);
                (peer.liveness, peer.last_seen)
            })
            .map(|(index, _)| index)
    }

    /// The entry with the highest liveness, ties to the most recently seen.
    pub fn strongest(&self) -> Option<PeerInfoPtr> {
        self.peers
            .iter()
            .max_by_key(|ptr| {
                let peer = read_peer(ptr);
                (peer.liveness, peer.last_seen)
            })
            .cloned()
    }

    /// Iterate handles freshest first.
    pub fn iter(&self) -> impl Iterator<Item = &PeerInfoPtr> {
        self.peers.iter()
    }
}

/// Sort key helper shared by tests.
#[cfg(test)]
fn scores(bucket: &Bucket) -> Vec<(u64, Timestamp)> {
    bucket
        .iter()
        .map(|ptr| {
            let peer = read_peer(ptr);
            (peer.liveness, peer.last_seen)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{share_peer, PeerInfo};

    fn entry(tag: u8, liveness: u64, last_seen: Timestamp) -> PeerInfoPtr {
        share_peer(
            PeerInfo::new(Address::new(vec![tag]))
                .with_liveness(liveness)
                .with_last_seen(last_seen),
        )
    }

    #[test]
    fn fresh_inserts_land_at_the_front() {
        let mut bucket = Bucket::default();
        assert!(matches!(
            bucket.insert(entry(1, 0, 10), 4),
            InsertOutcome::Inserted
        ));
        assert!(matches!(
            bucket.insert(entry(2, 0, 20), 4),
            InsertOutcome::Inserted
        ));

        assert_eq!(scores(&bucket), vec![(0, 20), (0, 10)]);
    }

    #[test]
    fn reoffering_a_known_peer_refreshes_instead_of_duplicating() {
        let mut bucket = Bucket::default();
        bucket.insert(entry(1, 0, 10), 4);
        bucket.insert(entry(2, 0, 20), 4);

        assert!(matches!(
            bucket.insert(entry(1, 5, 30), 4),
            InsertOutcome::Inserted
        ));
        assert_eq!(bucket.len(), 2);
        // The original record moved to the front; the re-offered copy's
        // fields are not merged here (that is the table's job).
        assert_eq!(scores(&bucket)[0], (0, 10));
    }

    #[test]
    fn full_bucket_evicts_the_weakest_for_a_stronger_candidate() {
        let mut bucket = Bucket::default();
        bucket.insert(entry(1, 3, 10), 3);
        bucket.insert(entry(2, 1, 20), 3);
        bucket.insert(entry(3, 2, 30), 3);

        let outcome = bucket.insert(entry(4, 2, 40), 3);
        let InsertOutcome::Replaced(evicted) = outcome else {
            panic!("expected eviction, got {outcome:?}");
        };
        assert_eq!(read_peer(&evicted).address, Address::new(vec![2]));
        assert_eq!(bucket.len(), 3);
    }

    #[test]
    fn full_bucket_rejects_a_weaker_candidate() {
        let mut bucket = Bucket::default();
        bucket.insert(entry(1, 3, 10), 2);
        bucket.insert(entry(2, 2, 20), 2);

        assert!(matches!(
            bucket.insert(entry(3, 2, 5), 2),
            InsertOutcome::Rejected
        ));
        assert!(matches!(
            bucket.insert(entry(4, 1, 99), 2),
            InsertOutcome::Rejected
        ));
        assert_eq!(bucket.len(), 2);
    }

    #[test]
    fn equal_liveness_ties_break_on_recency() {
        let mut bucket = Bucket::default();
        bucket.insert(entry(1, 1, 10), 1);

        let outcome = bucket.insert(entry(2, 1, 11), 1);
        assert!(matches!(outcome, InsertOutcome::Replaced(_)));

        // Same liveness, same instant: no strict improvement.
        assert!(matches!(
            bucket.insert(entry(3, 1, 11), 1),
            InsertOutcome::Rejected
        ));
    }

    #[test]
    fn touch_moves_to_front_and_remove_unlinks() {
        let mut bucket = Bucket::default();
        bucket.insert(entry(1, 0, 10), 4);
        bucket.insert(entry(2, 0, 20), 4);
        bucket.insert(entry(3, 0, 30), 4);

        assert!(bucket.touch(&Address::new(vec![1])));
        assert_eq!(scores(&bucket)[0], (0, 10));

        assert!(!bucket.touch(&Address::new(vec![9])));

        let removed = bucket.remove(&Address::new(vec![2]));
        assert!(removed.is_some());
        assert_eq!(bucket.len(), 2);
        assert!(!bucket.contains(&Address::new(vec![2])));
    }

    #[test]
    fn strongest_prefers_liveness_then_recency() {
        let mut bucket = Bucket::default();
        bucket.insert(entry(1, 2, 10), 4);
        bucket.insert(entry(2, 5, 5), 4);
        bucket.insert(entry(3, 5, 50), 4);

        let strongest = bucket.strongest().unwrap();
        assert_eq!(read_peer(&strongest).address, Address::new(vec![3]));
    }
}
