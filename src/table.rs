//! The Kademlia peer table.
//!
//! [`KademliaTable`] is the navigational core of the overlay: it remembers
//! known peers in two parallel bucket arrays (one per distance metric),
//! answers closest-peer queries for iterative lookup, scores liveness, and
//! tracks the operator's desired peers. It never initiates I/O of its own;
//! transport and peer-tracker threads feed it reports and consult it for
//! connection candidates.
//!
//! # Locking
//!
//! Two locks: `state` guards the bucket arrays and both lookup indexes;
//! `desired` guards the desired-peer bookkeeping. When both are needed the
//! order is `state` then `desired`; taking `state` while `desired` is held
//! deadlocks against that order and is rejected in debug builds by a
//! per-thread stamp. Every public operation is linearizable with respect to
//! the `state` lock.

use std::collections::{HashMap, HashSet};
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, trace};

use crate::address::{
    distance_cmp, Address, AddressHasher, KademliaAddress, NetworkId, Sha1AddressHasher, Uri,
    KADEMLIA_ID_BITS,
};
use crate::bucket::{Bucket, InsertOutcome};
use crate::clock::{Clock, SystemClock, Timestamp};
use crate::peer::{read_peer, share_peer, write_peer, PeerInfo, PeerInfoPtr, VerificationToken};

/// Default bucket capacity (the Kademlia K parameter).
pub const DEFAULT_MAX_PEERS_PER_BUCKET: usize = 20;

/// Default ceiling for the liveness score.
pub const DEFAULT_MAX_LIVENESS: u64 = 100;

/// Tunables fixed at table construction.
#[derive(Clone, Debug)]
pub struct TableConfig {
    /// Maximum peers per bucket, in both arrays.
    pub max_peers_per_bucket: usize,
    /// Saturation point for the liveness score.
    pub max_liveness: u64,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            max_peers_per_bucket: DEFAULT_MAX_PEERS_PER_BUCKET,
            max_liveness: DEFAULT_MAX_LIVENESS,
        }
    }
}

/// Point-in-time diagnostic snapshot of table occupancy.
#[derive(Clone, Debug, Default)]
pub struct TableStats {
    /// Peers currently indexed by address.
    pub known_peers: usize,
    /// Non-empty buckets in the logarithmic array.
    pub active_log_buckets: usize,
    /// Non-empty buckets in the Hamming array.
    pub active_hamming_buckets: usize,
    /// Fill of the fullest bucket across both arrays.
    pub largest_bucket: usize,
    /// Desired peers currently tracked by address.
    pub desired_peers: usize,
    /// Desired endpoints awaiting address resolution.
    pub desired_uris: usize,
}

/// Which bucket array a scan walks.
#[derive(Clone, Copy)]
enum DistanceSpace {
    Logarithm,
    Hamming,
}

// ============================================================================
// Lock-order enforcement (debug builds)
// ============================================================================

#[cfg(debug_assertions)]
mod lock_order {
    use std::cell::Cell;

    thread_local! {
        static DESIRED_HELD: Cell<bool> = const { Cell::new(false) };
    }

    pub(super) fn mark_desired(held: bool) {
        DESIRED_HELD.with(|flag| flag.set(held));
    }

    pub(super) fn assert_state_allowed() {
        DESIRED_HELD.with(|flag| {
            assert!(
                !flag.get(),
                "lock order violation: state lock requested while the desired lock is held"
            );
        });
    }
}

// ============================================================================
// Guarded state
// ============================================================================

pub(crate) struct TableState {
    pub(crate) by_logarithm: Vec<Bucket>,
    pub(crate) by_hamming: Vec<Bucket>,
    pub(crate) known_peers: HashMap<Address, PeerInfoPtr>,
    pub(crate) known_uris: HashMap<Uri, PeerInfoPtr>,
    /// Cached minimum index of a non-empty logarithmic bucket;
    /// [`KADEMLIA_ID_BITS`] when the table is empty.
    pub(crate) first_non_empty_bucket: u64,
}

impl TableState {
    pub(crate) fn new() -> Self {
        Self {
            by_logarithm: (0..=KADEMLIA_ID_BITS).map(|_| Bucket::default()).collect(),
            by_hamming: (0..=KADEMLIA_ID_BITS).map(|_| Bucket::default()).collect(),
            known_peers: HashMap::new(),
            known_uris: HashMap::new(),
            first_non_empty_bucket: KADEMLIA_ID_BITS as u64,
        }
    }
}

#[derive(Default)]
pub(crate) struct DesiredState {
    pub(crate) connection_expiry: HashMap<Address, Timestamp>,
    pub(crate) desired_uri_expiry: HashMap<Uri, Timestamp>,
    /// Insertion order preserved; `propose_permanent_connections` and the
    /// persisted cache both depend on it.
    pub(crate) desired_peers: Vec<Address>,
    pub(crate) desired_uris: Vec<Uri>,
}

/// Guard around the desired lock that keeps the debug lock-order stamp
/// current.
pub(crate) struct DesiredGuard<'a> {
    inner: MutexGuard<'a, DesiredState>,
}

impl Deref for DesiredGuard<'_> {
    type Target = DesiredState;

    fn deref(&self) -> &DesiredState {
        &self.inner
    }
}

impl DerefMut for DesiredGuard<'_> {
    fn deref_mut(&mut self) -> &mut DesiredState {
        &mut self.inner
    }
}

impl Drop for DesiredGuard<'_> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        lock_order::mark_desired(false);
    }
}

// ============================================================================
// The table
// ============================================================================

/// Bucket-partitioned view of the overlay address space with liveness
/// scoring, a desired-peer overlay, and a persistent cache.
///
/// Shared across transport, peer-tracker, and maintenance threads; all
/// methods take `&self`.
pub struct KademliaTable {
    pub(crate) logging_name: String,
    pub(crate) own_address: Address,
    pub(crate) own_kad_address: KademliaAddress,
    pub(crate) config: TableConfig,
    pub(crate) hasher: Arc<dyn AddressHasher>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) state: Mutex<TableState>,
    pub(crate) desired: Mutex<DesiredState>,
    pub(crate) cache_file: Mutex<Option<PathBuf>>,
}

impl KademliaTable {
    /// A table with the production hasher (SHA-1) and the wall clock.
    pub fn new(own_address: Address, network: NetworkId) -> Self {
        Self::with_parts(
            own_address,
            network,
            TableConfig::default(),
            Arc::new(Sha1AddressHasher),
            Arc::new(SystemClock),
        )
    }

    /// A table with injected collaborators, for embedders and tests.
    pub fn with_parts(
        own_address: Address,
        network: NetworkId,
        config: TableConfig,
        hasher: Arc<dyn AddressHasher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let own_kad_address = hasher.hash(&own_address);
        Self {
            logging_name: format!("table:{network}"),
            own_address,
            own_kad_address,
            config,
            hasher,
            clock,
            state: Mutex::new(TableState::new()),
            desired: Mutex::new(DesiredState::default()),
            cache_file: Mutex::new(None),
        }
    }

    pub fn own_address(&self) -> &Address {
        &self.own_address
    }

    pub fn own_kademlia_address(&self) -> KademliaAddress {
        self.own_kad_address
    }

    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, TableState> {
        #[cfg(debug_assertions)]
        lock_order::assert_state_allowed();
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn desired(&self) -> DesiredGuard<'_> {
        let inner = self.desired.lock().unwrap_or_else(PoisonError::into_inner);
        #[cfg(debug_assertions)]
        lock_order::mark_desired(true);
        DesiredGuard { inner }
    }

    fn deadline(&self, expiry: Duration) -> Timestamp {
        self.clock.now().saturating_add(expiry.as_nanos() as u64)
    }

    // ------------------------------------------------------------------
    // Reports
    // ------------------------------------------------------------------

    /// Record that a peer exists, merging with any record already held.
    ///
    /// A report about an already-known peer only refreshes soft fields: the
    /// endpoint is adopted when the held one is absent or unverified, the
    /// reporter is noted, and a peer vouching for itself promotes the
    /// verified flag. Liveness is untouched; that is
    /// [`report_liveliness`](Self::report_liveliness)'s job. A report about
    /// an unknown peer inserts it into both bucket arrays; losing the
    /// eviction contest in either array drops the candidate silently.
    pub fn report_existence(&self, info: PeerInfo, reporter: &Address) {
        let mut state = self.state();
        self.report_existence_locked(&mut state, info, reporter);
    }

    pub(crate) fn report_existence_locked(
        &self,
        state: &mut TableState,
        mut info: PeerInfo,
        reporter: &Address,
    ) -> Option<PeerInfoPtr> {
        if info.address == self.own_address || info.address.is_empty() {
            return None;
        }
        let self_reported = info.address == *reporter;

        if let Some(existing) = state.known_peers.get(&info.address).cloned() {
            let (old_uri, new_uri) = {
                let mut peer = write_peer(&existing);
                let old_uri = peer.uri.clone();
                if peer.uri.is_none() || !peer.verified {
                    if let Some(uri) = info.uri.take() {
                        peer.uri = Some(uri);
                    }
                }
                peer.last_reporter = reporter.clone();
                if self_reported {
                    peer.verified = true;
                }
                (old_uri, peer.uri.clone())
            };
            if old_uri != new_uri {
                self.reindex_uri_locked(state, &existing, old_uri, new_uri);
            }
            trace!(
                table = %self.logging_name,
                peer = %info.address.short(),
                reporter = %reporter.short(),
                "existence report merged"
            );
            return Some(existing);
        }

        info.verified = self_reported;
        info.last_reporter = reporter.clone();
        self.insert_peer_locked(state, info)
    }

    /// Record a successful interaction with a peer: bump liveness, stamp
    /// last-seen, and move it to the front of both buckets.
    ///
    /// An unknown peer with a companion `info` is registered first; without
    /// one the report is a no-op, since the table never synthesizes records.
    pub fn report_liveliness(&self, address: &Address, reporter: &Address, info: Option<PeerInfo>) {
        if *address == self.own_address {
            return;
        }
        let mut state = self.state();
        let ptr = match state.known_peers.get(address).cloned() {
            Some(ptr) => ptr,
            None => {
                let Some(info) = info else { return };
                match self.report_existence_locked(&mut state, info, reporter) {
                    Some(ptr) => ptr,
                    None => return,
                }
            }
        };

        let (log_idx, ham_idx) = {
            let mut peer = write_peer(&ptr);
            peer.liveness = peer
                .liveness
                .saturating_add(1)
                .min(self.config.max_liveness);
            peer.last_seen = self.clock.now();
            peer.last_reporter = reporter.clone();
            if *reporter == self.own_address {
                peer.verified = true;
            }
            (
                self.own_kad_address.log_id(&peer.kademlia_address) as usize,
                self.own_kad_address.hamming_id(&peer.kademlia_address) as usize,
            )
        };
        state.by_logarithm[log_idx].touch(address);
        state.by_hamming[ham_idx].touch(address);
        trace!(
            table = %self.logging_name,
            peer = %address.short(),
            "liveliness report applied"
        );
    }

    /// Record a failed interaction. A peer whose liveness drains to zero is
    /// removed from both buckets and both indexes.
    pub fn report_failure(&self, address: &Address, reporter: &Address) {
        let mut state = self.state();
        let Some(ptr) = state.known_peers.get(address).cloned() else {
            return;
        };
        let drained = {
            let mut peer = write_peer(&ptr);
            peer.liveness = peer.liveness.saturating_sub(1);
            peer.last_reporter = reporter.clone();
            peer.liveness == 0
        };
        if drained {
            self.unlink_locked(&mut state, address);
            debug!(
                table = %self.logging_name,
                peer = %address.short(),
                "peer liveness drained, record removed"
            );
        }
    }

    /// Mark a peer as directly contacted and hand back a token for the pong.
    ///
    /// The peer's endpoint port is rewritten to the first port the caller
    /// lists. Returns `None` when the address is unknown; initiating contact
    /// with strangers is not the table's job.
    pub fn ping(&self, address: &Address, ports: &[u16]) -> Option<VerificationToken> {
        let mut state = self.state();
        let ptr = state.known_peers.get(address).cloned()?;

        let (old_uri, new_uri) = {
            let mut peer = write_peer(&ptr);
            peer.verified = true;
            peer.last_seen = self.clock.now();
            let old_uri = peer.uri.clone();
            if let (Some(uri), Some(port)) = (old_uri.clone(), ports.first().copied()) {
                let rewritten = uri.with_port(port);
                if rewritten != uri {
                    peer.uri = Some(rewritten);
                }
            }
            (old_uri, peer.uri.clone())
        };
        if old_uri != new_uri {
            self.reindex_uri_locked(&mut state, &ptr, old_uri, new_uri);
        }

        let token = VerificationToken::generate();
        debug!(
            table = %self.logging_name,
            peer = %address.short(),
            token = %token,
            "peer pinged"
        );
        Some(token)
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    /// Up to K peers closest to `target` under XOR distance, closest first.
    pub fn find_peer(&self, target: &Address) -> Vec<PeerInfo> {
        let kam_target = self.hasher.hash(target);
        let log_id = self.own_kad_address.log_id(&kam_target);
        self.find_closest(&kam_target, log_id, true, true, DistanceSpace::Logarithm)
    }

    /// [`find_peer`](Self::find_peer) with an explicit seed bucket and scan
    /// directions, for callers resuming a partial sweep.
    pub fn find_peer_with_scan(
        &self,
        target: &Address,
        log_id: u64,
        scan_left: bool,
        scan_right: bool,
    ) -> Vec<PeerInfo> {
        let kam_target = self.hasher.hash(target);
        self.find_closest(
            &kam_target,
            log_id,
            scan_left,
            scan_right,
            DistanceSpace::Logarithm,
        )
    }

    /// Up to K peers closest to `target` under Hamming distance.
    ///
    /// Probes a different slice of the keyspace than the logarithmic view:
    /// two peers at the same log distance can sit at very different Hamming
    /// distances, so the peer tracker uses this to diversify the topology.
    pub fn find_peer_by_hamming(&self, target: &Address) -> Vec<PeerInfo> {
        let kam_target = self.hasher.hash(target);
        let hamming_id = self.own_kad_address.hamming_id(&kam_target);
        self.find_closest(&kam_target, hamming_id, true, true, DistanceSpace::Hamming)
    }

    /// [`find_peer_by_hamming`](Self::find_peer_by_hamming) with an explicit
    /// seed bucket and scan directions.
    pub fn find_peer_by_hamming_with_scan(
        &self,
        target: &Address,
        hamming_id: u64,
        scan_left: bool,
        scan_right: bool,
    ) -> Vec<PeerInfo> {
        let kam_target = self.hasher.hash(target);
        self.find_closest(
            &kam_target,
            hamming_id,
            scan_left,
            scan_right,
            DistanceSpace::Hamming,
        )
    }

    fn find_closest(
        &self,
        kam_target: &KademliaAddress,
        seed: u64,
        scan_left: bool,
        scan_right: bool,
        space: DistanceSpace,
    ) -> Vec<PeerInfo> {
        let want = self.config.max_peers_per_bucket;
        let seed = (seed as usize).min(KADEMLIA_ID_BITS);

        let mut found: Vec<PeerInfo> = Vec::new();
        {
            let state = self.state();
            let buckets = match space {
                DistanceSpace::Logarithm => &state.by_logarithm,
                DistanceSpace::Hamming => &state.by_hamming,
            };

            let snapshot = |bucket: &Bucket, out: &mut Vec<PeerInfo>| {
                out.extend(bucket.iter().map(|ptr| read_peer(ptr).clone()));
            };
            snapshot(&buckets[seed], &mut found);

            // Widen one bucket per side per round so nearer distance classes
            // are exhausted before farther ones contribute.
            let mut left = seed as i64 - 1;
            let mut right = seed + 1;
            loop {
                if found.len() >= want {
                    break;
                }
                let mut stepped = false;
                if scan_left && left >= 0 {
                    snapshot(&buckets[left as usize], &mut found);
                    left -= 1;
                    stepped = true;
                }
                if found.len() >= want {
                    break;
                }
                if scan_right && right <= KADEMLIA_ID_BITS {
                    snapshot(&buckets[right], &mut found);
                    right += 1;
                    stepped = true;
                }
                if !stepped {
                    break;
                }
            }
        }

        found.retain(|peer| peer.address != self.own_address);
        match space {
            DistanceSpace::Logarithm => found.sort_by(|a, b| {
                distance_cmp(
                    &kam_target.distance(&a.kademlia_address),
                    &kam_target.distance(&b.kademlia_address),
                )
            }),
            DistanceSpace::Hamming => found.sort_by(|a, b| {
                kam_target
                    .hamming_id(&a.kademlia_address)
                    .cmp(&kam_target.hamming_id(&b.kademlia_address))
                    .then_with(|| {
                        distance_cmp(
                            &kam_target.distance(&a.kademlia_address),
                            &kam_target.distance(&b.kademlia_address),
                        )
                    })
            }),
        }
        found.truncate(want);
        found
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Snapshot of a peer record, or `None` for an unknown address.
    pub fn get_peer_details(&self, address: &Address) -> Option<PeerInfo> {
        let state = self.state();
        state
            .known_peers
            .get(address)
            .map(|ptr| read_peer(ptr).clone())
    }

    pub fn has_uri(&self, uri: &Uri) -> bool {
        self.state().known_uris.contains_key(uri)
    }

    pub fn get_address_from_uri(&self, uri: &Uri) -> Option<Address> {
        let state = self.state();
        state
            .known_uris
            .get(uri)
            .map(|ptr| read_peer(ptr).address.clone())
    }

    pub fn get_uri(&self, address: &Address) -> Option<Uri> {
        let state = self.state();
        state
            .known_peers
            .get(address)
            .and_then(|ptr| read_peer(ptr).uri.clone())
    }

    /// Number of peers currently known.
    pub fn size(&self) -> usize {
        self.state().known_peers.len()
    }

    /// Number of non-empty logarithmic buckets.
    pub fn active_buckets(&self) -> usize {
        self.state()
            .by_logarithm
            .iter()
            .filter(|bucket| !bucket.is_empty())
            .count()
    }

    /// Cached minimum index of a non-empty logarithmic bucket;
    /// [`KADEMLIA_ID_BITS`] when the table is empty.
    pub fn first_non_empty_bucket(&self) -> u64 {
        self.state().first_non_empty_bucket
    }

    /// Occupancy snapshot for telemetry and tests.
    pub fn stats(&self) -> TableStats {
        let state = self.state();
        let largest_bucket = state
            .by_logarithm
            .iter()
            .chain(state.by_hamming.iter())
            .map(Bucket::len)
            .max()
            .unwrap_or(0);
        let mut stats = TableStats {
            known_peers: state.known_peers.len(),
            active_log_buckets: state
                .by_logarithm
                .iter()
                .filter(|bucket| !bucket.is_empty())
                .count(),
            active_hamming_buckets: state
                .by_hamming
                .iter()
                .filter(|bucket| !bucket.is_empty())
                .count(),
            largest_bucket,
            desired_peers: 0,
            desired_uris: 0,
        };
        // state → desired is the sanctioned order.
        let desired = self.desired();
        stats.desired_peers = desired.desired_peers.len();
        stats.desired_uris = desired.desired_uris.len();
        stats
    }

    // ------------------------------------------------------------------
    // Connection maintenance
    // ------------------------------------------------------------------

    /// Peers the table recommends holding long-lived connections to.
    ///
    /// Every currently-known desired peer comes first, in the order the
    /// operator declared them; the remainder of `budget` is filled with the
    /// highest-liveness peer of each non-empty logarithmic bucket, from
    /// bucket 0 upward. Desired peers are never cut by the budget.
    pub fn propose_permanent_connections(&self, budget: usize) -> Vec<PeerInfo> {
        // Snapshot under the desired lock, release, then consult the main
        // table; holding desired while taking state is the forbidden order.
        let wanted: Vec<Address> = {
            let desired = self.desired();
            desired.desired_peers.clone()
        };

        let state = self.state();
        let mut proposed: Vec<PeerInfo> = Vec::new();
        let mut chosen: HashSet<Address> = HashSet::new();

        for address in wanted {
            if let Some(ptr) = state.known_peers.get(&address) {
                if chosen.insert(address) {
                    proposed.push(read_peer(ptr).clone());
                }
            }
        }

        for bucket in state.by_logarithm.iter() {
            if proposed.len() >= budget {
                break;
            }
            let Some(best) = bucket.strongest() else {
                continue;
            };
            let peer = read_peer(&best).clone();
            if chosen.insert(peer.address.clone()) {
                proposed.push(peer);
            }
        }
        proposed
    }

    // ------------------------------------------------------------------
    // Desired peers
    // ------------------------------------------------------------------

    /// Declare a peer the node should stay connected to until `expiry`.
    pub fn add_desired_peer(&self, address: Address, expiry: Duration) {
        let deadline = self.deadline(expiry);
        let mut desired = self.desired();
        desired.connection_expiry.insert(address.clone(), deadline);
        if !desired.desired_peers.contains(&address) {
            desired.desired_peers.push(address);
        }
    }

    /// Declare a desired peer together with an endpoint hint. The hint is
    /// also registered in the main table as an unverified record so the peer
    /// tracker has somewhere to dial.
    pub fn add_desired_peer_with_hint(&self, address: Address, hint: Uri, expiry: Duration) {
        let info = PeerInfo::new(address.clone()).with_uri(hint.clone());
        let own = self.own_address.clone();
        self.report_existence(info, &own);

        let deadline = self.deadline(expiry);
        let mut desired = self.desired();
        desired.connection_expiry.insert(address.clone(), deadline);
        if !desired.desired_peers.contains(&address) {
            desired.desired_peers.push(address);
        }
        desired.desired_uri_expiry.insert(hint.clone(), deadline);
        if !desired.desired_uris.contains(&hint) {
            desired.desired_uris.push(hint);
        }
    }

    /// Declare a desired endpoint whose identity is not yet known. Promoted
    /// to an address entry by
    /// [`convert_desired_uris_to_addresses`](Self::convert_desired_uris_to_addresses)
    /// once the peer at that endpoint reports who it is.
    pub fn add_desired_uri(&self, uri: Uri, expiry: Duration) {
        let deadline = self.deadline(expiry);
        let mut desired = self.desired();
        desired.desired_uri_expiry.insert(uri.clone(), deadline);
        if !desired.desired_uris.contains(&uri) {
            desired.desired_uris.push(uri);
        }
    }

    pub fn remove_desired_peer(&self, address: &Address) {
        let mut desired = self.desired();
        desired.connection_expiry.remove(address);
        desired.desired_peers.retain(|entry| entry != address);
    }

    /// Drop desired entries whose expiry has passed.
    pub fn trim_desired_peers(&self) {
        let now = self.clock.now();
        let mut desired = self.desired();

        let expired_peers: Vec<Address> = desired
            .connection_expiry
            .iter()
            .filter(|(_, deadline)| **deadline < now)
            .map(|(address, _)| address.clone())
            .collect();
        for address in &expired_peers {
            desired.connection_expiry.remove(address);
        }
        desired
            .desired_peers
            .retain(|address| !expired_peers.contains(address));

        let expired_uris: Vec<Uri> = desired
            .desired_uri_expiry
            .iter()
            .filter(|(_, deadline)| **deadline < now)
            .map(|(uri, _)| uri.clone())
            .collect();
        for uri in &expired_uris {
            desired.desired_uri_expiry.remove(uri);
        }
        desired.desired_uris.retain(|uri| !expired_uris.contains(uri));

        if !expired_peers.is_empty() || !expired_uris.is_empty() {
            debug!(
                table = %self.logging_name,
                peers = expired_peers.len(),
                uris = expired_uris.len(),
                "expired desired entries trimmed"
            );
        }
    }

    /// Promote desired URI entries whose peer identity is now known.
    pub fn convert_desired_uris_to_addresses(&self) {
        // Three phases to honor the lock order: snapshot desired, resolve
        // against the main table, then rewrite desired.
        let pending: Vec<(Uri, Timestamp)> = {
            let desired = self.desired();
            desired
                .desired_uris
                .iter()
                .map(|uri| {
                    let deadline = desired.desired_uri_expiry.get(uri).copied().unwrap_or(0);
                    (uri.clone(), deadline)
                })
                .collect()
        };
        if pending.is_empty() {
            return;
        }

        let resolved: Vec<(Uri, Address, Timestamp)> = {
            let state = self.state();
            pending
                .into_iter()
                .filter_map(|(uri, deadline)| {
                    state
                        .known_uris
                        .get(&uri)
                        .map(|ptr| (uri, read_peer(ptr).address.clone(), deadline))
                })
                .collect()
        };
        if resolved.is_empty() {
            return;
        }

        let mut desired = self.desired();
        for (uri, address, deadline) in resolved {
            // Another thread may have withdrawn the entry in between.
            if !desired.desired_uris.contains(&uri) {
                continue;
            }
            desired.desired_uris.retain(|entry| entry != &uri);
            desired.desired_uri_expiry.remove(&uri);
            desired
                .connection_expiry
                .entry(address.clone())
                .or_insert(deadline);
            if !desired.desired_peers.contains(&address) {
                desired.desired_peers.push(address.clone());
            }
            debug!(
                table = %self.logging_name,
                uri = %uri,
                peer = %address.short(),
                "desired endpoint resolved to an address"
            );
        }
    }

    /// Forget every desired peer and endpoint.
    pub fn clear_desired(&self) {
        let mut desired = self.desired();
        desired.connection_expiry.clear();
        desired.desired_uri_expiry.clear();
        desired.desired_peers.clear();
        desired.desired_uris.clear();
    }

    /// Desired peer addresses, in declaration order.
    pub fn desired_peers(&self) -> Vec<Address> {
        self.desired().desired_peers.clone()
    }

    /// Desired endpoints still awaiting identity resolution.
    pub fn desired_uris(&self) -> Vec<Uri> {
        self.desired().desired_uris.clone()
    }

    // ------------------------------------------------------------------
    // Internal maintenance
    // ------------------------------------------------------------------

    /// Insert a record the caller has already vetted. Indexes are always
    /// recomputed against the local hasher here; both arrays either accept
    /// the peer or neither does.
    pub(crate) fn insert_peer_locked(
        &self,
        state: &mut TableState,
        mut info: PeerInfo,
    ) -> Option<PeerInfoPtr> {
        info.kademlia_address = self.hasher.hash(&info.address);
        info.liveness = info.liveness.min(self.config.max_liveness);
        if info.last_seen == 0 {
            info.last_seen = self.clock.now();
        }

        let log_idx = self.own_kad_address.log_id(&info.kademlia_address) as usize;
        let ham_idx = self.own_kad_address.hamming_id(&info.kademlia_address) as usize;
        let address = info.address.clone();
        let uri = info.uri.clone();
        let capacity = self.config.max_peers_per_bucket;
        let score = (info.liveness, info.last_seen);

        // Admission is decided against both views up front so a candidate
        // that loses in one never costs the other an eviction.
        if !state.by_logarithm[log_idx].would_accept(score, capacity)
            || !state.by_hamming[ham_idx].would_accept(score, capacity)
        {
            trace!(
                table = %self.logging_name,
                peer = %address.short(),
                bucket = log_idx,
                hamming = ham_idx,
                "bucket full, candidate dropped"
            );
            return None;
        }
        let ptr = share_peer(info);

        match state.by_logarithm[log_idx].insert(ptr.clone(), capacity) {
            InsertOutcome::Rejected => return None,
            InsertOutcome::Replaced(evicted) => {
                let evicted_address = read_peer(&evicted).address.clone();
                self.unlink_locked(state, &evicted_address);
                debug!(
                    table = %self.logging_name,
                    evicted = %evicted_address.short(),
                    bucket = log_idx,
                    "weakest peer evicted"
                );
            }
            InsertOutcome::Inserted => {}
        }

        match state.by_hamming[ham_idx].insert(ptr.clone(), capacity) {
            InsertOutcome::Rejected => {
                // Unreachable after the admission check; keep the arrays in
                // lockstep all the same.
                state.by_logarithm[log_idx].remove(&address);
                return None;
            }
            InsertOutcome::Replaced(evicted) => {
                let evicted_address = read_peer(&evicted).address.clone();
                self.unlink_locked(state, &evicted_address);
                debug!(
                    table = %self.logging_name,
                    evicted = %evicted_address.short(),
                    bucket = ham_idx,
                    "weakest peer evicted from hamming view"
                );
            }
            InsertOutcome::Inserted => {}
        }

        state.known_peers.insert(address.clone(), ptr.clone());
        if let Some(uri) = uri {
            state.known_uris.entry(uri).or_insert_with(|| ptr.clone());
        }
        if (log_idx as u64) < state.first_non_empty_bucket {
            state.first_non_empty_bucket = log_idx as u64;
        }
        debug!(
            table = %self.logging_name,
            peer = %address.short(),
            bucket = log_idx,
            hamming = ham_idx,
            "peer registered"
        );
        Some(ptr)
    }

    /// Remove a peer from both arrays and both indexes, repairing the cached
    /// first-non-empty index.
    pub(crate) fn unlink_locked(&self, state: &mut TableState, address: &Address) {
        let ptr = state.known_peers.remove(address);
        let kad = match &ptr {
            Some(ptr) => read_peer(ptr).kademlia_address,
            None => self.hasher.hash(address),
        };
        let log_idx = self.own_kad_address.log_id(&kad) as usize;
        let ham_idx = self.own_kad_address.hamming_id(&kad) as usize;
        state.by_logarithm[log_idx].remove(address);
        state.by_hamming[ham_idx].remove(address);
        if let Some(ptr) = ptr {
            state
                .known_uris
                .retain(|_, candidate| !Arc::ptr_eq(candidate, &ptr));
        }
        self.advance_first_non_empty(state);
    }

    fn reindex_uri_locked(
        &self,
        state: &mut TableState,
        ptr: &PeerInfoPtr,
        old_uri: Option<Uri>,
        new_uri: Option<Uri>,
    ) {
        if let Some(old) = old_uri {
            if state
                .known_uris
                .get(&old)
                .is_some_and(|current| Arc::ptr_eq(current, ptr))
            {
                state.known_uris.remove(&old);
            }
        }
        if let Some(new) = new_uri {
            state.known_uris.entry(new).or_insert_with(|| ptr.clone());
        }
    }

    fn advance_first_non_empty(&self, state: &mut TableState) {
        let current = state.first_non_empty_bucket as usize;
        if current >= KADEMLIA_ID_BITS || !state.by_logarithm[current].is_empty() {
            return;
        }
        let next = ((current + 1)..KADEMLIA_ID_BITS)
            .find(|idx| !state.by_logarithm[*idx].is_empty())
            .unwrap_or(KADEMLIA_ID_BITS);
        state.first_non_empty_bucket = next as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::KADEMLIA_ID_BYTES;

    /// Copies the identity bytes straight into the Kademlia space so tests
    /// can pin peers to chosen buckets.
    struct PrefixHasher;

    impl AddressHasher for PrefixHasher {
        fn hash(&self, address: &Address) -> KademliaAddress {
            let mut out = [0u8; KADEMLIA_ID_BYTES];
            let bytes = address.as_bytes();
            let len = bytes.len().min(KADEMLIA_ID_BYTES);
            out[..len].copy_from_slice(&bytes[..len]);
            KademliaAddress::from_bytes(out)
        }
    }

    fn test_table(own: Address) -> KademliaTable {
        KademliaTable::with_parts(
            own,
            NetworkId::from_tag(*b"TEST"),
            TableConfig::default(),
            Arc::new(PrefixHasher),
            Arc::new(crate::clock::ManualClock::starting_at(1)),
        )
    }

    fn addr(first: u8, tag: u8) -> Address {
        let mut bytes = vec![0u8; KADEMLIA_ID_BYTES];
        bytes[0] = first;
        bytes[KADEMLIA_ID_BYTES - 1] = tag;
        Address::new(bytes)
    }

    #[test]
    fn construction_derives_the_local_kademlia_identity() {
        let own = addr(0x42, 7);
        let table = test_table(own.clone());

        // Distance math against the local identity must agree with the
        // injected hasher.
        assert_eq!(table.own_kademlia_address(), PrefixHasher.hash(&own));
        assert_eq!(table.own_address(), &own);
        assert_eq!(
            table.own_kademlia_address().log_id(&PrefixHasher.hash(&own)),
            KADEMLIA_ID_BITS as u64
        );
    }

    #[test]
    fn peers_land_in_matching_buckets_of_both_arrays() {
        let table = test_table(addr(0, 0));
        let peer = addr(0x80, 0);
        table.report_existence(PeerInfo::new(peer.clone()), &peer);

        let state = table.state();
        let kad = table.hasher.hash(&peer);
        let log_idx = table.own_kad_address.log_id(&kad) as usize;
        let ham_idx = table.own_kad_address.hamming_id(&kad) as usize;
        assert_eq!(log_idx, 159);
        assert_eq!(ham_idx, 1);
        assert!(state.by_logarithm[log_idx].contains(&peer));
        assert!(state.by_hamming[ham_idx].contains(&peer));

        // And in no other bucket of either array.
        let log_hits = state
            .by_logarithm
            .iter()
            .filter(|bucket| bucket.contains(&peer))
            .count();
        let ham_hits = state
            .by_hamming
            .iter()
            .filter(|bucket| bucket.contains(&peer))
            .count();
        assert_eq!((log_hits, ham_hits), (1, 1));
    }

    #[test]
    fn eviction_removes_the_victim_from_both_arrays() {
        let own = addr(0, 0);
        let table = KademliaTable::with_parts(
            own.clone(),
            NetworkId::from_tag(*b"TEST"),
            TableConfig {
                max_peers_per_bucket: 2,
                ..TableConfig::default()
            },
            Arc::new(PrefixHasher),
            Arc::new(crate::clock::ManualClock::starting_at(1)),
        );

        // All three share logarithmic bucket 159 but differ in popcount.
        let weak = addr(0x80, 0x00);
        let mid = addr(0x80, 0x01);
        let strong = addr(0x80, 0x03);
        table.report_existence(PeerInfo::new(weak.clone()).with_liveness(1), &own);
        table.report_existence(PeerInfo::new(mid.clone()).with_liveness(2), &own);
        table.report_existence(PeerInfo::new(strong.clone()).with_liveness(3), &own);

        assert!(table.get_peer_details(&weak).is_none());
        let state = table.state();
        for bucket in state.by_logarithm.iter().chain(state.by_hamming.iter()) {
            assert!(!bucket.contains(&weak));
        }
        assert!(state.known_peers.contains_key(&mid));
        assert!(state.known_peers.contains_key(&strong));
    }

    #[test]
    fn first_non_empty_bucket_tracks_inserts_and_removals() {
        let own = addr(0, 0);
        let table = test_table(own.clone());
        assert_eq!(table.first_non_empty_bucket(), KADEMLIA_ID_BITS as u64);

        let far = addr(0x80, 0);
        let near = addr(0x01, 0);
        table.report_existence(PeerInfo::new(far.clone()).with_liveness(1), &own);
        assert_eq!(table.first_non_empty_bucket(), 159);

        table.report_existence(PeerInfo::new(near.clone()).with_liveness(1), &own);
        assert_eq!(table.first_non_empty_bucket(), 152);

        table.report_failure(&near, &own);
        assert_eq!(table.first_non_empty_bucket(), 159);

        table.report_failure(&far, &own);
        assert_eq!(table.first_non_empty_bucket(), KADEMLIA_ID_BITS as u64);
    }

    #[test]
    fn own_address_is_never_registered() {
        let own = addr(0x42, 0);
        let table = test_table(own.clone());
        table.report_existence(PeerInfo::new(own.clone()), &own);
        assert_eq!(table.size(), 0);
        table.report_liveliness(&own, &own, Some(PeerInfo::new(own.clone())));
        assert_eq!(table.size(), 0);
    }

    #[test]
    fn merge_prefers_a_verified_endpoint() {
        let own = addr(0, 0);
        let table = test_table(own.clone());
        let peer = addr(0x80, 1);
        let reporter = addr(0x40, 1);

        let first = PeerInfo::new(peer.clone()).with_uri(Uri::new("tcp://10.0.0.1:9000"));
        table.report_existence(first, &peer); // self-report → verified

        let second = PeerInfo::new(peer.clone()).with_uri(Uri::new("tcp://evil:1"));
        table.report_existence(second, &reporter);

        let details = table.get_peer_details(&peer).unwrap();
        assert!(details.verified);
        assert_eq!(details.uri, Some(Uri::new("tcp://10.0.0.1:9000")));
        assert_eq!(details.last_reporter, reporter);
    }
}
