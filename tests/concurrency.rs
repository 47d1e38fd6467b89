mod common;

use std::sync::Arc;
use std::thread;

use rand::Rng;

use kademlia_routing::{Address, PeerInfo, KADEMLIA_ID_BYTES};

use common::{make_address, peer, test_table};

/// Deterministic workload: eight writers own disjoint distance classes, so
/// every insertion and removal has a predictable outcome that can be checked
/// exactly after the join.
#[test]
fn disjoint_writers_keep_exact_membership() {
    let own = make_address(0, 0);
    let shared = Arc::new(test_table(own.clone()).table);

    // Writer `w` owns logarithmic class 152 + w via a single leading bit and
    // tags 8w..8w+8. Eight peers per class stays under capacity in both
    // arrays. Each writer drains its last peer back out through failures.
    let handles: Vec<_> = (0..8u8)
        .map(|w| {
            let table = Arc::clone(&shared);
            let own = own.clone();
            thread::spawn(move || {
                let first = 1u8 << w;
                for i in 0..8u8 {
                    let address = make_address(first, w * 8 + i);
                    table.report_existence(peer(&address, 1), &own);
                    table.report_liveliness(&address, &own, None);
                }
                let doomed = make_address(first, w * 8 + 7);
                table.report_failure(&doomed, &own);
                table.report_failure(&doomed, &own);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(shared.size(), 8 * 7);
    for w in 0..8u8 {
        let first = 1u8 << w;
        for i in 0..7u8 {
            let address = make_address(first, w * 8 + i);
            let details = shared.get_peer_details(&address).unwrap();
            assert_eq!(details.liveness, 2, "peer {w}/{i}");
        }
        assert!(shared
            .get_peer_details(&make_address(first, w * 8 + 7))
            .is_none());
    }

    let stats = shared.stats();
    assert_eq!(stats.known_peers, shared.size());
    assert_eq!(stats.active_log_buckets, 8);
    assert!(stats.largest_bucket <= 20);
}

/// Randomized stress: eight threads hammer the table with a mixed
/// report/lookup/maintenance workload, then the invariants are checked on
/// the survivor set.
#[test]
fn randomized_parallel_workload_preserves_invariants() {
    let own = make_address(0, 0);
    let t = test_table(own.clone());

    // Records pinned at the liveness ceiling can never lose an eviction
    // contest against the low-liveness churn below, so they must survive.
    let ceiling = t.table.config().max_liveness;
    let protected: Vec<Address> = (0..8u8).map(|i| make_address(1 << i, 0xff)).collect();
    for address in &protected {
        t.table.report_existence(
            PeerInfo::new(address.clone()).with_liveness(ceiling),
            &own,
        );
    }

    let shared = Arc::new(t.table);
    let handles: Vec<_> = (0..8u8)
        .map(|seed| {
            let table = Arc::clone(&shared);
            let own = own.clone();
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for _ in 0..2500 {
                    let address = make_address(rng.gen::<u8>() | 1, rng.gen::<u8>());
                    match rng.gen_range(0..6) {
                        0 | 1 => table.report_existence(peer(&address, 1), &own),
                        2 => table.report_liveliness(&address, &own, Some(peer(&address, 0))),
                        3 => table.report_failure(&address, &own),
                        4 => {
                            let _ = table.find_peer(&address);
                            let _ = table.find_peer_by_hamming(&address);
                        }
                        _ => {
                            let _ = table.propose_permanent_connections(usize::from(seed));
                            let _ = table.stats();
                        }
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = shared.stats();
    assert_eq!(stats.known_peers, shared.size());
    assert!(stats.largest_bucket <= 20, "bucket overflow: {stats:?}");

    for address in &protected {
        assert!(
            shared.get_peer_details(address).is_some(),
            "ceiling-liveness peer was evicted"
        );
    }

    // Lookup results stay sorted, bounded, distinct, and never include the
    // local node.
    let target = make_address(0x55, 0x55);
    let found = shared.find_peer(&target);
    assert!(found.len() <= 20);
    assert!(found.iter().all(|info| info.address != own));

    let mut target_kad = [0u8; KADEMLIA_ID_BYTES];
    target_kad[..KADEMLIA_ID_BYTES].copy_from_slice(target.as_bytes());
    let distances: Vec<_> = found
        .iter()
        .map(|info| {
            let mut out = [0u8; KADEMLIA_ID_BYTES];
            for (i, byte) in out.iter_mut().enumerate() {
                *byte = target_kad[i] ^ info.kademlia_address.as_bytes()[i];
            }
            out
        })
        .collect();
    assert!(distances.windows(2).all(|pair| pair[0] <= pair[1]));
    let mut seen = std::collections::HashSet::new();
    assert!(found.iter().all(|info| seen.insert(info.address.clone())));
}
