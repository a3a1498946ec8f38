//! Multi-node scenarios over the loopback fabric.
//!
//! Every test spins up a whole cluster in-process: one transport
//! context per node, all sharing a loopback fabric, with table
//! construction running concurrently on one thread per node (the
//! pairing exchanges block until both sides arrive).

#![allow(clippy::unwrap_used)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use squall_rdma::testing::{loopback_cluster, LoopbackFabric};
use squall_rpc::{results, ReplyError};
use squall_sst::{
    NodeId, ScalarField, Sst, SstConfigBuilder, SstLayout, VectorField,
};

/// The layout every node in these tests declares: a counter, a small
/// vector, and (implicitly) the heartbeat.
fn test_layout() -> (ScalarField<u64>, VectorField<u16>, SstLayout) {
    let mut b = SstLayout::builder();
    let counter = b.scalar::<u64>();
    let inbox = b.vector::<u16>(4);
    (counter, inbox, b.build())
}

/// Bring up one table per id, constructing them concurrently.
fn start_cluster(
    ids: &[u32],
    heartbeat: Duration,
    window: Duration,
) -> (Arc<LoopbackFabric>, Vec<Sst>) {
    let (fabric, nodes) = loopback_cluster(ids);
    let builders: Vec<_> = ids
        .iter()
        .zip(&nodes)
        .map(|(&id, node)| {
            let node = Arc::clone(node);
            let peers = node.peers().clone();
            std::thread::spawn(move || {
                let (_, _, layout) = test_layout();
                let config = SstConfigBuilder::default()
                    .local_id(NodeId(id))
                    .peers(peers)
                    .heartbeat_interval(heartbeat)
                    .liveness_window(window)
                    .build()
                    .unwrap();
                Sst::new(config, node, layout).unwrap()
            })
        })
        .collect();
    let ssts = builders.into_iter().map(|b| b.join().unwrap()).collect();
    (fabric, ssts)
}

#[test]
fn three_peer_counter_replication() {
    let (_fabric, ssts) =
        start_cluster(&[1, 2, 3], Duration::from_millis(50), Duration::from_secs(30));
    let (counter, _, _) = test_layout();

    let workers: Vec<_> = ssts
        .into_iter()
        .map(|sst| {
            std::thread::spawn(move || {
                let me = sst.local_index();
                sst.write(counter, me, 100).unwrap();
                sst.put_field(&counter).unwrap();
                sst.sync_with_members().unwrap();
                let seen: Vec<u64> = (0..sst.members().len())
                    .map(|row| sst.read(counter, row).unwrap())
                    .collect();
                assert_eq!(seen, vec![100, 100, 100]);
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
}

#[test]
fn vector_fields_replicate() {
    let (_fabric, ssts) =
        start_cluster(&[4, 9], Duration::from_millis(50), Duration::from_secs(30));
    let (_, inbox, _) = test_layout();

    let workers: Vec<_> = ssts
        .into_iter()
        .map(|sst| {
            std::thread::spawn(move || {
                let me = sst.local_index();
                for idx in 0..inbox.len() {
                    let stamp = (me as u16 + 1) * 10 + idx as u16;
                    sst.write_vec(inbox, me, idx, stamp).unwrap();
                }
                sst.put_field(&inbox).unwrap();
                sst.sync_with_members().unwrap();
                for row in 0..sst.members().len() {
                    for idx in 0..inbox.len() {
                        let expect = (row as u16 + 1) * 10 + idx as u16;
                        assert_eq!(sst.read_vec(inbox, row, idx).unwrap(), expect);
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
}

#[test]
fn heartbeat_failure_fires_upcall_and_fails_outstanding_rpc() {
    let (fabric, ssts) = start_cluster(
        &[1, 2],
        Duration::from_millis(25),
        Duration::from_millis(250),
    );
    let mut ssts = ssts.into_iter();
    let sst1 = ssts.next().unwrap();
    let _sst2 = ssts.next().unwrap();

    // An outstanding call whose destinations include the doomed peer.
    let (pending, query) = results::<u64>();
    pending.fulfill_map(&[NodeId(2)]);

    let failed = Arc::new(Mutex::new(Vec::new()));
    let failed_log = Arc::clone(&failed);
    sst1.set_failure_upcall(move |peer| {
        failed_log.lock().unwrap().push(peer);
        pending.set_exception_for_removed_node(peer);
    });

    // Node 2 goes dark: its heartbeats stop arriving at node 1, and
    // node 1's signaled pushes to it stop completing.
    fabric.fail_node(NodeId(2));

    let deadline = Instant::now() + Duration::from_secs(10);
    while failed.lock().unwrap().is_empty() {
        assert!(Instant::now() < deadline, "failure upcall never fired");
        std::thread::sleep(Duration::from_millis(10));
    }

    assert_eq!(failed.lock().unwrap().as_slice(), &[NodeId(2)]);
    let rank2 = sst1.rank_of(NodeId(2)).unwrap();
    assert!(!sst1.is_live(rank2).unwrap());
    // The stale row stays readable.
    let (counter, _, _) = test_layout();
    let _ = sst1.read(counter, rank2).unwrap();
    // And the outstanding call resolved peer-scoped.
    assert_eq!(
        query.get().get(NodeId(2)),
        Err(ReplyError::NodeRemovedFromGroup(NodeId(2)))
    );
}

#[test]
fn sync_with_members_is_a_barrier() {
    let (_fabric, ssts) =
        start_cluster(&[1, 2], Duration::from_millis(50), Duration::from_secs(30));
    let mut ssts = ssts.into_iter();
    let sst1 = ssts.next().unwrap();
    let sst2 = ssts.next().unwrap();

    let peer_entered = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&peer_entered);
    let late = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(150));
        flag.store(true, Ordering::SeqCst);
        sst2.sync_with_members().unwrap();
    });

    sst1.sync_with_members().unwrap();
    assert!(
        peer_entered.load(Ordering::SeqCst),
        "sync returned before the peer entered the barrier"
    );
    late.join().unwrap();
}
