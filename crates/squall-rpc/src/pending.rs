//! The write side of a call's reply tracking.

use std::collections::BTreeSet;
use std::sync::{Arc, Condvar, Mutex};

use tracing::{debug, warn};

use squall_rdma::NodeId;

use crate::query::QueryResults;
use crate::reply::{ReplyError, ReplyMap};

/// State shared between the pending and query sides of one call.
pub(crate) struct Shared<T> {
    /// Call state.
    pub(crate) state: Mutex<CallState<T>>,
    /// Notified when the reply map is published.
    pub(crate) map_ready: Condvar,
}

/// Call state, inside the lock.
pub(crate) struct CallState<T> {
    /// The reply map, once published by `fulfill_map`.
    pub(crate) map: Option<Arc<ReplyMap<T>>>,
    /// The destinations the call was actually sent to.
    destinations: Vec<NodeId>,
    /// Peers that have replied (with a value or an exception).
    responded: BTreeSet<NodeId>,
    /// Set once `fulfill_map` has run.
    map_fulfilled: bool,
}

/// Create the reply tracking for one outgoing call.
///
/// The [`PendingResults`] side goes to the RPC engine; the
/// [`QueryResults`] side goes to the caller.
pub fn results<T>() -> (PendingResults<T>, QueryResults<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(CallState {
            map: None,
            destinations: Vec::new(),
            responded: BTreeSet::new(),
            map_fulfilled: false,
        }),
        map_ready: Condvar::new(),
    });
    (
        PendingResults {
            shared: Arc::clone(&shared),
        },
        QueryResults::new(shared),
    )
}

/// The write side of one call's reply tracking, held by the RPC engine
/// until every destination has replied or been removed.
pub struct PendingResults<T> {
    /// State shared with the query side.
    shared: Arc<Shared<T>>,
}

impl<T> PendingResults<T> {
    /// Publish the destination set of the call.
    ///
    /// Called exactly once, after the wire send, with the ordered list
    /// of peers actually contacted.  Installs one single-assignment
    /// slot per destination and hands the resulting map to the query
    /// side.  Every other method happens-after this one.
    pub fn fulfill_map(&self, destinations: &[NodeId]) {
        let Ok(mut state) = self.shared.state.lock() else {
            return;
        };
        if state.map_fulfilled {
            debug_assert!(false, "fulfill_map called twice");
            warn!("fulfill_map called twice; keeping the first map");
            return;
        }
        state.map = Some(Arc::new(ReplyMap::new(destinations)));
        state.destinations = destinations.to_vec();
        state.map_fulfilled = true;
        debug!("reply map fulfilled for {} destinations", destinations.len());
        self.shared.map_ready.notify_all();
    }

    /// Record a value replied by `peer`.
    pub fn set_value(&self, peer: NodeId, value: T) {
        self.record_reply(peer, Ok(value));
    }

    /// Record an exception reported by `peer`.
    pub fn set_exception(&self, peer: NodeId, error: ReplyError) {
        self.record_reply(peer, Err(error));
    }

    /// Record that `peer` left the group before replying.
    ///
    /// A no-op unless the map has been fulfilled, `peer` was a
    /// destination, and `peer` has not already replied; under those
    /// conditions the peer's slot resolves to
    /// [`ReplyError::NodeRemovedFromGroup`].  Single-assignment on the
    /// slot makes a second call (or a racing reply) harmless.
    pub fn set_exception_for_removed_node(&self, peer: NodeId) {
        let Ok(state) = self.shared.state.lock() else {
            return;
        };
        if !state.map_fulfilled
            || !state.destinations.contains(&peer)
            || state.responded.contains(&peer)
        {
            return;
        }
        let Some(map) = state.map.clone() else {
            return;
        };
        drop(state);
        if let Some(slot) = map.slot(peer) {
            if slot.fulfill(Err(ReplyError::NodeRemovedFromGroup(peer))) {
                debug!("installed removed-node exception for node {}", peer);
            }
        }
    }

    /// Return true once `fulfill_map` has run.
    pub fn map_fulfilled(&self) -> bool {
        self.shared
            .state
            .lock()
            .map(|state| state.map_fulfilled)
            .unwrap_or(false)
    }

    /// Return true once every destination has replied or been removed.
    ///
    /// The RPC engine discards the pending side when this holds.
    pub fn all_resolved(&self) -> bool {
        let Ok(state) = self.shared.state.lock() else {
            return false;
        };
        match &state.map {
            Some(map) => map.all_resolved(),
            None => false,
        }
    }

    /// Shared path of `set_value` / `set_exception`.
    fn record_reply(&self, peer: NodeId, outcome: Result<T, ReplyError>) {
        let Ok(mut state) = self.shared.state.lock() else {
            return;
        };
        if !state.map_fulfilled {
            debug_assert!(false, "reply recorded before fulfill_map");
            warn!("dropping reply from node {} recorded before fulfill_map", peer);
            return;
        }
        if !state.destinations.contains(&peer) {
            warn!("dropping reply from node {}: not a destination", peer);
            return;
        }
        state.responded.insert(peer);
        let Some(map) = state.map.clone() else {
            return;
        };
        drop(state);
        if let Some(slot) = map.slot(peer) {
            // First assignment wins; a reply racing a removal notice
            // resolves to whichever got there first.
            let _ = slot.fulfill(outcome);
        }
    }
}

impl<T> std::fmt::Debug for PendingResults<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingResults")
            .field("map_fulfilled", &self.map_fulfilled())
            .finish()
    }
}

/// The write side of a call whose replies carry no value.
///
/// Nothing is tracked: `fulfill_map` is a no-op.
#[derive(Debug, Default)]
pub struct PendingVoid {
    /// Nothing to see here.
    _priv: (),
}

impl PendingVoid {
    /// No-op: there are no per-peer slots to install.
    pub fn fulfill_map(&self, _destinations: &[NodeId]) {}
}

/// The read side of a call whose replies carry no value.
///
/// Exposes no accessors; reserved for a future flush primitive.
#[derive(Debug, Default)]
pub struct QueryVoid {
    /// Nothing to see here.
    _priv: (),
}

/// Create the (degenerate) reply tracking for a call whose replies
/// carry no value.
pub fn results_void() -> (PendingVoid, QueryVoid) {
    (PendingVoid::default(), QueryVoid::default())
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::missing_docs_in_private_items)]
    use super::*;
    use std::time::Duration;

    const D: [NodeId; 3] = [NodeId(1), NodeId(2), NodeId(3)];

    #[test]
    fn partial_response_map() {
        // Call sent to {1,2,3}: 1 answers, 3 raises, 2 is removed.
        let (pending, query) = results::<u64>();
        pending.fulfill_map(&D);
        pending.set_value(NodeId(1), 41);
        pending.set_exception(NodeId(3), ReplyError::RemoteExceptionOccurred(NodeId(3)));
        pending.set_exception_for_removed_node(NodeId(2));

        let map = query.get();
        assert_eq!(map.len(), 3);
        assert_eq!(map.get(NodeId(1)), Ok(41));
        assert_eq!(
            map.get(NodeId(2)),
            Err(ReplyError::NodeRemovedFromGroup(NodeId(2)))
        );
        assert_eq!(
            map.get(NodeId(3)),
            Err(ReplyError::RemoteExceptionOccurred(NodeId(3)))
        );
        assert!(pending.all_resolved());
    }

    #[test]
    fn removed_node_needs_fulfilled_map() {
        let (pending, query) = results::<u64>();
        pending.set_exception_for_removed_node(NodeId(2));
        pending.fulfill_map(&D);
        // The earlier notice was before fulfill_map and must not stick.
        assert!(query.wait(Duration::from_millis(10)).is_some());
        assert!(!query.get().valid(NodeId(2)));
    }

    #[test]
    fn removed_node_ignored_for_non_destinations_and_responders() {
        let (pending, query) = results::<u64>();
        pending.fulfill_map(&[NodeId(1), NodeId(2)]);
        pending.set_value(NodeId(2), 9);
        // 2 already responded, 7 was never a destination.
        pending.set_exception_for_removed_node(NodeId(2));
        pending.set_exception_for_removed_node(NodeId(7));
        let map = query.get();
        assert_eq!(map.get(NodeId(2)), Ok(9));
        assert!(!map.contains(NodeId(7)));
    }

    #[test]
    fn removal_surfaces_exactly_once() {
        let (pending, query) = results::<u64>();
        pending.fulfill_map(&D);
        pending.set_exception_for_removed_node(NodeId(2));
        pending.set_exception_for_removed_node(NodeId(2));
        // A late reply from the removed node loses the race.
        pending.set_value(NodeId(2), 1);
        let map = query.get();
        assert_eq!(
            map.get(NodeId(2)),
            Err(ReplyError::NodeRemovedFromGroup(NodeId(2)))
        );
    }

    #[test]
    fn reply_racing_removal_first_wins() {
        let (pending, query) = results::<u64>();
        pending.fulfill_map(&D);
        pending.set_value(NodeId(2), 5);
        pending.set_exception_for_removed_node(NodeId(2));
        assert_eq!(query.get().get(NodeId(2)), Ok(5));
    }

    #[test]
    fn all_resolved_requires_every_slot() {
        let (pending, _query) = results::<u64>();
        pending.fulfill_map(&D);
        pending.set_value(NodeId(1), 1);
        pending.set_value(NodeId(2), 2);
        assert!(!pending.all_resolved());
        pending.set_value(NodeId(3), 3);
        assert!(pending.all_resolved());
    }

    #[test]
    fn void_pair_is_inert() {
        let (pending, _query) = results_void();
        pending.fulfill_map(&D);
    }
}
