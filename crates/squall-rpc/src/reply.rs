//! Per-peer reply slots and the map that collects them.

use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex};

use thiserror::Error;

use squall_rdma::NodeId;

/// A peer-scoped RPC failure, delivered through that peer's reply slot.
#[derive(Debug, Error, Clone, Copy, Eq, PartialEq)]
#[non_exhaustive]
pub enum ReplyError {
    /// The peer reported an application-level exception while handling
    /// the call.
    #[error("node {0} reported a remote exception")]
    RemoteExceptionOccurred(NodeId),

    /// The peer was removed from the group before replying.
    #[error("node {0} was removed from the group before replying")]
    NodeRemovedFromGroup(NodeId),
}

/// What a slot currently holds.
enum SlotState<T> {
    /// Nothing yet.
    Waiting,
    /// An outcome, not yet handed to the caller.
    Ready(Result<T, ReplyError>),
    /// The outcome has been handed out.
    Consumed,
}

/// A single-assignment slot for one peer's outcome.
///
/// The first assignment wins; later ones are discarded.  This is what
/// resolves the race between a reply arriving and the peer being
/// declared removed: whichever happens first sticks.
pub(crate) struct ReplySlot<T> {
    /// Slot state.
    state: Mutex<SlotState<T>>,
    /// Notified on the transition to `Ready`.
    ready: Condvar,
}

impl<T> ReplySlot<T> {
    /// Create an empty slot.
    fn new() -> Self {
        ReplySlot {
            state: Mutex::new(SlotState::Waiting),
            ready: Condvar::new(),
        }
    }

    /// Install `outcome` if the slot is still empty.
    ///
    /// Returns true if this call filled the slot.
    pub(crate) fn fulfill(&self, outcome: Result<T, ReplyError>) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        match *state {
            SlotState::Waiting => {
                *state = SlotState::Ready(outcome);
                self.ready.notify_all();
                true
            }
            SlotState::Ready(_) | SlotState::Consumed => false,
        }
    }

    /// Return true if an outcome is present and not yet consumed.
    fn is_ready(&self) -> bool {
        self.state
            .lock()
            .map(|state| matches!(*state, SlotState::Ready(_)))
            .unwrap_or(false)
    }

    /// Return true if an outcome has been or could still be handed out.
    fn is_resolved(&self) -> bool {
        self.state
            .lock()
            .map(|state| !matches!(*state, SlotState::Waiting))
            .unwrap_or(false)
    }

    /// Block until an outcome is present, then hand it out.
    ///
    /// # Panics
    ///
    /// Panics if the outcome was already consumed, or if the lock is
    /// poisoned.
    fn take_blocking(&self) -> Result<T, ReplyError> {
        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("reply slot lock poisoned");
        loop {
            match std::mem::replace(&mut *state, SlotState::Consumed) {
                SlotState::Ready(outcome) => return outcome,
                SlotState::Waiting => {
                    *state = SlotState::Waiting;
                    #[allow(clippy::expect_used)]
                    let guard = self.ready.wait(state).expect("reply slot lock poisoned");
                    state = guard;
                }
                SlotState::Consumed => panic!("reply slot consumed twice"),
            }
        }
    }
}

/// The per-peer outcomes of one outgoing call, ordered by peer id.
///
/// Produced once per call, when the send completes and the real
/// destination set is known.
pub struct ReplyMap<T> {
    /// One slot per destination.
    slots: BTreeMap<NodeId, ReplySlot<T>>,
}

impl<T> ReplyMap<T> {
    /// Create a map with one empty slot per destination.
    pub(crate) fn new(destinations: &[NodeId]) -> Self {
        let slots = destinations
            .iter()
            .map(|&peer| (peer, ReplySlot::new()))
            .collect();
        ReplyMap { slots }
    }

    /// Return true if `peer` was a destination of this call.
    pub fn contains(&self, peer: NodeId) -> bool {
        self.slots.contains_key(&peer)
    }

    /// Return true if `peer`'s outcome has arrived and has not yet been
    /// consumed by [`get`](Self::get).
    pub fn valid(&self, peer: NodeId) -> bool {
        self.slots.get(&peer).is_some_and(ReplySlot::is_ready)
    }

    /// Consume `peer`'s outcome, blocking until it arrives.
    ///
    /// # Panics
    ///
    /// Panics if `peer` was not a destination of this call, or if the
    /// outcome was already consumed.
    pub fn get(&self, peer: NodeId) -> Result<T, ReplyError> {
        match self.slots.get(&peer) {
            Some(slot) => slot.take_blocking(),
            None => panic!("node {} was not a destination of this call", peer),
        }
    }

    /// Iterate over the destinations, in ascending id order.
    pub fn peers(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.slots.keys().copied()
    }

    /// Return the number of destinations.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Return true if the call had no destinations.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Look up the slot for `peer`.
    pub(crate) fn slot(&self, peer: NodeId) -> Option<&ReplySlot<T>> {
        self.slots.get(&peer)
    }

    /// Return true once every slot holds (or has handed out) an
    /// outcome.
    pub(crate) fn all_resolved(&self) -> bool {
        self.slots.values().all(ReplySlot::is_resolved)
    }
}

impl<T> std::fmt::Debug for ReplyMap<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyMap")
            .field("peers", &self.slots.keys().collect::<Vec<_>>())
            .finish()
    }
}
