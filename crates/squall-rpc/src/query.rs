//! The read side of a call's reply tracking.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::pending::Shared;
use crate::reply::ReplyMap;

/// How long each blocking quantum of [`QueryResults::get`] lasts.
const GET_POLL_QUANTUM: Duration = Duration::from_secs(5 * 60);

/// The read side of one call's reply tracking, held by the caller.
///
/// Movable but not copyable: exactly one party may consume each reply.
pub struct QueryResults<T> {
    /// State shared with the pending side.
    shared: Arc<Shared<T>>,
    /// Local cache of the published map, so repeated waits are free.
    map: OnceLock<Arc<ReplyMap<T>>>,
}

impl<T> QueryResults<T> {
    /// Wrap the shared state.  Only `results()` calls this.
    pub(crate) fn new(shared: Arc<Shared<T>>) -> Self {
        QueryResults {
            shared,
            map: OnceLock::new(),
        }
    }

    /// Block up to `timeout` for the reply map to become available.
    ///
    /// Returns `None` on timeout.  Once the map has been observed,
    /// subsequent calls return immediately.
    pub fn wait(&self, timeout: Duration) -> Option<&ReplyMap<T>> {
        if let Some(map) = self.map.get() {
            return Some(map);
        }
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock().ok()?;
        loop {
            if let Some(map) = &state.map {
                let map = Arc::clone(map);
                drop(state);
                let _ = self.map.set(map);
                return self.map.get().map(|m| &**m);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .shared
                .map_ready
                .wait_timeout(state, deadline - now)
                .ok()?;
            state = guard;
        }
    }

    /// Block indefinitely for the reply map.
    ///
    /// Implemented by polling [`wait`](Self::wait) in five-minute
    /// quanta, so a wedged call shows up in thread dumps as a live
    /// loop rather than an eternal park.
    pub fn get(&self) -> &ReplyMap<T> {
        while self.wait(GET_POLL_QUANTUM).is_none() {
            trace!("still waiting for reply map");
        }
        #[allow(clippy::unwrap_used)]
        self.map.get().map(|m| &**m).unwrap()
    }
}

impl<T> std::fmt::Debug for QueryResults<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryResults")
            .field("map_available", &self.map.get().is_some())
            .finish()
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::missing_docs_in_private_items)]
    use crate::pending::results;
    use crate::reply::ReplyError;
    use squall_rdma::NodeId;
    use std::time::Duration;

    #[test]
    fn wait_times_out_before_fulfill_map() {
        let (_pending, query) = results::<u32>();
        assert!(query.wait(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn wait_returns_immediately_after_availability() {
        let (pending, query) = results::<u32>();
        pending.fulfill_map(&[NodeId(4)]);
        assert!(query.wait(Duration::from_millis(1)).is_some());
        // Second call takes the cached path.
        assert!(query.wait(Duration::ZERO).is_some());
    }

    #[test]
    fn get_blocks_until_fulfilled_from_another_thread() {
        let (pending, query) = results::<u32>();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            pending.fulfill_map(&[NodeId(1)]);
            pending.set_value(NodeId(1), 99);
        });
        let map = query.get();
        assert_eq!(map.get(NodeId(1)), Ok(99));
        t.join().unwrap();
    }

    #[test]
    fn map_get_blocks_until_slot_is_fed() {
        let (pending, query) = results::<u32>();
        pending.fulfill_map(&[NodeId(1), NodeId(2)]);
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            pending.set_exception(NodeId(1), ReplyError::RemoteExceptionOccurred(NodeId(1)));
            pending.set_value(NodeId(2), 3);
        });
        let map = query.get();
        assert_eq!(
            map.get(NodeId(1)),
            Err(ReplyError::RemoteExceptionOccurred(NodeId(1)))
        );
        assert_eq!(map.get(NodeId(2)), Ok(3));
        t.join().unwrap();
    }

    #[test]
    fn query_moves_across_threads() {
        let (pending, query) = results::<String>();
        pending.fulfill_map(&[NodeId(8)]);
        pending.set_value(NodeId(8), "hi".to_owned());
        let t = std::thread::spawn(move || query.get().get(NodeId(8)).unwrap());
        assert_eq!(t.join().unwrap(), "hi");
    }
}
