//! Heartbeats and failure classification.
//!
//! The supervisor thread periodically bumps the local heartbeat field
//! and pushes it to every live peer with a completion-signaled write.
//! Two signals classify a peer as failed: a transport error (or
//! completion timeout) on that push, and a peer's mirrored heartbeat
//! sitting unchanged for longer than the liveness window.  Either way
//! the peer goes through [`SstInner::fail`]: connection broken once,
//! liveness bit cleared once, upcall run once.

use std::result::Result as StdResult;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, trace};
use void::{ResultVoidErrExt, Void};

use crate::layout::FieldRange;
use crate::table::SstInner;
use crate::{Error, Result};

/// What the supervisor remembers about one peer's heartbeat.
struct Observed {
    /// The last heartbeat value seen in the peer's mirror.
    value: u64,
    /// When the value last changed.
    changed_at: Instant,
}

/// Spawn the heartbeat/failure supervisor for `inner`.
pub(crate) fn spawn_supervisor(inner: &Arc<SstInner>) -> Result<JoinHandle<()>> {
    let interval = inner.config.heartbeat_interval();
    let window = inner.config.liveness_window();
    let n_members = inner.members.len();
    let weak = Arc::downgrade(inner);
    std::thread::Builder::new()
        .name(format!("squall-sst-live-{}", inner.config.local_id()))
        .spawn(move || supervisor_loop(&weak, interval, window, n_members))
        .map_err(|_| Error::Internal("could not spawn heartbeat supervisor"))
}

/// Supervisor loop: bump, push, observe, classify; exit when the table
/// is gone or shutting down.
fn supervisor_loop(
    weak: &Weak<SstInner>,
    interval: Duration,
    window: Duration,
    n_members: usize,
) {
    let start = Instant::now();
    let mut observed: Vec<Observed> = (0..n_members)
        .map(|_| Observed {
            value: 0,
            changed_at: start,
        })
        .collect();

    let termination_reason: StdResult<Void, &str> = loop {
        std::thread::sleep(interval);
        let Some(inner) = weak.upgrade() else {
            break Err("table dropped");
        };
        if inner.shutdown.load(Ordering::Acquire) {
            break Err("shutdown");
        }
        beat(&inner);
        observe(&inner, &mut observed, window);
    };
    debug!(
        "heartbeat supervisor exiting: {}",
        termination_reason.void_unwrap_err()
    );
}

/// Bump the local heartbeat and push it to every live peer, waiting
/// for each completion.  A push that errors classifies its peer.
fn beat(inner: &SstInner) {
    let heartbeat = inner.layout.heartbeat();
    let Ok(current) = inner.read_scalar(heartbeat, inner.local_rank) else {
        return;
    };
    let next = current.wrapping_add(1);
    if inner
        .write_scalar(heartbeat, inner.local_rank, next)
        .is_err()
    {
        return;
    }
    trace!("heartbeat {}", next);

    for (rank, region) in inner.regions.iter().enumerate() {
        let Some(region) = region else { continue };
        if !inner.live[rank].load(Ordering::Acquire) {
            continue;
        }
        if let Err(e) = region.write_remote(heartbeat.offset(), heartbeat.width(), true) {
            debug!(
                "heartbeat push to node {} failed: {}",
                inner.members[rank], e
            );
            inner.fail(rank);
        }
    }
}

/// Check every live peer's mirrored heartbeat for staleness.
fn observe(inner: &SstInner, observed: &mut [Observed], window: Duration) {
    let heartbeat = inner.layout.heartbeat();
    for rank in 0..inner.members.len() {
        if rank == inner.local_rank || !inner.live[rank].load(Ordering::Acquire) {
            continue;
        }
        let Ok(value) = inner.read_scalar(heartbeat, rank) else {
            continue;
        };
        let seen = &mut observed[rank];
        if value != seen.value {
            seen.value = value;
            seen.changed_at = Instant::now();
        } else if seen.changed_at.elapsed() > window {
            debug!(
                "node {} heartbeat stale for {:?}",
                inner.members[rank],
                seen.changed_at.elapsed()
            );
            inner.fail(rank);
        }
    }
}
