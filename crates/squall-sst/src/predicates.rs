//! Predicates: boolean triggers over the table, with actions that run
//! when they hold.
//!
//! A dedicated scanner thread wakes at the configured poll interval and
//! walks the registered predicates in registration order.  When a
//! trigger returns true its action runs synchronously on the scanner
//! thread, so actions see a table no older than their trigger did.
//! Registrations made from inside an action (or from any other thread
//! mid-scan) take effect at the start of the next scan cycle.

use std::collections::BTreeSet;
use std::result::Result as StdResult;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use tracing::{debug, trace};
use void::{ResultVoidErrExt, Void};

use crate::table::{SstHandle, SstInner};
use crate::{Error, Result};

/// How often a predicate fires.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub enum PredicateKind {
    /// Retired after its first fire.
    OneTime,
    /// Re-armed after every fire.
    Recurring,
}

/// Names a registered predicate, for later removal.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct PredicateHandle(u64);

/// A trigger: true when the action should run.
type Trigger = Box<dyn Fn(&SstHandle) -> bool + Send>;

/// An action, run on the scanner thread when its trigger holds.
type Action = Box<dyn Fn(&SstHandle) + Send>;

/// One registered predicate.
struct Entry {
    /// Identity, as handed back to the registrant.
    id: u64,
    /// How often it fires.
    kind: PredicateKind,
    /// The trigger.
    trigger: Trigger,
    /// The action.
    action: Action,
}

/// Registry state, inside the lock.
#[derive(Default)]
struct Inner {
    /// Next id to hand out.
    next_id: u64,
    /// Predicates the scanner currently walks, in registration order.
    active: Vec<Entry>,
    /// Registered since the last cycle started; merged at the next.
    staged: Vec<Entry>,
    /// Removed since the last cycle started; purged at the next.
    removed: BTreeSet<u64>,
}

/// The predicate registry of one table.
pub struct Predicates {
    /// Registry state.
    inner: Mutex<Inner>,
}

impl Predicates {
    /// Create an empty registry.
    pub(crate) fn new() -> Self {
        Predicates {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Register a predicate.
    ///
    /// The scanner picks it up no earlier than its next cycle.  Within
    /// a cycle, predicates registered earlier fire first.
    pub fn register(
        &self,
        trigger: impl Fn(&SstHandle) -> bool + Send + 'static,
        action: impl Fn(&SstHandle) + Send + 'static,
        kind: PredicateKind,
    ) -> Result<PredicateHandle> {
        let mut inner = self.inner.lock()?;
        let id = inner.next_id;
        inner.next_id += 1;
        inner.staged.push(Entry {
            id,
            kind,
            trigger: Box::new(trigger),
            action: Box::new(action),
        });
        trace!("registered {:?} predicate {}", kind, id);
        Ok(PredicateHandle(id))
    }

    /// Remove a predicate.
    ///
    /// Takes effect at the start of the next scan cycle; a predicate
    /// mid-fire finishes its action.
    pub fn remove(&self, handle: PredicateHandle) -> Result<()> {
        let mut inner = self.inner.lock()?;
        inner.removed.insert(handle.0);
        Ok(())
    }

    /// Run one scan cycle.
    ///
    /// Merges staged registrations, purges removals, then walks the
    /// active list in order.  The lock is not held while triggers and
    /// actions run, so both may freely use the registry.
    pub(crate) fn scan(&self, table: &SstHandle) {
        let mut batch = {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            let staged = std::mem::take(&mut inner.staged);
            inner.active.extend(staged);
            let removed = std::mem::take(&mut inner.removed);
            if !removed.is_empty() {
                inner.active.retain(|entry| !removed.contains(&entry.id));
            }
            std::mem::take(&mut inner.active)
        };

        batch.retain(|entry| {
            let fired = (entry.trigger)(table);
            if fired {
                trace!("predicate {} fired", entry.id);
                (entry.action)(table);
            }
            !(fired && entry.kind == PredicateKind::OneTime)
        });

        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        // Anything registered during the scan sits in `staged`; the
        // surviving batch goes back in front of it, preserving order.
        inner.active = batch;
    }
}

impl std::fmt::Debug for Predicates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (active, staged) = self
            .inner
            .lock()
            .map(|inner| (inner.active.len(), inner.staged.len()))
            .unwrap_or((0, 0));
        f.debug_struct("Predicates")
            .field("active", &active)
            .field("staged", &staged)
            .finish()
    }
}

/// Spawn the scanner thread for `inner`.
pub(crate) fn spawn_scanner(inner: &Arc<SstInner>) -> Result<JoinHandle<()>> {
    let interval = inner.config.predicate_poll_interval();
    let weak = Arc::downgrade(inner);
    std::thread::Builder::new()
        .name(format!("squall-sst-pred-{}", inner.config.local_id()))
        .spawn(move || scanner_loop(&weak, interval))
        .map_err(|_| Error::Internal("could not spawn predicate scanner"))
}

/// Scanner loop: sleep, upgrade, scan, repeat; exit when the table is
/// gone or shutting down.
fn scanner_loop(weak: &Weak<SstInner>, interval: std::time::Duration) {
    let termination_reason: StdResult<Void, &str> = loop {
        std::thread::sleep(interval);
        let Some(inner) = weak.upgrade() else {
            break Err("table dropped");
        };
        if inner.shutdown.load(Ordering::Acquire) {
            break Err("shutdown");
        }
        let table = SstHandle { inner };
        table.inner.predicates.scan(&table);
    };
    debug!(
        "predicate scanner exiting: {}",
        termination_reason.void_unwrap_err()
    );
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::missing_docs_in_private_items)]
    use super::*;
    use crate::config::SstConfigBuilder;
    use crate::layout::SstLayout;
    use crate::table::Sst;
    use crate::NodeId;
    use squall_rdma::testing::loopback_cluster;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn solo_table() -> Sst {
        let (_fabric, nodes) = loopback_cluster(&[1]);
        let config = SstConfigBuilder::default()
            .local_id(NodeId(1))
            .peers(nodes[0].peers().clone())
            .predicate_poll_interval(Duration::from_millis(1))
            .liveness_window(Duration::from_secs(10))
            .build()
            .unwrap();
        Sst::new(config, Arc::clone(&nodes[0]), SstLayout::builder().build()).unwrap()
    }

    /// Sleep long enough for several scan cycles.
    fn settle() {
        std::thread::sleep(Duration::from_millis(60));
    }

    #[test]
    fn one_time_fires_at_most_once() {
        let sst = solo_table();
        let fired = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&fired);
        sst.predicates()
            .register(
                |_| true,
                move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                },
                PredicateKind::OneTime,
            )
            .unwrap();
        settle();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn recurring_fires_every_cycle_its_trigger_holds() {
        let sst = solo_table();
        let fired = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&fired);
        sst.predicates()
            .register(
                |_| true,
                move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                },
                PredicateKind::Recurring,
            )
            .unwrap();
        settle();
        assert!(fired.load(Ordering::SeqCst) > 1);
    }

    #[test]
    fn earlier_registrations_fire_first() {
        let sst = solo_table();
        let events = Arc::new(Mutex::new(Vec::new()));
        for label in ["first", "second"] {
            let log = Arc::clone(&events);
            sst.predicates()
                .register(
                    |_| true,
                    move |_| log.lock().unwrap().push(label),
                    PredicateKind::Recurring,
                )
                .unwrap();
        }
        settle();
        let log = events.lock().unwrap();
        assert!(log.len() >= 2);
        assert_eq!(&log[..2], &["first", "second"]);
    }

    #[test]
    fn actions_may_register_followup_predicates() {
        let sst = solo_table();
        let fired = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&fired);
        sst.predicates()
            .register(
                |_| true,
                move |table| {
                    let count = Arc::clone(&count);
                    table
                        .predicates()
                        .register(
                            |_| true,
                            move |_| {
                                count.fetch_add(1, Ordering::SeqCst);
                            },
                            PredicateKind::OneTime,
                        )
                        .unwrap();
                },
                PredicateKind::OneTime,
            )
            .unwrap();
        settle();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removal_stops_a_recurring_predicate() {
        let sst = solo_table();
        let fired = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&fired);
        let handle = sst
            .predicates()
            .register(
                |_| true,
                move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                },
                PredicateKind::Recurring,
            )
            .unwrap();
        settle();
        sst.predicates().remove(handle).unwrap();
        // Let any in-flight cycle drain before snapshotting.
        std::thread::sleep(Duration::from_millis(20));
        let snapshot = fired.load(Ordering::SeqCst);
        settle();
        assert_eq!(fired.load(Ordering::SeqCst), snapshot);
    }

    #[test]
    fn triggers_observe_table_state() {
        let (_fabric, nodes) = loopback_cluster(&[1]);
        let mut b = SstLayout::builder();
        let flag = b.scalar::<u64>();
        let layout = b.build();
        let config = SstConfigBuilder::default()
            .local_id(NodeId(1))
            .peers(nodes[0].peers().clone())
            .predicate_poll_interval(Duration::from_millis(1))
            .liveness_window(Duration::from_secs(10))
            .build()
            .unwrap();
        let sst = Sst::new(config, Arc::clone(&nodes[0]), layout).unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&fired);
        sst.predicates()
            .register(
                move |table| table.read(flag, 0).unwrap_or(0) == 7,
                move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                },
                PredicateKind::OneTime,
            )
            .unwrap();
        settle();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        sst.write(flag, 0, 7).unwrap();
        settle();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
