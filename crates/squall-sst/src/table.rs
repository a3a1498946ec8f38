//! The shared state table.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, warn};

use squall_rdma::{BufSlice, MemoryRegion, NodeId, RdmaTransport, RegionBuf};

use crate::config::SstConfig;
use crate::layout::{FieldElement, FieldRange, ScalarField, SstLayout, VectorField};
use crate::predicates::Predicates;
use crate::{liveness, predicates, Error, Result};

/// The callback invoked when a peer is classified as failed.
type FailureUpcall = Arc<dyn Fn(NodeId) + Send + Sync>;

/// A shared state table: one row per member, the local row writable,
/// every other row a mirror refreshed by its owner's remote writes.
///
/// Owns the two background workers (predicate scanner, heartbeat
/// supervisor); dropping the table stops them.  All table operations
/// live on [`SstHandle`], which `Sst` dereferences to.
pub struct Sst {
    /// The operations surface; also what worker threads hold weakly.
    handle: SstHandle,
    /// Background workers, joined on drop.
    workers: Vec<JoinHandle<()>>,
}

impl Sst {
    /// Build a table over `transport` with the given row layout.
    ///
    /// Ranks are assigned by ascending id over `config.peers()`; the
    /// local id must be listed.  Construction registers one memory
    /// region per peer and blocks until every peer has paired with us,
    /// so all members must construct their tables concurrently.
    pub fn new(
        config: SstConfig,
        transport: Arc<RdmaTransport>,
        layout: SstLayout,
    ) -> Result<Sst> {
        if transport.local_id() != config.local_id() {
            return Err(Error::Internal("transport is bound to a different node id"));
        }
        let members: Vec<NodeId> = config.peers().keys().copied().collect();
        let local_rank = members
            .iter()
            .position(|&id| id == config.local_id())
            .ok_or(Error::NotAMember {
                peer: config.local_id(),
            })?;

        let stride = layout.stride();
        let rows = RegionBuf::zeroed(members.len() * stride);

        // One region per peer: our row as the send buffer, the peer's
        // mirror row as the receive buffer.  Pairing happens in rank
        // order on every member, so the blocking exchanges line up.
        let mut regions = Vec::with_capacity(members.len());
        for (rank, &peer) in members.iter().enumerate() {
            if rank == local_rank {
                regions.push(None);
                continue;
            }
            let send = BufSlice::new(Arc::clone(&rows), local_rank * stride, stride);
            let recv = BufSlice::new(Arc::clone(&rows), rank * stride, stride);
            regions.push(Some(MemoryRegion::new(&transport, peer, send, recv)?));
        }

        let live = members.iter().map(|_| AtomicBool::new(true)).collect();
        let inner = Arc::new(SstInner {
            transport,
            layout,
            members,
            local_rank,
            stride,
            rows,
            regions,
            live,
            predicates: Predicates::new(),
            failure_upcall: Mutex::new(None),
            config,
            shutdown: AtomicBool::new(false),
        });

        let workers = vec![
            predicates::spawn_scanner(&inner)?,
            liveness::spawn_supervisor(&inner)?,
        ];
        debug!(
            "table up: {} rows of {} bytes, local rank {}",
            inner.members.len(),
            stride,
            local_rank
        );
        Ok(Sst {
            handle: SstHandle { inner },
            workers,
        })
    }

    /// Stop the background workers.  Called automatically on drop.
    pub fn shutdown(&mut self) {
        self.handle.inner.shutdown.store(true, Ordering::Release);
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl std::ops::Deref for Sst {
    type Target = SstHandle;

    fn deref(&self) -> &SstHandle {
        &self.handle
    }
}

impl Drop for Sst {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Sst {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sst")
            .field("members", &self.handle.inner.members)
            .field("local_rank", &self.handle.inner.local_rank)
            .finish()
    }
}

/// A cheap, cloneable reference to a table.
///
/// This is what predicate triggers and actions receive, and what the
/// background workers operate through.
#[derive(Clone)]
pub struct SstHandle {
    /// The shared table state.
    pub(crate) inner: Arc<SstInner>,
}

impl SstHandle {
    /// Return this process's row rank.
    pub fn local_index(&self) -> usize {
        self.inner.local_rank
    }

    /// Return the members, in rank order.
    pub fn members(&self) -> &[NodeId] {
        &self.inner.members
    }

    /// Return the rank of `peer`, if it is a member.
    pub fn rank_of(&self, peer: NodeId) -> Option<usize> {
        self.inner.members.iter().position(|&id| id == peer)
    }

    /// Return true if row `row`'s owner is still believed alive.
    ///
    /// A failed peer's row stays readable but stale; callers that care
    /// gate their reads on this bit.
    pub fn is_live(&self, row: usize) -> Result<bool> {
        self.inner.check_row(row)?;
        Ok(self.inner.live[row].load(Ordering::Acquire))
    }

    /// Read a scalar field from any row.
    pub fn read<T: FieldElement>(&self, field: ScalarField<T>, row: usize) -> Result<T> {
        self.inner.read_scalar(field, row)
    }

    /// Write a scalar field of the local row.
    ///
    /// Writing any other row is a programming error: mirrors belong to
    /// their owners, and the write is rejected before touching them.
    pub fn write<T: FieldElement>(
        &self,
        field: ScalarField<T>,
        row: usize,
        value: T,
    ) -> Result<()> {
        self.inner.write_scalar(field, row, value)
    }

    /// Read one element of a vector field from any row.
    pub fn read_vec<T: FieldElement>(
        &self,
        field: VectorField<T>,
        row: usize,
        idx: usize,
    ) -> Result<T> {
        self.inner.check_row(row)?;
        self.inner.check_vec_elem(field, idx)?;
        // SAFETY: row and element bounds checked against this table.
        Ok(unsafe { T::load(self.inner.field_ptr(row, field.elem_offset(idx))) })
    }

    /// Write one element of a vector field of the local row.
    pub fn write_vec<T: FieldElement>(
        &self,
        field: VectorField<T>,
        row: usize,
        idx: usize,
        value: T,
    ) -> Result<()> {
        self.inner.check_local_row(row)?;
        self.inner.check_vec_elem(field, idx)?;
        // SAFETY: row and element bounds checked against this table.
        unsafe { value.store(self.inner.field_ptr(row, field.elem_offset(idx))) };
        Ok(())
    }

    /// Push the whole local row to every live peer's mirror, without
    /// waiting for completions.
    pub fn put(&self) -> Result<()> {
        self.inner.put_bytes(0, self.inner.stride, false)
    }

    /// Push one field (or span of fields) of the local row to every
    /// live peer's mirror, without waiting for completions.
    pub fn put_field(&self, field: &impl FieldRange) -> Result<()> {
        self.inner.put_bytes(field.offset(), field.width(), false)
    }

    /// As [`put_field`](Self::put_field), but wait for transport-level
    /// completion from each peer before returning.
    pub fn put_with_completion(&self, field: &impl FieldRange) -> Result<()> {
        self.inner.put_bytes(field.offset(), field.width(), true)
    }

    /// Rendezvous with every live peer, in rank order.
    ///
    /// Returns once all of them have entered the same call.
    pub fn sync_with_members(&self) -> Result<()> {
        for (rank, region) in self.inner.regions.iter().enumerate() {
            let Some(region) = region else { continue };
            if !self.inner.live[rank].load(Ordering::Acquire) {
                continue;
            }
            if let Err(e) = region.sync() {
                self.inner.fail(rank);
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Return the predicate registry.
    pub fn predicates(&self) -> &Predicates {
        &self.inner.predicates
    }

    /// Install the failure upcall.
    ///
    /// The callback runs at most once per peer, from the thread that
    /// classified the failure.  The RPC engine hooks its
    /// removed-node exception path in here.
    pub fn set_failure_upcall(&self, upcall: impl Fn(NodeId) + Send + Sync + 'static) {
        if let Ok(mut guard) = self.inner.failure_upcall.lock() {
            *guard = Some(Arc::new(upcall));
        }
    }
}

impl std::fmt::Debug for SstHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SstHandle")
            .field("members", &self.inner.members)
            .field("local_rank", &self.inner.local_rank)
            .finish()
    }
}

/// Shared table state.
pub(crate) struct SstInner {
    /// The transport context.
    pub(crate) transport: Arc<RdmaTransport>,
    /// The row layout.
    pub(crate) layout: SstLayout,
    /// Members in rank order (ascending id).
    pub(crate) members: Vec<NodeId>,
    /// Our rank.
    pub(crate) local_rank: usize,
    /// Byte width of one row.
    pub(crate) stride: usize,
    /// The row block: `members.len() * stride` bytes.
    rows: Arc<RegionBuf>,
    /// One region per peer, `None` at the local rank.
    pub(crate) regions: Vec<Option<MemoryRegion>>,
    /// Liveness bitmap, one bit per rank.
    pub(crate) live: Vec<AtomicBool>,
    /// The predicate registry.
    pub(crate) predicates: Predicates,
    /// The failure upcall, if installed.
    failure_upcall: Mutex<Option<FailureUpcall>>,
    /// The configuration this table was built with.
    pub(crate) config: SstConfig,
    /// Set when the owning `Sst` shuts down; workers exit on seeing it.
    pub(crate) shutdown: AtomicBool,
}

impl SstInner {
    /// Error unless `row` exists.
    fn check_row(&self, row: usize) -> Result<()> {
        if row >= self.members.len() {
            return Err(Error::NoSuchRow {
                row,
                rows: self.members.len(),
            });
        }
        Ok(())
    }

    /// Error unless `row` exists and is the local row.
    fn check_local_row(&self, row: usize) -> Result<()> {
        self.check_row(row)?;
        if row != self.local_rank {
            return Err(Error::NotLocalRow {
                row,
                local: self.local_rank,
            });
        }
        Ok(())
    }

    /// Error unless the byte range fits in a row of this table.
    fn check_range(&self, offset: usize, width: usize) -> Result<()> {
        if offset.checked_add(width).is_none_or(|end| end > self.stride) {
            return Err(Error::FieldOutOfRow {
                offset,
                width,
                stride: self.stride,
            });
        }
        Ok(())
    }

    /// Error unless element `idx` of `field` fits in a row.
    fn check_vec_elem<T: FieldElement>(&self, field: VectorField<T>, idx: usize) -> Result<()> {
        if idx >= field.len() {
            return Err(Error::IndexOutOfBounds {
                idx,
                len: field.len(),
            });
        }
        self.check_range(field.offset(), field.width())
    }

    /// Pointer to `offset_in_row` within `row`.  Callers must have
    /// bounds-checked both.
    fn field_ptr(&self, row: usize, offset_in_row: usize) -> *mut u8 {
        self.rows.ptr_at(row * self.stride + offset_in_row)
    }

    /// Read a scalar field from any row.
    pub(crate) fn read_scalar<T: FieldElement>(
        &self,
        field: ScalarField<T>,
        row: usize,
    ) -> Result<T> {
        self.check_row(row)?;
        self.check_range(field.offset(), field.width())?;
        // SAFETY: row and range checked against this table.
        Ok(unsafe { T::load(self.field_ptr(row, field.offset())) })
    }

    /// Write a scalar field of the local row.
    pub(crate) fn write_scalar<T: FieldElement>(
        &self,
        field: ScalarField<T>,
        row: usize,
        value: T,
    ) -> Result<()> {
        self.check_local_row(row)?;
        self.check_range(field.offset(), field.width())?;
        // SAFETY: row and range checked against this table.
        unsafe { value.store(self.field_ptr(row, field.offset())) };
        Ok(())
    }

    /// One-sided write of `local row[offset .. offset+len]` to every
    /// live peer's mirror.
    ///
    /// Attempts every peer even if one fails; the first error is
    /// returned after the loop, and the failing peer goes through the
    /// failure path.
    pub(crate) fn put_bytes(&self, offset: usize, len: usize, completion: bool) -> Result<()> {
        self.check_range(offset, len)?;
        let mut first_err = None;
        for (rank, region) in self.regions.iter().enumerate() {
            let Some(region) = region else { continue };
            if !self.live[rank].load(Ordering::Acquire) {
                continue;
            }
            if let Err(e) = region.write_remote(offset, len, completion) {
                debug!("put to node {} failed: {}", self.members[rank], e);
                self.fail(rank);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e.into()),
        }
    }

    /// Classify the owner of `rank` as failed.
    ///
    /// Idempotent per peer: the first caller clears the liveness bit,
    /// breaks the connection, and runs the upcall; later calls return
    /// immediately.
    pub(crate) fn fail(&self, rank: usize) {
        if rank == self.local_rank || rank >= self.members.len() {
            return;
        }
        if !self.live[rank].swap(false, Ordering::AcqRel) {
            return;
        }
        let peer = self.members[rank];
        warn!("node {} classified as failed", peer);
        self.transport.connections().mark_broken(peer);

        let upcall = self
            .failure_upcall
            .lock()
            .ok()
            .and_then(|guard| guard.clone());
        if let Some(upcall) = upcall {
            upcall(peer);
        }
    }
}
