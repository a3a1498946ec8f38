//! Pairwise registered memory regions.

use std::sync::Weak;
use std::time::Duration;

use tracing::{debug, error, trace};

use crate::buf::BufSlice;
use crate::ctx::RdmaTransport;
use crate::exchange::{exchange_descriptors, RegionDescriptor};
use crate::mgr::Connection;
use crate::provider::{MrAccess, MrKey, RdmaDomain, RegisteredMr, RemoteWrite, Vaddr};
use crate::util::RetryDelay;
use crate::{Error, NodeId, Result};

/// How long a signaled write may wait for its completion before the
/// connection is treated as dead.
const COMPLETION_TIMEOUT: Duration = Duration::from_secs(1);

/// Base delay for the registration retry backoff.
const REGISTER_RETRY_BASE: Duration = Duration::from_millis(10);

/// The byte each side sends during a `sync` rendezvous.
const SYNC_TOKEN: u8 = 0x53;

/// A pair of registered buffers bound to one remote peer.
///
/// The send buffer is the source of our one-sided writes; the receive
/// buffer is where the peer's writes land.  Both stay registered for
/// the whole lifetime of the region.  Offsets are symmetric: a write at
/// `offset` reads from `send_buf + offset` and lands at the same
/// displacement in the peer's receive buffer, which is what lets a
/// table mirror single fields without any address bookkeeping per
/// write.
pub struct MemoryRegion {
    /// The peer this region pairs with.
    remote: NodeId,
    /// Weak handle on the connection; upgraded per operation.
    conn: Weak<Connection>,
    /// Source bytes for outgoing writes.
    send_buf: BufSlice,
    /// Byte size of both buffers.
    size: usize,
    /// Registration of the send buffer.
    send_mr: Box<dyn RegisteredMr>,
    /// Registration of the receive buffer.  Held for its deregistration
    /// on drop; the peer owns the data path into it.
    _recv_mr: Box<dyn RegisteredMr>,
    /// Cached local key of the send registration.
    send_key: MrKey,
    /// The peer's registration key, learned during the exchange.
    remote_key: MrKey,
    /// Base address of the peer's receive buffer.
    remote_base: Vaddr,
}

impl MemoryRegion {
    /// Register `send_buf`/`recv_buf` and pair them with `remote`'s
    /// region by exchanging descriptors over the side channel.
    ///
    /// Blocks until the peer performs its half of the exchange.
    ///
    /// # Panics
    ///
    /// A registration or key-query failure other than "temporarily
    /// unavailable" aborts the process: the transport is misconfigured
    /// and no later attempt can do better.  Transient failures are
    /// retried indefinitely with jittered backoff.
    pub fn new(
        transport: &RdmaTransport,
        remote: NodeId,
        send_buf: BufSlice,
        recv_buf: BufSlice,
    ) -> Result<Self> {
        if send_buf.len() != recv_buf.len() {
            return Err(Error::Internal("send/recv buffer size mismatch"));
        }
        let size = send_buf.len();

        let weak = transport.connections().get(remote)?;
        let conn = weak
            .upgrade()
            .ok_or(Error::ConnectionRemoved { peer: remote })?;
        conn.check_usable()?;

        let domain = transport.domain();
        let send_mr = register_or_die(domain, &send_buf, "send");
        let recv_mr = register_or_die(domain, &recv_buf, "recv");
        let send_key = lkey_or_die(&*send_mr, "send");
        let recv_key = lkey_or_die(&*recv_mr, "recv");

        let mine = RegionDescriptor {
            key: recv_key,
            addr: recv_buf.vaddr(),
        };
        let theirs =
            conn.with_channel("descriptor exchange", |s| exchange_descriptors(s, mine))?;
        debug!(
            "region to node {} paired: local key {}, remote key {} at {}",
            remote, recv_key, theirs.key, theirs.addr
        );

        Ok(MemoryRegion {
            remote,
            conn: weak,
            send_buf,
            size,
            send_mr,
            _recv_mr: recv_mr,
            send_key,
            remote_key: theirs.key,
            remote_base: theirs.addr,
        })
    }

    /// Return the peer this region pairs with.
    pub fn remote(&self) -> NodeId {
        self.remote
    }

    /// Return the byte size of the region.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Issue a one-sided write of `send_buf[offset .. offset + len]`
    /// into the peer's receive buffer at the same offset.
    ///
    /// With `with_completion`, blocks until the transport acknowledges
    /// the write (or the completion times out, which breaks the
    /// connection).  Without it, returns as soon as the transport
    /// accepts the request.
    ///
    /// The range must satisfy `offset + len <= size`; a violating
    /// request is rejected before anything is posted.
    pub fn write_remote(&self, offset: usize, len: usize, with_completion: bool) -> Result<()> {
        if offset.checked_add(len).is_none_or(|end| end > self.size) {
            return Err(Error::WriteOutOfRange {
                offset,
                len,
                size: self.size,
            });
        }
        let conn = self
            .conn
            .upgrade()
            .ok_or(Error::ConnectionRemoved { peer: self.remote })?;
        conn.check_usable()?;

        let write = RemoteWrite {
            local_key: self.send_key,
            local_addr: self.send_buf.vaddr().offset(offset),
            len,
            remote_key: self.remote_key,
            remote_addr: self.remote_base.offset(offset),
            signaled: with_completion,
        };
        trace!(
            "posting {}-byte write at offset {} to node {}",
            len,
            offset,
            self.remote
        );
        if let Err(e) = conn.endpoint().post_write(&write) {
            debug!("write to node {} failed: {}", self.remote, e);
            conn.mark_broken();
            return Err(Error::ConnectionBroken { peer: self.remote });
        }
        if with_completion {
            if let Err(e) = conn.endpoint().poll_completion(COMPLETION_TIMEOUT) {
                debug!("completion from node {} not observed: {}", self.remote, e);
                conn.mark_broken();
                return Err(Error::ConnectionBroken { peer: self.remote });
            }
        }
        Ok(())
    }

    /// Rendezvous with the peer: both sides exchange a token over the
    /// side channel, so the call returns only once both have entered
    /// it and all prior side-channel traffic is flushed.
    pub fn sync(&self) -> Result<()> {
        let conn = self
            .conn
            .upgrade()
            .ok_or(Error::ConnectionRemoved { peer: self.remote })?;
        conn.check_usable()?;
        conn.with_channel("sync rendezvous", |s| {
            use std::io::{Read, Write};
            s.write_all(&[SYNC_TOKEN])?;
            s.flush()?;
            let mut token = [0_u8; 1];
            s.read_exact(&mut token)?;
            Ok(())
        })
    }
}

impl std::fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("remote", &self.remote)
            .field("size", &self.size)
            .field("send_key", &self.send_key)
            .field("remote_key", &self.remote_key)
            .finish()
    }
}

/// Register `buf`, retrying transient failures forever and aborting on
/// anything else.
fn register_or_die(
    domain: &std::sync::Arc<dyn RdmaDomain>,
    buf: &BufSlice,
    what: &'static str,
) -> Box<dyn RegisteredMr> {
    let mut retry = RetryDelay::from_duration(REGISTER_RETRY_BASE);
    let mut rng = rand::rng();
    loop {
        match domain.register(buf.clone(), MrAccess::remote_read_write()) {
            Ok(mr) => return mr,
            Err(e) if e.is_transient() => {
                let delay = retry.next_delay(&mut rng);
                debug!(
                    "{} buffer registration busy, retrying in {:?}",
                    what, delay
                );
                std::thread::sleep(delay);
            }
            Err(e) => {
                error!("{} buffer registration failed: {}", what, e);
                panic!("memory registration failed: {}", e);
            }
        }
    }
}

/// Query a registration's local key, aborting if the provider cannot
/// report one.
fn lkey_or_die(mr: &dyn RegisteredMr, what: &'static str) -> MrKey {
    match mr.lkey() {
        Ok(key) => key,
        Err(e) => {
            error!("{} buffer key query failed: {}", what, e);
            panic!("local key query failed: {}", e);
        }
    }
}
