//! An in-process loopback fabric, for tests.
//!
//! Several [`RdmaTransport`] contexts in one process can share a
//! [`LoopbackFabric`]; each context then behaves like a node with its
//! own NIC.  Registration hands out real keys for real buffers, and a
//! posted write copies bytes straight into the target registration, so
//! everything above the provider seam (descriptor exchange, offsets,
//! bounds, completions) is exercised for real.
//!
//! [`LoopbackFabric::fail_node`] models a node going dark: writes from
//! or to it vanish and its completions stop arriving, which is exactly
//! what the failure detector upstairs is built to notice.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::trace;

use crate::buf::BufSlice;
use crate::ctx::RdmaTransport;
use crate::provider::{
    MrAccess, MrKey, ProviderError, RdmaDomain, RdmaEndpoint, RdmaProvider, RegisteredMr,
    RemoteWrite, Vaddr, WriteCompletion,
};
use crate::{NodeId, Result};

/// One registered segment of some node's memory.
struct Segment {
    /// The registered bytes.
    buf: BufSlice,
    /// The node that registered them.
    owner: NodeId,
}

/// Fabric state, inside the lock.
struct FabricInner {
    /// Next key to hand out.
    next_key: u64,
    /// Every live registration, by provider-assigned key.
    segments: HashMap<MrKey, Segment>,
    /// Nodes that have gone dark.
    failed: BTreeSet<NodeId>,
}

/// The shared in-process fabric.
pub struct LoopbackFabric {
    /// Fabric state.
    inner: Mutex<FabricInner>,
}

impl LoopbackFabric {
    /// Create an empty fabric.
    pub fn new() -> Arc<Self> {
        Arc::new(LoopbackFabric {
            inner: Mutex::new(FabricInner {
                next_key: 1,
                segments: HashMap::new(),
                failed: BTreeSet::new(),
            }),
        })
    }

    /// Make `node` go dark: its writes (in either direction) are
    /// silently discarded from now on, and signaled writes involving it
    /// stop producing completions.
    pub fn fail_node(self: &Arc<Self>, node: NodeId) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.failed.insert(node);
        }
    }

    /// Build a provider handle for this fabric.
    pub fn provider(self: &Arc<Self>) -> LoopbackProvider {
        LoopbackProvider {
            fabric: Arc::clone(self),
        }
    }
}

/// A [`RdmaProvider`] backed by a shared [`LoopbackFabric`].
#[derive(Clone)]
pub struct LoopbackProvider {
    /// The shared fabric.
    fabric: Arc<LoopbackFabric>,
}

impl RdmaProvider for LoopbackProvider {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn open_domain(&self, local: NodeId) -> std::result::Result<Box<dyn RdmaDomain>, ProviderError> {
        Ok(Box::new(LoopbackDomain {
            fabric: Arc::clone(&self.fabric),
            local,
        }))
    }
}

/// Per-node domain state.
struct LoopbackDomain {
    /// The shared fabric.
    fabric: Arc<LoopbackFabric>,
    /// The node this domain belongs to.
    local: NodeId,
}

impl RdmaDomain for LoopbackDomain {
    fn register(
        &self,
        buf: BufSlice,
        _access: MrAccess,
    ) -> std::result::Result<Box<dyn RegisteredMr>, ProviderError> {
        let mut inner = self
            .fabric
            .inner
            .lock()
            .map_err(|_| ProviderError::RegistrationFailed("fabric lock poisoned".into()))?;
        let key = MrKey(inner.next_key);
        inner.next_key += 1;
        let base = buf.vaddr();
        let len = buf.len();
        inner.segments.insert(
            key,
            Segment {
                buf,
                owner: self.local,
            },
        );
        trace!("node {} registered {} bytes as {}", self.local, len, key);
        Ok(Box::new(LoopbackMr {
            fabric: Arc::clone(&self.fabric),
            key,
            base,
            len,
        }))
    }

    fn connect(
        &self,
        remote: NodeId,
    ) -> std::result::Result<Box<dyn RdmaEndpoint>, ProviderError> {
        Ok(Box::new(LoopbackEndpoint {
            fabric: Arc::clone(&self.fabric),
            local: self.local,
            remote,
            completions: Mutex::new(VecDeque::new()),
            completion_arrived: Condvar::new(),
        }))
    }
}

/// A live loopback registration.
struct LoopbackMr {
    /// The shared fabric.
    fabric: Arc<LoopbackFabric>,
    /// The key this registration was assigned.
    key: MrKey,
    /// Base address of the registered range.
    base: Vaddr,
    /// Length of the registered range.
    len: usize,
}

impl RegisteredMr for LoopbackMr {
    fn lkey(&self) -> std::result::Result<MrKey, ProviderError> {
        Ok(self.key)
    }

    fn base(&self) -> Vaddr {
        self.base
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for LoopbackMr {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.fabric.inner.lock() {
            inner.segments.remove(&self.key);
        }
    }
}

/// A loopback endpoint from one node to one peer.
struct LoopbackEndpoint {
    /// The shared fabric.
    fabric: Arc<LoopbackFabric>,
    /// The node this endpoint belongs to.
    local: NodeId,
    /// The peer it reaches.
    remote: NodeId,
    /// Completions for signaled writes posted here.
    completions: Mutex<VecDeque<WriteCompletion>>,
    /// Notified when a completion is pushed.
    completion_arrived: Condvar,
}

impl RdmaEndpoint for LoopbackEndpoint {
    fn post_write(&self, write: &RemoteWrite) -> std::result::Result<(), ProviderError> {
        let inner = self
            .fabric
            .inner
            .lock()
            .map_err(|_| ProviderError::Endpoint("fabric lock poisoned".into()))?;

        if inner.failed.contains(&self.local) || inner.failed.contains(&self.remote) {
            // A dark node's traffic vanishes without a diagnostic; the
            // initiator only ever learns from the missing completion.
            trace!(
                "dropping write from node {} to node {}",
                self.local,
                self.remote
            );
            return Ok(());
        }

        let src = inner
            .segments
            .get(&write.local_key)
            .ok_or(ProviderError::UnknownKey(write.local_key))?;
        let dst = inner
            .segments
            .get(&write.remote_key)
            .ok_or(ProviderError::UnknownKey(write.remote_key))?;
        if dst.owner != self.remote {
            return Err(ProviderError::AccessViolation);
        }

        let src_off = checked_offset(write.local_addr, &src.buf, write.len)?;
        let dst_off = checked_offset(write.remote_addr, &dst.buf, write.len)?;

        let mut bytes = vec![0_u8; write.len];
        src.buf.read_at(src_off, &mut bytes);
        dst.buf.write_at(dst_off, &bytes);
        trace!(
            "delivered {}-byte write from node {} to node {}",
            write.len,
            self.local,
            self.remote
        );

        if write.signaled {
            let mut completions = self
                .completions
                .lock()
                .map_err(|_| ProviderError::Endpoint("completion lock poisoned".into()))?;
            completions.push_back(WriteCompletion { len: write.len });
            self.completion_arrived.notify_all();
        }
        Ok(())
    }

    fn poll_completion(
        &self,
        timeout: Duration,
    ) -> std::result::Result<WriteCompletion, ProviderError> {
        let deadline = std::time::Instant::now() + timeout;
        let mut completions = self
            .completions
            .lock()
            .map_err(|_| ProviderError::Endpoint("completion lock poisoned".into()))?;
        loop {
            if let Some(wc) = completions.pop_front() {
                return Ok(wc);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return Err(ProviderError::CompletionTimeout(timeout));
            }
            let (guard, _timed_out) = self
                .completion_arrived
                .wait_timeout(completions, deadline - now)
                .map_err(|_| ProviderError::Endpoint("completion lock poisoned".into()))?;
            completions = guard;
        }
    }
}

/// Translate a write address into an offset within `buf`, verifying the
/// whole range lands inside the registration.
fn checked_offset(
    addr: Vaddr,
    buf: &BufSlice,
    len: usize,
) -> std::result::Result<usize, ProviderError> {
    let base = buf.vaddr().0;
    let off = addr
        .0
        .checked_sub(base)
        .ok_or(ProviderError::AccessViolation)?;
    let off = usize::try_from(off).map_err(|_| ProviderError::AccessViolation)?;
    if off.checked_add(len).is_none_or(|end| end > buf.len()) {
        return Err(ProviderError::AccessViolation);
    }
    Ok(off)
}

/// Spin up `ids.len()` transport contexts sharing one loopback fabric,
/// each listening on an ephemeral localhost port.
///
/// Returned contexts are ordered like `ids`.
pub fn loopback_cluster(ids: &[u32]) -> (Arc<LoopbackFabric>, Vec<Arc<RdmaTransport>>) {
    /// Bind an ephemeral localhost listener.
    fn bind_ephemeral() -> (TcpListener, SocketAddr) {
        #[allow(clippy::unwrap_used)]
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        #[allow(clippy::unwrap_used)]
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    let fabric = LoopbackFabric::new();
    let provider = fabric.provider();

    let listeners: Vec<_> = ids.iter().map(|_| bind_ephemeral()).collect();
    let peers: BTreeMap<NodeId, SocketAddr> = ids
        .iter()
        .zip(&listeners)
        .map(|(&id, (_, addr))| (NodeId(id), *addr))
        .collect();

    let nodes = ids
        .iter()
        .zip(listeners)
        .map(|(&id, (listener, _))| {
            let r: Result<_> =
                RdmaTransport::with_listener(NodeId(id), peers.clone(), &provider, listener);
            #[allow(clippy::unwrap_used)]
            r.unwrap()
        })
        .collect();
    (fabric, nodes)
}
