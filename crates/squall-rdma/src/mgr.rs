//! A registry that remembers one live connection per peer and builds
//! new ones on request.
//!
//! The manager holds the sole strong reference to each [`Connection`];
//! everything else (memory regions, callers) holds weak handles and
//! upgrades on use.  When the manager drops its strong reference, every
//! outstanding weak handle starts failing with
//! [`Error::ConnectionRemoved`], which is how "the connection
//! disappeared under me" is surfaced without ownership cycles.

use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

use tracing::{debug, warn};

use crate::provider::{RdmaDomain, RdmaEndpoint};
use crate::{Error, NodeId, Result};

/// A live connection to one peer: a transport endpoint plus the TCP
/// side channel used for descriptor exchange and sync rendezvous.
pub struct Connection {
    /// The peer this connection reaches.
    peer: NodeId,
    /// The provider endpoint for one-sided writes.
    endpoint: Box<dyn RdmaEndpoint>,
    /// The TCP side channel.  Locked for the whole of each symmetric
    /// exchange so interleaved exchanges cannot mix their bytes.
    channel: Mutex<TcpStream>,
    /// Set when the connection is known unusable.
    broken: AtomicBool,
}

impl Connection {
    /// Wrap an endpoint and side-channel stream for `peer`.
    fn new(peer: NodeId, endpoint: Box<dyn RdmaEndpoint>, channel: TcpStream) -> Self {
        Connection {
            peer,
            endpoint,
            channel: Mutex::new(channel),
            broken: AtomicBool::new(false),
        }
    }

    /// Return the peer this connection reaches.
    pub fn peer(&self) -> NodeId {
        self.peer
    }

    /// Return true if this connection has been flagged unusable.
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    /// Flag this connection unusable.
    ///
    /// Weak handles can still upgrade and observe the flag until the
    /// manager drops its strong reference.
    pub(crate) fn mark_broken(&self) {
        if !self.broken.swap(true, Ordering::AcqRel) {
            debug!("connection to node {} flagged broken", self.peer);
        }
    }

    /// Fail with [`Error::ConnectionBroken`] if the connection is
    /// flagged, otherwise succeed.
    pub fn check_usable(&self) -> Result<()> {
        if self.is_broken() {
            Err(Error::ConnectionBroken { peer: self.peer })
        } else {
            Ok(())
        }
    }

    /// Return the transport endpoint.
    pub(crate) fn endpoint(&self) -> &dyn RdmaEndpoint {
        &*self.endpoint
    }

    /// Run `f` with exclusive use of the side channel.
    ///
    /// IO failures mark the connection broken before being returned:
    /// once bytes may have been lost the exchange protocol is out of
    /// step and the stream cannot be trusted again.
    pub(crate) fn with_channel<T>(
        &self,
        action: &'static str,
        f: impl FnOnce(&mut TcpStream) -> std::io::Result<T>,
    ) -> Result<T> {
        let mut stream = self.channel.lock()?;
        match f(&mut stream) {
            Ok(v) => Ok(v),
            Err(e) => {
                self.mark_broken();
                Err(Error::io(action, e))
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("broken", &self.is_broken())
            .finish()
    }
}

/// How the side channel to a peer is established.
///
/// The lower id dials the higher id's listener and announces itself
/// with a 4-byte big-endian hello; the higher id's acceptor routes the
/// identified stream to the entry waiting for it.  The fixed direction
/// means two peers building the same connection concurrently cannot
/// cross wires.
fn establish_side_channel(
    mgr: &ConnMgr,
    local: NodeId,
    remote: NodeId,
    addr: SocketAddr,
) -> Result<TcpStream> {
    if local < remote {
        let mut stream =
            TcpStream::connect(addr).map_err(|e| Error::io("side-channel connect", e))?;
        stream
            .write_all(&local.0.to_be_bytes())
            .map_err(|e| Error::io("side-channel hello", e))?;
        Ok(stream)
    } else {
        // The remote dials us; wait for the acceptor to route it here.
        let mut inner = mgr.inner.lock()?;
        loop {
            if inner.shutdown {
                return Err(Error::ConnectionRemoved { peer: remote });
            }
            if let Some(stream) = inner.inbound.remove(&remote) {
                return Ok(stream);
            }
            inner = mgr.cond.wait(inner)?;
        }
    }
}

/// State of one registry entry.
enum ConnState {
    /// A built connection; this is the sole strong reference.
    Open(Arc<Connection>),
    /// Some thread is building the connection; others wait on the
    /// manager's condvar.
    Building,
}

/// Registry state, inside the lock.
struct Inner {
    /// One entry per peer we have built (or are building) a connection
    /// to.
    conns: HashMap<NodeId, ConnState>,
    /// Identified inbound side-channel streams not yet claimed by a
    /// `Building` entry.
    inbound: HashMap<NodeId, TcpStream>,
    /// Set once, at shutdown; `get` fails afterwards.
    shutdown: bool,
}

/// The process-wide connection registry.
pub struct ConnMgr {
    /// Our own id.
    local: NodeId,
    /// The full peer address map, sorted by id.
    peers: BTreeMap<NodeId, SocketAddr>,
    /// The provider domain used to create endpoints.
    domain: Arc<dyn RdmaDomain>,
    /// Registry state.
    inner: Mutex<Inner>,
    /// Notified when a build finishes or an inbound stream arrives.
    cond: Condvar,
}

impl ConnMgr {
    /// Create an empty registry.
    pub(crate) fn new(
        local: NodeId,
        peers: BTreeMap<NodeId, SocketAddr>,
        domain: Arc<dyn RdmaDomain>,
    ) -> Self {
        ConnMgr {
            local,
            peers,
            domain,
            inner: Mutex::new(Inner {
                conns: HashMap::new(),
                inbound: HashMap::new(),
                shutdown: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Return a weak handle on the connection to `remote`, building one
    /// if none exists and the peer's address is known.
    ///
    /// An unknown peer yields a handle whose upgrade fails (rather than
    /// an error): the caller learns the same thing either way, and a
    /// racing membership change looks identical.
    pub fn get(&self, remote: NodeId) -> Result<Weak<Connection>> {
        if remote == self.local {
            return Err(Error::Internal("attempted connection to self"));
        }
        let Some(addr) = self.peers.get(&remote).copied() else {
            return Ok(Weak::new());
        };

        {
            let mut inner = self.inner.lock()?;
            loop {
                if inner.shutdown {
                    return Err(Error::ConnectionRemoved { peer: remote });
                }
                match inner.conns.get(&remote) {
                    Some(ConnState::Open(c)) => return Ok(Arc::downgrade(c)),
                    Some(ConnState::Building) => {
                        inner = self.cond.wait(inner)?;
                    }
                    None => {
                        inner.conns.insert(remote, ConnState::Building);
                        break;
                    }
                }
            }
        }

        // We hold the Building slot; construct outside the lock.
        let built = self.build(remote, addr);
        let mut inner = self.inner.lock()?;
        match built {
            Ok(conn) => {
                let weak = Arc::downgrade(&conn);
                inner.conns.insert(remote, ConnState::Open(conn));
                self.cond.notify_all();
                Ok(weak)
            }
            Err(e) => {
                inner.conns.remove(&remote);
                self.cond.notify_all();
                Err(e)
            }
        }
    }

    /// Build the connection to `remote` at `addr`.
    fn build(&self, remote: NodeId, addr: SocketAddr) -> Result<Arc<Connection>> {
        let stream = establish_side_channel(self, self.local, remote, addr)?;
        let _ = stream.set_nodelay(true);
        let endpoint = self
            .domain
            .connect(remote)
            .map_err(|e| Error::provider("endpoint connect", e))?;
        debug!("built connection from node {} to node {}", self.local, remote);
        Ok(Arc::new(Connection::new(remote, endpoint, stream)))
    }

    /// Flag the connection to `remote` broken, if one exists.
    ///
    /// The strong reference is retained so that holders of weak handles
    /// can still observe the flag; call [`remove`](Self::remove) to
    /// make upgrades fail instead.
    pub fn mark_broken(&self, remote: NodeId) {
        let Ok(inner) = self.inner.lock() else {
            return;
        };
        if let Some(ConnState::Open(c)) = inner.conns.get(&remote) {
            c.mark_broken();
        }
    }

    /// Drop the strong reference to `remote`'s connection.
    ///
    /// Subsequent upgrades of weak handles fail with
    /// [`Error::ConnectionRemoved`].
    pub fn remove(&self, remote: NodeId) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.conns.remove(&remote).is_some() {
            debug!("removed connection to node {}", remote);
        }
        self.cond.notify_all();
    }

    /// Flag every connection broken, then drop all strong references.
    pub fn shutdown(&self) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        for state in inner.conns.values() {
            if let ConnState::Open(c) = state {
                c.mark_broken();
            }
        }
        inner.conns.clear();
        inner.inbound.clear();
        inner.shutdown = true;
        self.cond.notify_all();
    }

    /// Route an identified inbound side-channel stream to whatever
    /// entry is (or will be) waiting for it.
    ///
    /// Called by the context's acceptor thread after it has read the
    /// hello.
    pub(crate) fn submit_inbound(&self, peer: NodeId, stream: TcpStream) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.shutdown {
            return;
        }
        if inner.inbound.insert(peer, stream).is_some() {
            warn!("replaced unclaimed inbound side channel from node {}", peer);
        }
        self.cond.notify_all();
    }
}

/// Read the 4-byte big-endian hello from a freshly accepted stream.
pub(crate) fn read_hello(stream: &mut TcpStream) -> std::io::Result<NodeId> {
    let mut id = [0_u8; 4];
    stream.read_exact(&mut id)?;
    Ok(NodeId(u32::from_be_bytes(id)))
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::missing_docs_in_private_items)]
    use super::*;
    use crate::testing::loopback_cluster;

    #[test]
    fn unknown_peer_yields_dead_weak_handle() {
        let (_fabric, nodes) = loopback_cluster(&[1]);
        let weak = nodes[0].connections().get(NodeId(9)).unwrap();
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn connection_to_self_is_rejected() {
        let (_fabric, nodes) = loopback_cluster(&[1]);
        assert!(matches!(
            nodes[0].connections().get(NodeId(1)),
            Err(Error::Internal(_))
        ));
    }

    #[test]
    fn get_after_shutdown_fails_as_removed() {
        let (_fabric, nodes) = loopback_cluster(&[1, 2]);
        nodes[0].shutdown();
        assert!(matches!(
            nodes[0].connections().get(NodeId(2)),
            Err(Error::ConnectionRemoved { peer: NodeId(2) })
        ));
    }

    #[test]
    fn concurrent_gets_share_one_connection() {
        let (_fabric, nodes) = loopback_cluster(&[1, 2]);
        let a = std::sync::Arc::clone(&nodes[0]);
        let b = std::sync::Arc::clone(&nodes[0]);
        let ta = std::thread::spawn(move || a.connections().get(NodeId(2)).unwrap());
        let tb = std::thread::spawn(move || b.connections().get(NodeId(2)).unwrap());
        // The peer side must ask for the connection too, or neither
        // get() can finish the side-channel handshake.
        let peer = nodes[1].connections().get(NodeId(1)).unwrap();
        let wa = ta.join().unwrap();
        let wb = tb.join().unwrap();
        let ca = wa.upgrade().unwrap();
        let cb = wb.upgrade().unwrap();
        assert!(std::sync::Arc::ptr_eq(&ca, &cb));
        assert!(peer.upgrade().is_some());
    }
}
