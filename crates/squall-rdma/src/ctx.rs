//! The process-wide transport context.

use std::collections::BTreeMap;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::result::Result as StdResult;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::{debug, warn};
use void::{ResultVoidErrExt, Void};

use crate::mgr::{read_hello, ConnMgr};
use crate::provider::{RdmaDomain, RdmaProvider};
use crate::{Error, NodeId, Result};

/// How long a freshly accepted stream may dawdle before sending its
/// hello.  Bounds the damage a stray connection can do to the acceptor.
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

/// Process-wide transport state: the provider domain, the peer address
/// map, the side-channel listener, and the connection registry.
///
/// Constructed once, before any memory region, and shared by `Arc`.
/// Deliberately an explicit object rather than a global, so tests can
/// run several contexts (whole fake clusters) in one process.
pub struct RdmaTransport {
    /// Our own id.
    local: NodeId,
    /// The full peer address map, sorted by id.
    peers: BTreeMap<NodeId, SocketAddr>,
    /// The provider's protection domain.
    domain: Arc<dyn RdmaDomain>,
    /// The connection registry.
    mgr: Arc<ConnMgr>,
    /// Address the side-channel listener is bound to.
    listener_addr: SocketAddr,
    /// Tells the acceptor thread to exit.
    shutdown: Arc<AtomicBool>,
    /// The acceptor thread, joined at shutdown.
    acceptor: std::sync::Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl RdmaTransport {
    /// Create a context, binding the side-channel listener at this
    /// node's address from `peers`.
    pub fn new(
        local: NodeId,
        peers: BTreeMap<NodeId, SocketAddr>,
        provider: &dyn RdmaProvider,
    ) -> Result<Arc<Self>> {
        let addr = *peers
            .get(&local)
            .ok_or(Error::UnknownPeer { peer: local })?;
        let listener = TcpListener::bind(addr).map_err(|e| Error::io("side-channel bind", e))?;
        Self::with_listener(local, peers, provider, listener)
    }

    /// Create a context around a listener the caller has already bound.
    ///
    /// Useful when the caller wants an ephemeral port: bind to port 0,
    /// read back the real address, and record it in the address map it
    /// hands to the other nodes.
    pub fn with_listener(
        local: NodeId,
        peers: BTreeMap<NodeId, SocketAddr>,
        provider: &dyn RdmaProvider,
        listener: TcpListener,
    ) -> Result<Arc<Self>> {
        let listener_addr = listener
            .local_addr()
            .map_err(|e| Error::io("side-channel bind", e))?;
        let domain: Arc<dyn RdmaDomain> = provider
            .open_domain(local)
            .map_err(|e| Error::provider("open domain", e))?
            .into();
        let mgr = Arc::new(ConnMgr::new(local, peers.clone(), Arc::clone(&domain)));
        let shutdown = Arc::new(AtomicBool::new(false));

        let acceptor = {
            let mgr = Arc::downgrade(&mgr);
            let shutdown = Arc::clone(&shutdown);
            std::thread::Builder::new()
                .name(format!("squall-accept-{}", local))
                .spawn(move || accept_side_channels(&listener, &mgr, &shutdown))
                .map_err(|e| Error::io("spawn acceptor", e))?
        };

        debug!(
            "transport context up for node {} ({} provider, side channel on {})",
            local,
            provider.name(),
            listener_addr
        );
        Ok(Arc::new(RdmaTransport {
            local,
            peers,
            domain,
            mgr,
            listener_addr,
            shutdown,
            acceptor: std::sync::Mutex::new(Some(acceptor)),
        }))
    }

    /// Return this node's id.
    pub fn local_id(&self) -> NodeId {
        self.local
    }

    /// Return the address the side-channel listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.listener_addr
    }

    /// Return the peer address map, sorted by id.
    pub fn peers(&self) -> &BTreeMap<NodeId, SocketAddr> {
        &self.peers
    }

    /// Return the connection registry.
    pub fn connections(&self) -> &ConnMgr {
        &self.mgr
    }

    /// Return the provider domain.
    pub fn domain(&self) -> &Arc<dyn RdmaDomain> {
        &self.domain
    }

    /// Tear the context down: stop accepting side channels, flag every
    /// connection broken, and drop the registry's strong references.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        // Wake the acceptor out of its blocking accept.
        let _ = TcpStream::connect(self.listener_addr);
        self.mgr.shutdown();
        if let Ok(mut guard) = self.acceptor.lock() {
            if let Some(handle) = guard.take() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for RdmaTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for RdmaTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RdmaTransport")
            .field("local", &self.local)
            .field("peers", &self.peers.len())
            .field("listener", &self.listener_addr)
            .finish()
    }
}

/// Acceptor loop: identify inbound side channels and route them to the
/// registry.
fn accept_side_channels(
    listener: &TcpListener,
    mgr: &Weak<ConnMgr>,
    shutdown: &AtomicBool,
) {
    let termination_reason: StdResult<Void, &str> = loop {
        let (mut stream, from) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) => {
                if shutdown.load(Ordering::Acquire) {
                    break Err("shutdown");
                }
                warn!("side-channel accept failed: {}", e);
                continue;
            }
        };
        if shutdown.load(Ordering::Acquire) {
            break Err("shutdown");
        }
        let _ = stream.set_read_timeout(Some(HELLO_TIMEOUT));
        let peer = match read_hello(&mut stream) {
            Ok(peer) => peer,
            Err(e) => {
                debug!("dropping unidentified side channel from {}: {}", from, e);
                continue;
            }
        };
        let _ = stream.set_read_timeout(None);
        let Some(mgr) = mgr.upgrade() else {
            break Err("connection manager gone away");
        };
        debug!("accepted side channel from node {} ({})", peer, from);
        mgr.submit_inbound(peer, stream);
    };
    debug!(
        "side-channel acceptor exiting: {}",
        termination_reason.void_unwrap_err()
    );
}
