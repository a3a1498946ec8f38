//! The seam between this crate and a physical one-sided transport.
//!
//! The verbs and libfabric providers live outside this workspace; the
//! core consumes them through the traits here.  A provider is an
//! explicit object passed into [`RdmaTransport::new`](crate::RdmaTransport::new)
//! rather than ambient global state, so tests can substitute the
//! loopback fabric from [`testing`](crate::testing) and a process can
//! host several independent contexts.

use std::time::Duration;

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::buf::BufSlice;
use crate::NodeId;

/// Which one-sided transport flavor a deployment uses.
///
/// The core treats both identically; the selection is recorded in the
/// configuration and consumed by whatever outer layer instantiates the
/// real provider.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum TransportSelection {
    /// InfiniBand verbs.
    Verbs,
    /// Libfabric.
    Lf,
}

/// A provider-assigned memory registration key.
///
/// Keys are chosen by the provider at registration time (we do not
/// support caller-chosen keys; a provider may add that as an extension
/// without changing this seam).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Display, From, Into)]
pub struct MrKey(pub u64);

/// A virtual address as carried on the wire and in work requests.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Display, From, Into)]
#[display("{_0:#x}")]
pub struct Vaddr(pub u64);

impl Vaddr {
    /// Return this address displaced by `offset` bytes.
    pub fn offset(self, offset: usize) -> Vaddr {
        Vaddr(self.0.wrapping_add(offset as u64))
    }
}

/// Access permissions requested when registering memory.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
#[non_exhaustive]
pub struct MrAccess {
    /// Allow remote peers to read the region.
    pub remote_read: bool,
    /// Allow remote peers to write the region.
    pub remote_write: bool,
}

impl MrAccess {
    /// Local read/write plus remote read/write: what the shared state
    /// table registers everything with.
    pub const fn remote_read_write() -> Self {
        MrAccess {
            remote_read: true,
            remote_write: true,
        }
    }
}

/// A single one-sided write work request.
#[derive(Debug, Copy, Clone)]
pub struct RemoteWrite {
    /// Key of the local registration the source bytes live in.
    pub local_key: MrKey,
    /// Address of the first source byte.
    pub local_addr: Vaddr,
    /// Number of bytes to transfer.
    pub len: usize,
    /// The peer's registration key, learned during the descriptor
    /// exchange.
    pub remote_key: MrKey,
    /// Address of the first destination byte in the peer's region.
    pub remote_addr: Vaddr,
    /// Whether to generate a completion entry for this write.
    pub signaled: bool,
}

/// A completion entry for a signaled write.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct WriteCompletion {
    /// Number of bytes the completed write covered.
    pub len: usize,
}

/// An error reported by a transport provider.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum ProviderError {
    /// Resource temporarily unavailable.
    ///
    /// Registration retries this indefinitely with backoff; it never
    /// escapes to callers of the core.
    #[error("resource temporarily unavailable")]
    TemporarilyUnavailable,

    /// The provider rejected a registration outright.
    #[error("memory registration rejected: {0}")]
    RegistrationFailed(String),

    /// The provider could not report a local key for a registration.
    #[error("local key unavailable: {0}")]
    KeyUnavailable(String),

    /// The endpoint failed or could not be created.
    #[error("endpoint failure: {0}")]
    Endpoint(String),

    /// A work request addressed memory outside a registered region.
    #[error("remote access out of registered bounds")]
    AccessViolation,

    /// No remote registration matches the supplied key.
    #[error("unknown remote key {0}")]
    UnknownKey(MrKey),

    /// No completion arrived within the allowed interval.
    #[error("no completion within {0:?}")]
    CompletionTimeout(Duration),
}

impl ProviderError {
    /// Return true if this error is worth retrying after a delay.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::TemporarilyUnavailable)
    }
}

/// A factory for per-process transport state.
pub trait RdmaProvider: Send + Sync + 'static {
    /// Short name of this provider ("verbs", "lf", "loopback").
    fn name(&self) -> &'static str;

    /// Open the protection domain for the local node.
    ///
    /// Called once per [`RdmaTransport`](crate::RdmaTransport).
    fn open_domain(&self, local: NodeId) -> Result<Box<dyn RdmaDomain>, ProviderError>;
}

/// Process-wide provider state: registration and endpoint creation.
pub trait RdmaDomain: Send + Sync + 'static {
    /// Register `buf` with the transport.
    ///
    /// The registration stays valid until the returned handle is
    /// dropped.
    fn register(
        &self,
        buf: BufSlice,
        access: MrAccess,
    ) -> Result<Box<dyn RegisteredMr>, ProviderError>;

    /// Create an endpoint connected to `remote`.
    fn connect(&self, remote: NodeId) -> Result<Box<dyn RdmaEndpoint>, ProviderError>;
}

/// A live memory registration.
///
/// Dropping the handle deregisters the memory.
pub trait RegisteredMr: Send + Sync {
    /// Query the provider-assigned local key.
    fn lkey(&self) -> Result<MrKey, ProviderError>;

    /// Return the virtual address of the start of the registered range.
    fn base(&self) -> Vaddr;

    /// Return the length of the registered range in bytes.
    fn len(&self) -> usize;
}

/// A connected endpoint able to issue one-sided writes.
///
/// Writes from one endpoint to one peer are delivered in issue order;
/// no ordering holds across distinct origins.
pub trait RdmaEndpoint: Send + Sync {
    /// Post a one-sided write work request.
    ///
    /// Returns as soon as the transport accepts the request; a
    /// `signaled` request additionally produces a completion entry
    /// observable through [`poll_completion`](Self::poll_completion).
    fn post_write(&self, write: &RemoteWrite) -> Result<(), ProviderError>;

    /// Block up to `timeout` for the next completion entry.
    fn poll_completion(&self, timeout: Duration) -> Result<WriteCompletion, ProviderError>;
}
