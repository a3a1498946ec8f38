//! Declare error types for squall-rdma.

use std::sync::Arc;

use thiserror::Error;

use crate::provider::ProviderError;
use crate::NodeId;

/// An error returned by the transport layer.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The manager no longer holds a connection to this peer.
    ///
    /// Returned when upgrading a weak connection handle fails, or when
    /// an operation is attempted after the manager dropped its strong
    /// reference.
    #[error("Connection to node {peer} is no longer held by the manager")]
    ConnectionRemoved {
        /// Who we were talking to.
        peer: NodeId,
    },

    /// The connection exists but has been flagged unusable.
    #[error("Connection to node {peer} is flagged broken")]
    ConnectionBroken {
        /// Who we were talking to.
        peer: NodeId,
    },

    /// We have no address for this peer, so no connection can be built.
    #[error("No address is known for node {peer}")]
    UnknownPeer {
        /// The peer we could not locate.
        peer: NodeId,
    },

    /// Network IO error on the TCP side channel.
    #[error("Network IO error in {action}")]
    Io {
        /// What we were doing.
        action: &'static str,
        /// What happened.
        #[source]
        source: Arc<std::io::Error>,
    },

    /// The transport provider reported an error.
    #[error("Transport provider error in {action}")]
    Provider {
        /// What we were doing.
        action: &'static str,
        /// The underlying provider error.
        #[source]
        source: ProviderError,
    },

    /// A remote write was requested outside the registered region.
    ///
    /// This is a caller bug: `offset + len` must never exceed the
    /// region size.
    #[error("Remote write out of range: offset {offset} + len {len} > region size {size}")]
    WriteOutOfRange {
        /// Requested start offset.
        offset: usize,
        /// Requested write length.
        len: usize,
        /// Size of the registered region.
        size: usize,
    },

    /// An internal error of some kind that should never occur.
    #[error("Internal error: {0}")]
    Internal(&'static str),
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Error {
        Error::Internal("thread failed while holding lock")
    }
}

impl Error {
    /// Construct a new `Error` from an IO error on the side channel.
    pub(crate) fn io(action: &'static str, source: std::io::Error) -> Error {
        Error::Io {
            action,
            source: Arc::new(source),
        }
    }

    /// Construct a new `Error` from a provider error.
    pub(crate) fn provider(action: &'static str, source: ProviderError) -> Error {
        Error::Provider { action, source }
    }
}
