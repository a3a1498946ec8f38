//! Configuration for a shared state table.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use squall_rdma::{NodeId, TransportSelection};

/// Configuration for one table instance.
///
/// This type is immutable once constructed.  To build one, use
/// [`SstConfigBuilder`], or deserialize the builder from a config file.
#[derive(Debug, Clone, Builder, Eq, PartialEq)]
#[builder(derive(Debug, Serialize, Deserialize))]
pub struct SstConfig {
    /// This peer's identifier.
    pub(crate) local_id: NodeId,

    /// The peer address table, including this peer.
    ///
    /// Iteration order is ascending by id, which is also how row ranks
    /// are assigned.
    pub(crate) peers: BTreeMap<NodeId, SocketAddr>,

    /// Which one-sided transport flavor the deployment uses.
    ///
    /// Recorded for the layer that instantiates the provider; the
    /// table itself treats all providers identically.
    #[builder(default = "TransportSelection::Verbs")]
    pub(crate) transport: TransportSelection,

    /// How often the predicate scanner thread wakes up.
    #[builder(default = "default_predicate_poll_interval()")]
    #[builder_field_attr(serde(default, with = "humantime_serde::option"))]
    pub(crate) predicate_poll_interval: Duration,

    /// How often the heartbeat field is written to every peer.
    #[builder(default = "default_heartbeat_interval()")]
    #[builder_field_attr(serde(default, with = "humantime_serde::option"))]
    pub(crate) heartbeat_interval: Duration,

    /// How long a peer's heartbeat may stay unchanged before the peer
    /// is classified as failed.
    #[builder(default = "default_liveness_window()")]
    #[builder_field_attr(serde(default, with = "humantime_serde::option"))]
    pub(crate) liveness_window: Duration,
}

/// Return the default predicate poll interval.
fn default_predicate_poll_interval() -> Duration {
    Duration::from_millis(1)
}

/// Return the default heartbeat interval.
fn default_heartbeat_interval() -> Duration {
    Duration::from_millis(100)
}

/// Return the default liveness window.
fn default_liveness_window() -> Duration {
    Duration::from_secs(1)
}

impl SstConfig {
    /// Return this peer's identifier.
    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Return the peer address table.
    pub fn peers(&self) -> &BTreeMap<NodeId, SocketAddr> {
        &self.peers
    }

    /// Return the configured transport flavor.
    pub fn transport(&self) -> TransportSelection {
        self.transport
    }

    /// Return the predicate scanner's poll interval.
    pub fn predicate_poll_interval(&self) -> Duration {
        self.predicate_poll_interval
    }

    /// Return the heartbeat write interval.
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Return the liveness window.
    pub fn liveness_window(&self) -> Duration {
        self.liveness_window
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::missing_docs_in_private_items)]
    use super::*;

    fn two_peers() -> BTreeMap<NodeId, SocketAddr> {
        [
            (NodeId(1), "10.0.0.1:7600".parse().unwrap()),
            (NodeId(2), "10.0.0.2:7600".parse().unwrap()),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn defaults() {
        let config = SstConfigBuilder::default()
            .local_id(NodeId(1))
            .peers(two_peers())
            .build()
            .unwrap();

        assert_eq!(config.transport(), TransportSelection::Verbs);
        assert_eq!(config.predicate_poll_interval(), Duration::from_millis(1));
        assert_eq!(config.heartbeat_interval(), Duration::from_millis(100));
        assert_eq!(config.liveness_window(), Duration::from_secs(1));
    }

    #[test]
    fn local_id_is_required() {
        let r = SstConfigBuilder::default().peers(two_peers()).build();
        assert!(r.is_err());
    }

    #[test]
    fn peer_table_iterates_in_id_order() {
        let config = SstConfigBuilder::default()
            .local_id(NodeId(2))
            .peers(two_peers())
            .build()
            .unwrap();
        let ids: Vec<_> = config.peers().keys().copied().collect();
        assert_eq!(ids, vec![NodeId(1), NodeId(2)]);
    }
}
