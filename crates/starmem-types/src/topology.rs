//! Cluster and storage address tables.
//!
//! The master owns the authoritative tables and distributes them to every
//! slave during the handshake; slaves reconstruct the master's own entry
//! from the connection's peer address.

use std::fmt;

use crate::NodeId;

/// A `(host, port)` control endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    /// Create a peer address.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// The control-endpoint table of one cluster generation.
///
/// Indexed by node id; entry 0 is the master.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ClusterMap {
    peers: Vec<PeerAddr>,
}

impl ClusterMap {
    /// Build a table from peer addresses in node-id order.
    #[must_use]
    pub fn new(peers: Vec<PeerAddr>) -> Self {
        Self { peers }
    }

    /// Number of nodes, master included.
    #[must_use]
    pub fn num_nodes(&self) -> usize {
        self.peers.len()
    }

    /// The endpoint of `node`, if it exists in this generation.
    #[must_use]
    pub fn get(&self, node: NodeId) -> Option<&PeerAddr> {
        self.peers.get(node.as_usize())
    }

    /// All endpoints in node-id order.
    #[must_use]
    pub fn peers(&self) -> &[PeerAddr] {
        &self.peers
    }

    /// Every node id except the master's.
    pub fn slave_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (1..self.peers.len()).map(|i| NodeId::new(u32::try_from(i).expect("node count fits u32")))
    }
}

/// Endpoints of the storage backends, forwarded verbatim to slaves.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StorageMap {
    servers: Vec<PeerAddr>,
}

impl StorageMap {
    /// Build a table of storage endpoints.
    #[must_use]
    pub fn new(servers: Vec<PeerAddr>) -> Self {
        Self { servers }
    }

    /// All storage endpoints.
    #[must_use]
    pub fn servers(&self) -> &[PeerAddr] {
        &self.servers
    }
}

/// Opaque storage-backend selector carried in the handshake.
///
/// The control plane forwards the value to the storage driver and does
/// not interpret it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct BackendKind(pub u32);

/// Opaque cache-layer selector carried in the handshake.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct CacheKind(pub u32);
