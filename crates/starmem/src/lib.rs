//! Public API facade for the starmem distributed shared-memory runtime.
//!
//! Re-exports the cluster control plane and the shared vocabulary types.
//! A master program builds a [`ClusterRuntime`], calls
//! [`MasterNode::start`], and drives its threads through the returned
//! handle; a slave program calls [`SlaveNode::run`] and lets the master
//! create workers on it.

pub use starmem_cluster::{
    Checkpointing, ClusterConfig, ClusterHandle, ClusterRuntime, DataPlane, InMemoryStore,
    MasterNode, MasterStart, ProcessControl, SharedStore, SlaveNode, StorageDriver, WorkerEntry,
};
pub use starmem_error::{Result, StarmemError};
pub use starmem_types::topology::{BackendKind, CacheKind, ClusterMap, PeerAddr, StorageMap};
pub use starmem_types::{NodeId, ObjectKey, ThreadId};

use tracing_subscriber::EnvFilter;

/// Initialize terminal logging for a starmem binary.
///
/// Defaults to `info` and honors `RUST_LOG`. Safe to call more than
/// once; later calls are no-ops.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use starmem_types::limits::SLOT_PRIMITIVE_INIT;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_single_node_cluster_syncs_locally() {
        let store = Arc::new(InMemoryStore::new());
        let key = ObjectKey::new(1);
        store.put(key, SLOT_PRIMITIVE_INIT, 1); // barrier of one
        let runtime = ClusterRuntime::in_process(store);

        let started = MasterNode::start(
            ClusterMap::new(vec![PeerAddr::new("127.0.0.1", 0)]),
            StorageMap::default(),
            BackendKind(0),
            CacheKind(0),
            runtime,
            ClusterConfig::default(),
        )
        .expect("master start");
        let MasterStart::Running(master) = started else {
            panic!("no checkpoint was pending");
        };

        let handle = master.handle().clone();
        assert!(handle.is_master());
        handle.register_thread();
        assert!(handle
            .enter_barrier(key, Duration::from_secs(1))
            .expect("local barrier"));
        handle.deregister_thread();
        master.shutdown().expect("shutdown");
    }
}
