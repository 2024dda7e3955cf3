//! Seams to the external subsystems the control plane drives.
//!
//! The object store, the data-socket mesh, checkpoint persistence, the
//! process-respawn mechanism, and the user thread entries are all
//! collaborators, not residents of this crate. Each is a trait here;
//! [`ClusterRuntime`] bundles one implementation of each for the
//! bootstrap entry points. Null implementations are provided for
//! embeddings (and tests) that do not need a given subsystem.

use std::sync::Arc;

use starmem_error::Result;
use starmem_types::topology::{BackendKind, CacheKind, ClusterMap, PeerAddr, StorageMap};
use starmem_types::{NodeId, ObjectKey};
use tracing::warn;

use crate::bootstrap::ClusterHandle;
use crate::store::SharedStore;

/// Storage-subsystem lifecycle. The store contents are reached through
/// [`SharedStore`]; this trait only brings the subsystem up and down.
pub trait StorageDriver: Send + Sync {
    /// Initialize storage for `node` with the generation's tables.
    fn init(
        &self,
        backend: BackendKind,
        cache: CacheKind,
        cluster: &ClusterMap,
        storage: &StorageMap,
        node: NodeId,
    ) -> Result<()>;

    /// Tear storage down at node shutdown.
    fn close(&self);
}

/// Checkpoint persistence.
///
/// Its *presence* in [`ClusterRuntime`] is what enables checkpointing:
/// with it absent, the failure detector is never started and control
/// socket failures on the master do not trigger a cluster restart.
pub trait Checkpointing: Send + Sync {
    /// The checkpoint this process should restart from, negative when
    /// none is pending.
    fn pending_checkpoint(&self) -> i32;

    /// Bring up checkpoint persistence on this node.
    fn init(&self) -> Result<()>;

    /// Drop the current checkpoint at graceful shutdown.
    fn delete(&self) -> Result<()>;

    /// Re-enter the program from `checkpoint`.
    fn restore(&self, checkpoint: i32) -> Result<()>;
}

/// The data-socket mesh used for object reads and writes. Initialized
/// and awaited by the control plane, designed elsewhere.
pub trait DataPlane: Send + Sync {
    /// Bring up this node's data connections.
    fn init(&self, cluster: &ClusterMap, node: NodeId) -> Result<()>;

    /// Block until the mesh is usable; error on readiness timeout.
    fn wait_ready(&self) -> Result<()>;

    /// Close all data sockets.
    fn close(&self);
}

/// Relaunches the current binary for a new cluster generation.
pub trait ProcessControl: Send + Sync {
    /// Respawn this process, telling the new generation not to contact
    /// `excludes`.
    fn restart(&self, excludes: &[PeerAddr]);
}

/// User-visible thread entry points, hosted on detached worker threads
/// spawned by the slave loop.
pub trait WorkerEntry: Send + Sync {
    /// Entry without inline payload.
    fn run(&self, cluster: &ClusterHandle, index: u32, param: u32, key: ObjectKey);

    /// Entry with an inline payload; the buffer is owned by the worker.
    fn run_with_payload(
        &self,
        cluster: &ClusterHandle,
        index: u32,
        param: u32,
        key: ObjectKey,
        payload: Vec<u8>,
    );

    /// Tear down whatever hosts the workers.
    fn shutdown(&self) {}
}

/// One implementation of every collaborator, handed to the bootstrap
/// entry points.
#[derive(Clone)]
pub struct ClusterRuntime {
    pub store: Arc<dyn SharedStore>,
    pub storage: Arc<dyn StorageDriver>,
    /// `Some` enables checkpointing, the failure detector, and
    /// restart-on-transport-error.
    pub checkpoint: Option<Arc<dyn Checkpointing>>,
    pub data: Arc<dyn DataPlane>,
    pub process: Arc<dyn ProcessControl>,
    pub entry: Arc<dyn WorkerEntry>,
    /// Optional slave-side hook run with the local node id before the
    /// slave enters its control loop.
    pub slave_init: Option<Arc<dyn Fn(NodeId) + Send + Sync>>,
}

impl ClusterRuntime {
    /// A runtime with the given store and null implementations of every
    /// other collaborator. Useful for in-process embeddings and tests.
    #[must_use]
    pub fn in_process(store: Arc<dyn SharedStore>) -> Self {
        Self {
            store,
            storage: Arc::new(NullStorageDriver),
            checkpoint: None,
            data: Arc::new(ReadyDataPlane),
            process: Arc::new(NullProcessControl),
            entry: Arc::new(NullWorkerEntry),
            slave_init: None,
        }
    }
}

/// Storage driver with no external storage to manage.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullStorageDriver;

impl StorageDriver for NullStorageDriver {
    fn init(
        &self,
        _backend: BackendKind,
        _cache: CacheKind,
        _cluster: &ClusterMap,
        _storage: &StorageMap,
        _node: NodeId,
    ) -> Result<()> {
        Ok(())
    }

    fn close(&self) {}
}

/// Data plane that is ready the moment it is initialized.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadyDataPlane;

impl DataPlane for ReadyDataPlane {
    fn init(&self, _cluster: &ClusterMap, _node: NodeId) -> Result<()> {
        Ok(())
    }

    fn wait_ready(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) {}
}

/// Process control that can only log: embeddings without a respawn
/// mechanism lose the node instead of restarting it.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullProcessControl;

impl ProcessControl for NullProcessControl {
    fn restart(&self, excludes: &[PeerAddr]) {
        warn!(
            excluded = excludes.len(),
            "process restart requested but no restart mechanism is installed"
        );
    }
}

/// Worker entry that drops every request on the floor, loudly.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullWorkerEntry;

impl WorkerEntry for NullWorkerEntry {
    fn run(&self, _cluster: &ClusterHandle, index: u32, param: u32, key: ObjectKey) {
        warn!(index, param, %key, "remote thread requested but no worker entry is installed");
    }

    fn run_with_payload(
        &self,
        _cluster: &ClusterHandle,
        index: u32,
        param: u32,
        key: ObjectKey,
        payload: Vec<u8>,
    ) {
        warn!(
            index,
            param,
            %key,
            payload_len = payload.len(),
            "remote thread requested but no worker entry is installed"
        );
    }
}
