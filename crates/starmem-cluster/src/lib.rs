//! Cluster control plane of the starmem distributed shared-memory runtime.
//!
//! A starmem cluster is a star: node 0 (the master) dials every slave's
//! control port at startup, runs the address-table handshake, and keeps
//! one blocking TCP connection per slave for the lifetime of the
//! generation. All cluster-wide synchronization state — barriers,
//! counting semaphores, auto/manual-reset events — lives on the master;
//! a thread on any node suspends by arming its local wakeup event,
//! sending (or locally applying) a sync request, and blocking until the
//! master routes a wake back to it.
//!
//! Module map:
//!
//! * [`transport`] — length-exact blocking send/receive over TCP.
//! * [`wakeup`] — per-thread wakeup events with wait generations.
//! * [`sync`] — the master-resident registry of sync primitives.
//! * [`liveness`] — failure detector and cluster-restart coordinator.
//! * [`runtime`] / [`store`] — seams to the external subsystems this
//!   crate drives but does not implement (object store, checkpointing,
//!   data-socket mesh, process respawn, user thread entries).
//! * [`bootstrap`] — [`MasterNode`] / [`SlaveNode`] entry points and the
//!   [`ClusterHandle`] sync API.

mod handshake;
mod links;
mod listener;
mod slave;
mod spawn;

pub mod bootstrap;
pub mod liveness;
pub mod runtime;
pub mod store;
pub mod sync;
pub mod transport;
pub mod wakeup;

pub use bootstrap::{ClusterHandle, MasterNode, MasterStart, SlaveNode};
pub use liveness::ClusterConfig;
pub use runtime::{
    Checkpointing, ClusterRuntime, DataPlane, NullProcessControl, NullStorageDriver,
    NullWorkerEntry, ProcessControl, ReadyDataPlane, StorageDriver, WorkerEntry,
};
pub use store::{InMemoryStore, SharedStore};
