//! Cluster entry points and the per-thread sync API.
//!
//! [`MasterNode::start`] dials every slave, runs the handshake, brings
//! up the control receivers, the sync registry, and (when checkpointing
//! is enabled) the failure detector. [`SlaveNode::run`] accepts one
//! control connection and serves it until the master closes the
//! cluster. Both sides hand application code a [`ClusterHandle`], the
//! only object user threads ever touch.
//!
//! Every suspending call follows the same protocol: arm the calling
//! thread's wakeup event (opening a fresh wait generation), make the
//! request visible to the master — locally on the master, as a packet
//! from a slave — then block on the event with the caller's timeout.
//! `Ok(false)` means the timeout expired; the master-side wait entry is
//! not withdrawn, but its eventual wake dies against the generation
//! check instead of firing a later wait.

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use starmem_error::{Result, StarmemError};
use starmem_types::command::{Command, CommandPacket};
use starmem_types::topology::{BackendKind, CacheKind, ClusterMap, StorageMap};
use starmem_types::{NodeId, ObjectKey, ThreadId};
use tracing::{info, warn};

use crate::links::{LinkWakeSink, PeerLinks};
use crate::liveness::{ClusterConfig, LivenessTable, RestartCoordinator};
use crate::runtime::ClusterRuntime;
use crate::sync::SyncManager;
use crate::transport::send_packet;
use crate::wakeup::WakeupRegistry;
use crate::{handshake, listener, liveness, slave, spawn, transport};

/// Master-wide state shared by the control receivers, the failure
/// detector, and the handle.
pub(crate) struct MasterShared {
    pub(crate) config: ClusterConfig,
    pub(crate) cluster: ClusterMap,
    pub(crate) links: Arc<PeerLinks>,
    pub(crate) registry: Arc<WakeupRegistry>,
    pub(crate) sync: SyncManager,
    pub(crate) liveness: LivenessTable,
    pub(crate) restart: RestartCoordinator,
    pub(crate) runtime: ClusterRuntime,
    pub(crate) closing: AtomicBool,
}

impl MasterShared {
    pub(crate) fn closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}

enum Role {
    Master(Arc<MasterShared>),
    Slave {
        node: NodeId,
        master_link: Mutex<TcpStream>,
    },
}

struct HandleInner {
    registry: Arc<WakeupRegistry>,
    runtime: ClusterRuntime,
    role: Role,
}

#[derive(Clone, Copy)]
enum WaitKind {
    Barrier,
    Semaphore,
    Event,
}

impl WaitKind {
    const fn command(self) -> Command {
        match self {
            Self::Barrier => Command::EnterBarrier,
            Self::Semaphore => Command::EnterSemaphore,
            Self::Event => Command::WaitForEvent,
        }
    }
}

/// A node's view of the cluster, shared by every thread on it.
///
/// Threads must call [`ClusterHandle::register_thread`] before their
/// first suspending sync call and [`ClusterHandle::deregister_thread`]
/// on the way out; the slave loop does both around every worker it
/// spawns.
#[derive(Clone)]
pub struct ClusterHandle {
    inner: Arc<HandleInner>,
}

impl ClusterHandle {
    fn master(shared: Arc<MasterShared>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                registry: Arc::clone(&shared.registry),
                runtime: shared.runtime.clone(),
                role: Role::Master(shared),
            }),
        }
    }

    fn slave(
        node: NodeId,
        registry: Arc<WakeupRegistry>,
        runtime: ClusterRuntime,
        master_link: TcpStream,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                registry,
                runtime,
                role: Role::Slave {
                    node,
                    master_link: Mutex::new(master_link),
                },
            }),
        }
    }

    /// This node's id within the current generation.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        match &self.inner.role {
            Role::Master(_) => NodeId::MASTER,
            Role::Slave { node, .. } => *node,
        }
    }

    /// Whether this handle belongs to the master.
    #[must_use]
    pub fn is_master(&self) -> bool {
        matches!(self.inner.role, Role::Master(_))
    }

    /// Give the calling thread a wakeup event and a thread id.
    pub fn register_thread(&self) -> ThreadId {
        self.inner.registry.register_current_thread()
    }

    /// Drop the calling thread's wakeup event.
    pub fn deregister_thread(&self) {
        self.inner.registry.deregister_current_thread();
    }

    /// Arrive at the barrier named by `key`; block until the group is
    /// complete or `timeout` expires. `Ok(true)` on release.
    pub fn enter_barrier(&self, key: ObjectKey, timeout: Duration) -> Result<bool> {
        self.suspend(WaitKind::Barrier, key, timeout)
    }

    /// Acquire the semaphore named by `key`. `Ok(true)` on grant,
    /// `Ok(false)` when `timeout` expired first.
    pub fn enter_semaphore(&self, key: ObjectKey, timeout: Duration) -> Result<bool> {
        self.suspend(WaitKind::Semaphore, key, timeout)
    }

    /// Release the semaphore named by `key`.
    pub fn leave_semaphore(&self, key: ObjectKey) -> Result<()> {
        match &self.inner.role {
            Role::Master(shared) => {
                shared.sync.semaphore_leave(NodeId::MASTER, key);
                Ok(())
            }
            Role::Slave { .. } => {
                let thread = crate::wakeup::current_thread_id().unwrap_or(ThreadId::new(0));
                self.send_to_master(&CommandPacket::sync_request(
                    Command::LeaveSemaphore,
                    key,
                    thread,
                    0,
                ))
            }
        }
    }

    /// Wait for the event named by `key` to be signaled.
    pub fn wait_for_event(&self, key: ObjectKey, timeout: Duration) -> Result<bool> {
        self.suspend(WaitKind::Event, key, timeout)
    }

    /// Signal the event named by `key`.
    pub fn set_event(&self, key: ObjectKey) -> Result<()> {
        match &self.inner.role {
            Role::Master(shared) => {
                shared.sync.event_set(NodeId::MASTER, key);
                Ok(())
            }
            Role::Slave { .. } => {
                self.send_to_master(&CommandPacket::keyed(Command::SetEvent, key))
            }
        }
    }

    /// Reset the event named by `key`.
    pub fn reset_event(&self, key: ObjectKey) -> Result<()> {
        match &self.inner.role {
            Role::Master(shared) => {
                shared.sync.event_reset(NodeId::MASTER, key);
                Ok(())
            }
            Role::Slave { .. } => {
                self.send_to_master(&CommandPacket::keyed(Command::ResetEvent, key))
            }
        }
    }

    fn suspend(&self, kind: WaitKind, key: ObjectKey, timeout: Duration) -> Result<bool> {
        let (thread, generation) = self.inner.registry.arm_current()?;
        match &self.inner.role {
            Role::Master(shared) => match kind {
                WaitKind::Barrier => {
                    shared.sync.barrier_enter(NodeId::MASTER, key, thread, generation);
                }
                WaitKind::Semaphore => {
                    shared
                        .sync
                        .semaphore_enter(NodeId::MASTER, key, thread, generation);
                }
                WaitKind::Event => {
                    shared.sync.event_wait(NodeId::MASTER, key, thread, generation);
                }
            },
            Role::Slave { .. } => {
                self.send_to_master(&CommandPacket::sync_request(
                    kind.command(),
                    key,
                    thread,
                    generation,
                ))?;
            }
        }
        self.inner.registry.wait_current(timeout)
    }

    pub(crate) fn send_to_master(&self, packet: &CommandPacket) -> Result<()> {
        match &self.inner.role {
            Role::Slave { master_link, .. } => {
                let mut stream = master_link.lock();
                send_packet(&mut stream, packet)
            }
            Role::Master(_) => Err(StarmemError::Internal(
                "master has no uplink to itself".to_owned(),
            )),
        }
    }

    pub(crate) fn registry(&self) -> &WakeupRegistry {
        &self.inner.registry
    }

    pub(crate) fn runtime(&self) -> &ClusterRuntime {
        &self.inner.runtime
    }
}

/// Outcome of [`MasterNode::start`].
#[must_use]
pub enum MasterStart {
    /// The cluster is up; drive it through the contained node.
    Running(MasterNode),
    /// A checkpoint was pending: the external restore routine has run
    /// and this process should exit instead of doing fresh work.
    Restarted,
}

/// The running master. Owns the cluster's lifetime: dropping it without
/// [`MasterNode::shutdown`] leaves slaves blocked on their sockets.
pub struct MasterNode {
    shared: Arc<MasterShared>,
    handle: ClusterHandle,
}

impl MasterNode {
    /// Bootstrap the cluster described by `cluster` / `storage`.
    ///
    /// Connects to every slave in node-id order, runs the handshake,
    /// initializes storage, starts the control receivers and — iff
    /// checkpointing is enabled — the failure detector, then brings up
    /// the data plane. A pending checkpoint short-circuits into
    /// [`MasterStart::Restarted`] after the external restore ran.
    pub fn start(
        cluster: ClusterMap,
        storage: StorageMap,
        backend: BackendKind,
        cache: CacheKind,
        runtime: ClusterRuntime,
        config: ClusterConfig,
    ) -> Result<MasterStart> {
        let checkpoint = runtime
            .checkpoint
            .as_ref()
            .map_or(-1, |c| c.pending_checkpoint());

        let mut write_links = vec![None];
        let mut read_streams = Vec::new();
        for node in cluster.slave_ids() {
            let peer = cluster
                .get(node)
                .ok_or(StarmemError::UnknownNode { node: node.get() })?;
            let mut stream = transport::connect(&peer.host, peer.port)?;
            handshake::master_side(
                &mut stream,
                node,
                &cluster,
                &storage,
                backend,
                cache,
                checkpoint,
            )?;
            read_streams.push((node, stream.try_clone()?));
            write_links.push(Some(Mutex::new(stream)));
        }

        runtime
            .storage
            .init(backend, cache, &cluster, &storage, NodeId::MASTER)?;

        let registry = Arc::new(WakeupRegistry::new());
        let links = Arc::new(PeerLinks::new(write_links));
        let sink = Arc::new(LinkWakeSink {
            registry: Arc::clone(&registry),
            links: Arc::clone(&links),
        });
        let sync = SyncManager::new(Arc::clone(&runtime.store), sink);
        let shared = Arc::new(MasterShared {
            config,
            liveness: LivenessTable::new(cluster.num_nodes()),
            cluster,
            links,
            registry,
            sync,
            restart: RestartCoordinator::new(),
            runtime: runtime.clone(),
            closing: AtomicBool::new(false),
        });

        listener::spawn_receivers(&shared, read_streams);
        if runtime.checkpoint.is_some() {
            liveness::spawn_failure_detector(Arc::clone(&shared));
        }

        runtime.data.init(&shared.cluster, NodeId::MASTER)?;
        runtime.data.wait_ready()?;
        if let Some(checkpointing) = &runtime.checkpoint {
            checkpointing.init()?;
            if checkpoint >= 0 {
                info!(checkpoint, "pending checkpoint found, restoring");
                checkpointing.restore(checkpoint)?;
                return Ok(MasterStart::Restarted);
            }
        }

        info!(nodes = shared.cluster.num_nodes(), "cluster up");
        let handle = ClusterHandle::master(Arc::clone(&shared));
        Ok(MasterStart::Running(MasterNode { shared, handle }))
    }

    /// The sync/API handle for this node's threads.
    #[must_use]
    pub fn handle(&self) -> &ClusterHandle {
        &self.handle
    }

    /// Request a worker on `node` with no inline payload.
    pub fn create_remote_thread(
        &self,
        node: NodeId,
        index: u32,
        param: u32,
        key: ObjectKey,
    ) -> Result<()> {
        spawn::create_thread(&self.shared.links, node, index, param, key)
    }

    /// Request a worker on `node`, shipping up to 2048 payload bytes
    /// inline.
    pub fn create_remote_thread_with_payload(
        &self,
        node: NodeId,
        index: u32,
        param: u32,
        key: ObjectKey,
        payload: &[u8],
    ) -> Result<()> {
        spawn::create_thread_with_payload(&self.shared.links, node, index, param, key, payload)
    }

    /// Gracefully close the cluster: tell every slave to exit, drop the
    /// checkpoint, and tear down the collaborators.
    pub fn shutdown(self) -> Result<()> {
        self.shared.closing.store(true, Ordering::SeqCst);
        let close = CommandPacket::bare(Command::Close);
        for node in self.shared.cluster.slave_ids() {
            if let Err(error) = self.shared.links.send_packet(node, &close) {
                warn!(%node, %error, "failed to send close");
            }
        }
        if let Some(checkpointing) = &self.shared.runtime.checkpoint {
            checkpointing.delete()?;
        }
        self.shared.runtime.data.close();
        self.shared.runtime.storage.close();
        self.shared.runtime.entry.shutdown();
        info!("cluster closed");
        Ok(())
    }
}

/// Slave-side entry point.
pub struct SlaveNode;

impl SlaveNode {
    /// Listen on `port`, serve one master connection, return when the
    /// master closes the cluster (or the control socket dies).
    pub fn run(port: u16, runtime: ClusterRuntime) -> Result<()> {
        let listener = transport::listen(port)?;
        info!(port, "waiting for master");
        Self::serve(&listener, runtime)
    }

    /// Accept one control connection on an existing listener and serve
    /// it. Useful when the caller needs the OS-assigned port first.
    pub fn serve(listener: &TcpListener, runtime: ClusterRuntime) -> Result<()> {
        let mut stream = transport::accept(listener)?;
        let greeting = handshake::slave_side(&mut stream)?;
        let node = NodeId::new(greeting.hello.node_id);

        if let Some(hook) = &runtime.slave_init {
            hook(node);
        }
        runtime.storage.init(
            BackendKind(greeting.hello.backend),
            CacheKind(greeting.hello.cache),
            &greeting.cluster,
            &greeting.storage,
            node,
        )?;
        runtime.data.init(&greeting.cluster, node)?;
        runtime.data.wait_ready()?;
        if let Some(checkpointing) = &runtime.checkpoint {
            checkpointing.init()?;
            if greeting.hello.checkpoint >= 0 {
                info!(
                    checkpoint = greeting.hello.checkpoint,
                    "pending checkpoint found, restoring"
                );
                checkpointing.restore(greeting.hello.checkpoint)?;
            }
        }

        let registry = Arc::new(WakeupRegistry::new());
        let handle = ClusterHandle::slave(node, registry, runtime.clone(), stream.try_clone()?);
        let served = slave::run_control_loop(&handle, &mut stream);

        runtime.storage.close();
        runtime.data.close();
        runtime.entry.shutdown();
        served
    }
}
