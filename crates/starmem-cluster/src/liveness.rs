//! Failure detection and coordinated cluster restart.
//!
//! A master thread wakes on a fixed period, probes every slave with
//! `Alive`, and collects the ones whose last sign of life is older than
//! the liveness timeout. Probe replies come back through the control
//! receivers, which timestamp the liveness table. Any silent peer, or
//! any broken control socket, condemns the whole generation: the master
//! broadcasts `Restart`, waits a grace period for slaves to exit, and
//! respawns itself with the unreachable peers excluded from the next
//! generation's table.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use starmem_types::command::{Command, CommandPacket};
use starmem_types::topology::PeerAddr;
use starmem_types::NodeId;
use tracing::{info, warn};

use crate::bootstrap::MasterShared;

/// Default period between `Alive` probes.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(2);

/// Default silence span after which a peer is declared dead.
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(5);

/// Default pause between broadcasting `Restart` and respawning, giving
/// slaves time to exit and release their ports.
pub const DEFAULT_RESTART_GRACE: Duration = Duration::from_secs(2);

/// Timing knobs for the failure detector and restart coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterConfig {
    pub probe_interval: Duration,
    pub liveness_timeout: Duration,
    pub restart_grace: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            probe_interval: DEFAULT_PROBE_INTERVAL,
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
            restart_grace: DEFAULT_RESTART_GRACE,
        }
    }
}

/// Last-seen timestamps, one per node, initialized to master start time.
pub struct LivenessTable {
    last_seen: Mutex<Vec<Instant>>,
}

impl LivenessTable {
    /// A table for `num_nodes` nodes, all considered live right now.
    #[must_use]
    pub fn new(num_nodes: usize) -> Self {
        Self {
            last_seen: Mutex::new(vec![Instant::now(); num_nodes]),
        }
    }

    /// Record a sign of life from `node`.
    pub fn record(&self, node: NodeId) {
        if let Some(slot) = self.last_seen.lock().get_mut(node.as_usize()) {
            *slot = Instant::now();
        }
    }

    /// Slaves silent for longer than `timeout`, in node-id order.
    #[must_use]
    pub fn silent(&self, timeout: Duration) -> Vec<NodeId> {
        let now = Instant::now();
        self.last_seen
            .lock()
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, seen)| now.duration_since(**seen) > timeout)
            .map(|(i, _)| NodeId::new(u32::try_from(i).expect("node count fits u32")))
            .collect()
    }
}

/// One-way latch: the first restart attempt wins, every later one is a
/// silent no-op. Never released — a successful restart replaces the
/// process.
pub(crate) struct RestartCoordinator {
    engaged: AtomicBool,
}

impl RestartCoordinator {
    pub(crate) fn new() -> Self {
        Self {
            engaged: AtomicBool::new(false),
        }
    }

    /// Broadcast `Restart`, collect unreachable peers into `excludes`,
    /// wait out the grace period, and hand over to the process-restart
    /// collaborator.
    pub(crate) fn restart_cluster(&self, shared: &MasterShared, mut excludes: Vec<PeerAddr>) {
        if self.engaged.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(excluded = excludes.len(), "restarting cluster");
        let packet = CommandPacket::bare(Command::Restart);
        for node in shared.cluster.slave_ids() {
            if shared.links.send_packet(node, &packet).is_err() {
                if let Some(addr) = shared.cluster.get(node) {
                    if !excludes.contains(addr) {
                        excludes.push(addr.clone());
                    }
                }
            }
        }
        thread::sleep(shared.config.restart_grace);
        shared.runtime.process.restart(&excludes);
    }
}

/// Spawn the detached failure-detector thread.
pub(crate) fn spawn_failure_detector(shared: Arc<MasterShared>) {
    thread::Builder::new()
        .name("starmem-liveness".to_owned())
        .spawn(move || {
            let probe = CommandPacket::bare(Command::Alive);
            loop {
                thread::sleep(shared.config.probe_interval);
                if shared.closing() {
                    return;
                }
                let silent = shared.liveness.silent(shared.config.liveness_timeout);
                let excludes: Vec<PeerAddr> = silent
                    .iter()
                    .filter_map(|node| shared.cluster.get(*node).cloned())
                    .collect();
                for node in shared.cluster.slave_ids() {
                    // Probe failures surface on the receiver side.
                    let _ = shared.links.send_packet(node, &probe);
                }
                if !excludes.is_empty() && !shared.closing() {
                    warn!(?silent, "peers silent beyond liveness timeout");
                    shared.restart.restart_cluster(&shared, excludes);
                    return;
                }
            }
        })
        .expect("spawn failure detector");
}
