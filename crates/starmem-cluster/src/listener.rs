//! Master-side control receivers.
//!
//! One blocking receiver thread per slave control socket. Messages from
//! a single slave are processed in send order (TCP keeps them ordered
//! and one thread drains the socket); operations on a shared primitive
//! are serialized by the sync registry's mutex, so cross-socket
//! interleaving cannot reorder a waiter's enqueue against its wake.
//!
//! A transport error on any socket ends that receiver. When
//! checkpointing is enabled and the cluster is not shutting down, it
//! also triggers a whole-cluster restart — a dead control socket means
//! a dead or unreachable slave.

use std::net::TcpStream;
use std::sync::Arc;
use std::thread;

use starmem_types::command::{Command, CommandPacket};
use starmem_types::NodeId;
use tracing::{debug, warn};

use crate::bootstrap::MasterShared;
use crate::transport::recv_packet;

/// Spawn one detached receiver per slave connection.
pub(crate) fn spawn_receivers(shared: &Arc<MasterShared>, streams: Vec<(NodeId, TcpStream)>) {
    for (node, stream) in streams {
        let shared = Arc::clone(shared);
        thread::Builder::new()
            .name(format!("starmem-recv-{node}"))
            .spawn(move || receive_loop(&shared, node, stream))
            .expect("spawn control receiver");
    }
}

fn receive_loop(shared: &MasterShared, node: NodeId, mut stream: TcpStream) {
    loop {
        let packet = match recv_packet(&mut stream) {
            Ok(packet) => packet,
            Err(error) => {
                if shared.closing() {
                    debug!(%node, "control receiver exiting at shutdown");
                } else if shared.runtime.checkpoint.is_some() {
                    warn!(%node, %error, "control socket failed, restarting cluster");
                    shared.restart.restart_cluster(shared, Vec::new());
                } else {
                    warn!(%node, %error, "control socket failed");
                }
                return;
            }
        };
        dispatch(shared, node, &packet);
    }
}

fn dispatch(shared: &MasterShared, node: NodeId, packet: &CommandPacket) {
    match packet.command() {
        Some(Command::EnterBarrier) => shared.sync.barrier_enter(
            node,
            packet.key(),
            packet.waiter_thread(),
            packet.wait_generation(),
        ),
        Some(Command::EnterSemaphore) => shared.sync.semaphore_enter(
            node,
            packet.key(),
            packet.waiter_thread(),
            packet.wait_generation(),
        ),
        Some(Command::LeaveSemaphore) => shared.sync.semaphore_leave(node, packet.key()),
        Some(Command::WaitForEvent) => shared.sync.event_wait(
            node,
            packet.key(),
            packet.waiter_thread(),
            packet.wait_generation(),
        ),
        Some(Command::SetEvent) => shared.sync.event_set(node, packet.key()),
        Some(Command::ResetEvent) => shared.sync.event_reset(node, packet.key()),
        Some(Command::Alive) => shared.liveness.record(node),
        _ => warn!(code = packet.cmd, %node, "unexpected control command"),
    }
}
