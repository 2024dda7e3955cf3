//! Master-side table of slave control connections.
//!
//! One write-locked stream per slave. Several master threads send on the
//! same link (the sync registry's wakes, the failure detector's probes,
//! the remote-thread spawner), so each stream sits behind its own mutex
//! to keep packets contiguous on the wire.

use std::net::TcpStream;
use std::sync::Arc;

use parking_lot::Mutex;
use starmem_error::{Result, StarmemError};
use starmem_types::command::CommandPacket;
use starmem_types::{NodeId, ThreadId};
use tracing::warn;

use crate::sync::WakeSink;
use crate::transport::send_all;
use crate::wakeup::WakeupRegistry;

pub(crate) struct PeerLinks {
    /// Indexed by node id; entry 0 (the master itself) is `None`.
    links: Vec<Option<Mutex<TcpStream>>>,
}

impl PeerLinks {
    pub(crate) fn new(links: Vec<Option<Mutex<TcpStream>>>) -> Self {
        Self { links }
    }

    /// Send one packet on `node`'s control link.
    pub(crate) fn send_packet(&self, node: NodeId, packet: &CommandPacket) -> Result<()> {
        self.send_bytes(node, &packet.to_bytes())
    }

    /// Send a raw pre-assembled frame (packet plus inline payload) as a
    /// single write.
    pub(crate) fn send_bytes(&self, node: NodeId, bytes: &[u8]) -> Result<()> {
        let slot = self
            .links
            .get(node.as_usize())
            .and_then(Option::as_ref)
            .ok_or(StarmemError::UnknownNode { node: node.get() })?;
        let mut stream = slot.lock();
        send_all(&mut stream, bytes)
    }
}

/// Wake delivery over the link table: master-local threads go through
/// the wakeup registry, remote threads get a `WakeSync` packet.
pub(crate) struct LinkWakeSink {
    pub(crate) registry: Arc<WakeupRegistry>,
    pub(crate) links: Arc<PeerLinks>,
}

impl WakeSink for LinkWakeSink {
    fn wake(&self, node: NodeId, thread: ThreadId, generation: u32) {
        if node.is_master() {
            self.registry.wake(thread, generation);
            return;
        }
        if let Err(error) = self
            .links
            .send_packet(node, &CommandPacket::wake(thread, generation))
        {
            warn!(%node, %thread, %error, "failed to deliver wake");
        }
    }
}
