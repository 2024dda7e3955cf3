//! Slave-side control loop.
//!
//! A single thread blocks on the master connection and dispatches
//! command packets. Worker threads requested by the master are spawned
//! detached: the control loop must stay responsive to wakes while user
//! code runs. Any transport error is fatal to the slave — a fixed-layout
//! stream that lost a byte cannot be trusted again.

use std::net::TcpStream;
use std::thread;

use starmem_error::Result;
use starmem_types::command::{Command, CommandPacket};
use starmem_types::limits::MAX_INLINE_PAYLOAD;
use starmem_types::{ObjectKey, ThreadId};
use tracing::{error, info, warn};

use crate::bootstrap::ClusterHandle;
use crate::transport::{recv_all, recv_packet};

/// Serve the master connection until `Close` or a transport error.
pub(crate) fn run_control_loop(handle: &ClusterHandle, stream: &mut TcpStream) -> Result<()> {
    loop {
        let packet = recv_packet(stream)?;
        match packet.command() {
            Some(Command::Close) => {
                info!("close requested, leaving control loop");
                return Ok(());
            }
            Some(Command::CreateThread) => handle_create_thread(handle, stream, &packet)?,
            Some(Command::WakeSync) => handle
                .registry()
                .wake(ThreadId::new(packet.param), packet.param2),
            // Echo through the shared uplink so the reply cannot tear a
            // worker's concurrent sync request mid-packet.
            Some(Command::Alive) => handle.send_to_master(&packet)?,
            Some(Command::Restart) => handle.runtime().process.restart(&[]),
            _ => warn!(code = packet.cmd, "unhandled control command"),
        }
    }
}

fn handle_create_thread(
    handle: &ClusterHandle,
    stream: &mut TcpStream,
    packet: &CommandPacket,
) -> Result<()> {
    if packet.param4 == 0 {
        spawn_worker(handle, packet, None);
        return Ok(());
    }
    if packet.param4 > MAX_INLINE_PAYLOAD {
        warn!(
            len = packet.param4,
            max = MAX_INLINE_PAYLOAD,
            "oversized thread payload refused"
        );
        // The length header is authoritative for what follows: drain the
        // declared bytes so the stream stays framed, spawn nothing.
        drain(stream, u64::from(packet.param4))?;
        return Ok(());
    }
    let mut payload = vec![0u8; packet.param4 as usize];
    recv_all(stream, &mut payload)?;
    spawn_worker(handle, packet, Some(payload));
    Ok(())
}

fn drain(stream: &mut TcpStream, mut remaining: u64) -> Result<()> {
    let mut chunk = [0u8; MAX_INLINE_PAYLOAD as usize];
    while remaining > 0 {
        let take = usize::try_from(remaining.min(chunk.len() as u64)).expect("bounded by chunk");
        recv_all(stream, &mut chunk[..take])?;
        remaining -= take as u64;
    }
    Ok(())
}

fn spawn_worker(handle: &ClusterHandle, packet: &CommandPacket, payload: Option<Vec<u8>>) {
    let handle = handle.clone();
    let (index, param, key) = (packet.param, packet.param2, ObjectKey::new(packet.param3));
    let spawned = thread::Builder::new()
        .name("starmem-worker".to_owned())
        .spawn(move || {
            handle.register_thread();
            match payload {
                Some(bytes) => handle
                    .runtime()
                    .entry
                    .run_with_payload(&handle, index, param, key, bytes),
                None => handle.runtime().entry.run(&handle, index, param, key),
            }
            handle.deregister_thread();
        });
    if let Err(err) = spawned {
        error!(error = %err, "failed to spawn worker thread");
    }
}
