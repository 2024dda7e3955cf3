//! Address-table handshake run on every fresh control connection.
//!
//! The slave opens with a 4-byte magic; the master answers with a
//! 32-byte hello carrying the cluster shape, this slave's node id, the
//! backend/cache selectors, and the pending-restart checkpoint, followed
//! by one `{len, host, port}` record per peer (indices `1..num_nodes`)
//! and per storage server. The master's own table entry is not sent: the
//! slave reconstructs it from the connection's peer address plus the
//! `localport` field of the hello.

use std::net::TcpStream;

use starmem_error::{Result, StarmemError};
use starmem_types::limits::{
    MASTER_HELLO_WIRE_SIZE, MASTER_MAGIC, MAX_HOST_RECORD, SLAVE_HELLO_WIRE_SIZE, SLAVE_MAGIC,
};
use starmem_types::topology::{BackendKind, CacheKind, ClusterMap, PeerAddr, StorageMap};
use starmem_types::NodeId;
use tracing::{debug, info};

use crate::transport::{recv_all, send_all};

/// The master's handshake frame, 4-byte packed, host byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MasterHello {
    pub num_mem_server: u32,
    pub num_nodes: u32,
    pub node_id: u32,
    pub localport: i32,
    pub backend: u32,
    pub cache: u32,
    /// Checkpoint to restart from; negative when none is pending.
    pub checkpoint: i32,
}

impl MasterHello {
    fn to_bytes(self) -> [u8; MASTER_HELLO_WIRE_SIZE] {
        let mut out = [0u8; MASTER_HELLO_WIRE_SIZE];
        out[0..4].copy_from_slice(&MASTER_MAGIC.to_ne_bytes());
        out[4..8].copy_from_slice(&self.num_mem_server.to_ne_bytes());
        out[8..12].copy_from_slice(&self.num_nodes.to_ne_bytes());
        out[12..16].copy_from_slice(&self.node_id.to_ne_bytes());
        out[16..20].copy_from_slice(&self.localport.to_ne_bytes());
        out[20..24].copy_from_slice(&self.backend.to_ne_bytes());
        out[24..28].copy_from_slice(&self.cache.to_ne_bytes());
        out[28..32].copy_from_slice(&self.checkpoint.to_ne_bytes());
        out
    }

    fn from_bytes(bytes: [u8; MASTER_HELLO_WIRE_SIZE]) -> Result<Self> {
        let magic = u32::from_ne_bytes(bytes[0..4].try_into().expect("4-byte slice"));
        if magic != MASTER_MAGIC {
            return Err(StarmemError::BadMagic {
                expected: MASTER_MAGIC,
                actual: magic,
            });
        }
        Ok(Self {
            num_mem_server: u32::from_ne_bytes(bytes[4..8].try_into().expect("4-byte slice")),
            num_nodes: u32::from_ne_bytes(bytes[8..12].try_into().expect("4-byte slice")),
            node_id: u32::from_ne_bytes(bytes[12..16].try_into().expect("4-byte slice")),
            localport: i32::from_ne_bytes(bytes[16..20].try_into().expect("4-byte slice")),
            backend: u32::from_ne_bytes(bytes[20..24].try_into().expect("4-byte slice")),
            cache: u32::from_ne_bytes(bytes[24..28].try_into().expect("4-byte slice")),
            checkpoint: i32::from_ne_bytes(bytes[28..32].try_into().expect("4-byte slice")),
        })
    }
}

/// Everything a slave learns from the handshake.
#[derive(Debug)]
pub(crate) struct SlaveGreeting {
    pub hello: MasterHello,
    pub cluster: ClusterMap,
    pub storage: StorageMap,
}

/// Master side: consume the slave's magic, announce the cluster.
pub(crate) fn master_side(
    stream: &mut TcpStream,
    node: NodeId,
    cluster: &ClusterMap,
    storage: &StorageMap,
    backend: BackendKind,
    cache: CacheKind,
    checkpoint: i32,
) -> Result<()> {
    let mut magic_buf = [0u8; SLAVE_HELLO_WIRE_SIZE];
    recv_all(stream, &mut magic_buf)?;
    let magic = u32::from_ne_bytes(magic_buf);
    if magic != SLAVE_MAGIC {
        return Err(StarmemError::BadMagic {
            expected: SLAVE_MAGIC,
            actual: magic,
        });
    }

    let master = cluster
        .get(NodeId::MASTER)
        .ok_or_else(|| StarmemError::Internal("cluster table has no master entry".to_owned()))?;
    let hello = MasterHello {
        num_mem_server: u32::try_from(storage.servers().len()).map_err(|_| {
            StarmemError::OutOfRange {
                what: "storage server count",
                value: storage.servers().len() as u64,
            }
        })?,
        num_nodes: u32::try_from(cluster.num_nodes()).map_err(|_| StarmemError::OutOfRange {
            what: "node count",
            value: cluster.num_nodes() as u64,
        })?,
        node_id: node.get(),
        localport: i32::from(master.port),
        backend: backend.0,
        cache: cache.0,
        checkpoint,
    };
    send_all(stream, &hello.to_bytes())?;

    for peer in &cluster.peers()[1..] {
        send_addr_record(stream, peer)?;
    }
    for server in storage.servers() {
        send_addr_record(stream, server)?;
    }
    debug!(%node, peers = cluster.num_nodes(), "handshake sent");
    Ok(())
}

/// Slave side: announce ourselves, receive the cluster shape and tables.
pub(crate) fn slave_side(stream: &mut TcpStream) -> Result<SlaveGreeting> {
    send_all(stream, &SLAVE_MAGIC.to_ne_bytes())?;

    let mut hello_buf = [0u8; MASTER_HELLO_WIRE_SIZE];
    recv_all(stream, &mut hello_buf)?;
    let hello = MasterHello::from_bytes(hello_buf)?;

    // Entry 0 is inferred, not transmitted: the address we see the
    // master connect from, paired with its announced listen port.
    let master_host = stream.peer_addr()?.ip().to_string();
    let master_port = u16::try_from(hello.localport).map_err(|_| StarmemError::OutOfRange {
        what: "master port",
        value: u64::from(hello.localport.unsigned_abs()),
    })?;
    let mut peers = vec![PeerAddr::new(master_host, master_port)];
    for _ in 1..hello.num_nodes {
        peers.push(recv_addr_record(stream)?);
    }

    let mut servers = Vec::with_capacity(hello.num_mem_server as usize);
    for _ in 0..hello.num_mem_server {
        servers.push(recv_addr_record(stream)?);
    }

    info!(
        node = hello.node_id,
        nodes = hello.num_nodes,
        checkpoint = hello.checkpoint,
        "handshake complete"
    );
    Ok(SlaveGreeting {
        hello,
        cluster: ClusterMap::new(peers),
        storage: StorageMap::new(servers),
    })
}

/// One `{len: u32, host[len] NUL-terminated, port: u32}` record.
fn send_addr_record(stream: &mut TcpStream, addr: &PeerAddr) -> Result<()> {
    let mut host = addr.host.clone().into_bytes();
    host.truncate(MAX_HOST_RECORD - 1);
    host.push(0);
    let len = u32::try_from(host.len()).expect("host record fits u32");
    send_all(stream, &len.to_ne_bytes())?;
    send_all(stream, &host)?;
    send_all(stream, &u32::from(addr.port).to_ne_bytes())?;
    Ok(())
}

fn recv_addr_record(stream: &mut TcpStream) -> Result<PeerAddr> {
    let mut len_buf = [0u8; 4];
    recv_all(stream, &mut len_buf)?;
    let len = u32::from_ne_bytes(len_buf) as usize;
    if len > MAX_HOST_RECORD {
        return Err(StarmemError::HostTooLong {
            len,
            max: MAX_HOST_RECORD,
        });
    }

    let mut host_buf = vec![0u8; len];
    recv_all(stream, &mut host_buf)?;
    let nul = host_buf.iter().position(|&b| b == 0).unwrap_or(len);
    let host = String::from_utf8_lossy(&host_buf[..nul]).into_owned();

    let mut port_buf = [0u8; 4];
    recv_all(stream, &mut port_buf)?;
    let port_raw = u32::from_ne_bytes(port_buf);
    let port = u16::try_from(port_raw).map_err(|_| StarmemError::OutOfRange {
        what: "peer port",
        value: u64::from(port_raw),
    })?;

    Ok(PeerAddr::new(host, port))
}
