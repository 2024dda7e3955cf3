//! Master-side remote thread creation.
//!
//! Fire-and-forget: a `CreateThread` packet (optionally with an inline
//! payload appended in the same send) goes down the slave's control
//! link and nothing comes back. Delivery problems surface as send
//! errors; execution problems are the entry function's business.

use starmem_error::{Result, StarmemError};
use starmem_types::command::CommandPacket;
use starmem_types::limits::MAX_INLINE_PAYLOAD;
use starmem_types::{NodeId, ObjectKey};

use crate::links::PeerLinks;

/// Request a worker on `node` with no inline payload.
pub(crate) fn create_thread(
    links: &PeerLinks,
    node: NodeId,
    index: u32,
    param: u32,
    key: ObjectKey,
) -> Result<()> {
    links.send_packet(node, &CommandPacket::create_thread(index, param, key, 0))
}

/// Request a worker on `node`, shipping `payload` inline.
///
/// Header and payload go out as one buffer in a single send so no other
/// packet can interleave between them.
pub(crate) fn create_thread_with_payload(
    links: &PeerLinks,
    node: NodeId,
    index: u32,
    param: u32,
    key: ObjectKey,
    payload: &[u8],
) -> Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| StarmemError::OutOfRange {
        what: "payload length",
        value: payload.len() as u64,
    })?;
    if len > MAX_INLINE_PAYLOAD {
        return Err(StarmemError::PayloadTooLarge {
            len,
            max: MAX_INLINE_PAYLOAD,
        });
    }
    let header = CommandPacket::create_thread(index, param, key, len);
    let mut frame = Vec::with_capacity(CommandPacket::WIRE_SIZE + payload.len());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(payload);
    links.send_bytes(node, &frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{accept, listen, recv_all, recv_packet};
    use parking_lot::Mutex;
    use starmem_types::command::Command;
    use std::net::TcpStream;
    use std::thread;

    fn links_to_loopback() -> (PeerLinks, TcpStream) {
        let listener = listen(0).expect("listen");
        let addr = listener.local_addr().expect("local addr");
        let join = thread::spawn(move || TcpStream::connect(addr).expect("connect"));
        let accepted = accept(&listener).expect("accept");
        let dialed = join.join().expect("join");
        (
            PeerLinks::new(vec![None, Some(Mutex::new(dialed))]),
            accepted,
        )
    }

    #[test]
    fn test_payload_rides_in_the_same_frame() {
        let (links, mut slave_end) = links_to_loopback();
        let payload = vec![0xab; 100];
        create_thread_with_payload(
            &links,
            NodeId::new(1),
            3,
            17,
            ObjectKey::new(5),
            &payload,
        )
        .expect("send");

        let header = recv_packet(&mut slave_end).expect("header");
        assert_eq!(header.command(), Some(Command::CreateThread));
        assert_eq!(header.param, 3);
        assert_eq!(header.param2, 17);
        assert_eq!(header.param3, 5);
        assert_eq!(header.param4, 100);
        let mut body = vec![0u8; 100];
        recv_all(&mut slave_end, &mut body).expect("body");
        assert_eq!(body, payload);
    }

    #[test]
    fn test_oversize_payload_is_refused_before_sending() {
        let (links, _slave_end) = links_to_loopback();
        let payload = vec![0u8; MAX_INLINE_PAYLOAD as usize + 1];
        let err = create_thread_with_payload(
            &links,
            NodeId::new(1),
            0,
            0,
            ObjectKey::new(1),
            &payload,
        )
        .expect_err("over the ceiling");
        assert!(matches!(err, StarmemError::PayloadTooLarge { .. }));
    }

    #[test]
    fn test_unknown_node_is_an_error() {
        let (links, _slave_end) = links_to_loopback();
        let err = create_thread(&links, NodeId::new(9), 0, 0, ObjectKey::new(1))
            .expect_err("no such link");
        assert!(matches!(err, StarmemError::UnknownNode { node: 9 }));
    }
}
