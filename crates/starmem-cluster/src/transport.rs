//! Blocking, length-exact TCP helpers for the control channel.
//!
//! Control messages are fixed-layout records with no framing beyond
//! their declared length, so a partial transfer is protocol corruption:
//! both directions move the full byte count or fail. Control sockets run
//! with `TCP_NODELAY` — a sync wake is a 24-byte packet and must not sit
//! in a Nagle buffer.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};

use socket2::{Domain, Protocol, Socket, Type};
use starmem_error::{Result, StarmemError};
use starmem_types::command::CommandPacket;
use tracing::debug;

const LISTEN_BACKLOG: i32 = 5;

/// Receive exactly `buf.len()` bytes into `buf`.
///
/// A clean close mid-message surfaces as [`StarmemError::ShortRead`]
/// carrying how far the transfer got.
pub fn recv_all(stream: &mut TcpStream, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(StarmemError::ShortRead {
                    expected: buf.len(),
                    actual: filled,
                })
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Send the whole buffer.
pub fn send_all(stream: &mut TcpStream, buf: &[u8]) -> Result<()> {
    stream.write_all(buf)?;
    Ok(())
}

/// Receive one command packet.
pub fn recv_packet(stream: &mut TcpStream) -> Result<CommandPacket> {
    let mut buf = [0u8; CommandPacket::WIRE_SIZE];
    recv_all(stream, &mut buf)?;
    Ok(CommandPacket::from_bytes(buf))
}

/// Send one command packet.
pub fn send_packet(stream: &mut TcpStream, packet: &CommandPacket) -> Result<()> {
    send_all(stream, &packet.to_bytes())
}

/// Open a control listener on `port` (0 lets the OS pick).
///
/// `SO_REUSEADDR` is set so a restarted generation can rebind its port
/// while the previous generation's sockets drain out of TIME_WAIT.
pub fn listen(port: u16) -> Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

/// Accept one control connection and configure it for low latency.
pub fn accept(listener: &TcpListener) -> Result<TcpStream> {
    let (stream, peer) = listener.accept()?;
    stream.set_nodelay(true)?;
    debug!(%peer, "control connection accepted");
    Ok(stream)
}

/// Dial a peer's control port.
pub fn connect(host: &str, port: u16) -> Result<TcpStream> {
    let stream = TcpStream::connect((host, port))?;
    stream.set_nodelay(true)?;
    debug!(host, port, "control connection established");
    Ok(stream)
}
