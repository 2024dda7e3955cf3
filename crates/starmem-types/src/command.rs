//! Control-channel command codes and the fixed-layout command packet.
//!
//! Every control message is one [`CommandPacket`]: a 24-byte record with
//! 4-byte packing, transferred in host byte order (the cluster is assumed
//! homogeneous, so no endianness translation is performed). A
//! `CreateThread` packet with a non-zero `param4` is followed by exactly
//! that many payload bytes; nothing else on the channel is framed.

use crate::limits::COMMAND_WIRE_SIZE;
use crate::{ObjectKey, ThreadId};

/// Control-channel command codes.
///
/// Values are stable and must match on every node of a cluster
/// generation. The garbage-collection and thread-control codes are
/// reserved by the protocol but not dispatched by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    /// Leave the slave control loop and tear the node down.
    Close = 1,
    /// Spawn a worker thread on the receiving slave.
    CreateThread = 2,
    /// Reserved.
    SuspendThread = 3,
    /// Reserved.
    StopThread = 4,
    /// Reserved.
    TriggerGc = 5,
    /// Reserved.
    DoGc = 6,
    /// Reserved.
    DoneGc = 7,
    /// Signal a suspended thread's wakeup event on the receiving node.
    WakeSync = 8,
    /// Barrier arrival.
    EnterBarrier = 9,
    /// Semaphore acquire.
    EnterSemaphore = 10,
    /// Semaphore release.
    LeaveSemaphore = 11,
    /// Event wait.
    WaitForEvent = 12,
    /// Event signal.
    SetEvent = 13,
    /// Event reset.
    ResetEvent = 14,
    /// Liveness probe; echoed back by slaves, timestamped by the master.
    Alive = 15,
    /// Restart the receiving process for a new cluster generation.
    Restart = 16,
}

impl Command {
    /// Decode a raw command code.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Close),
            2 => Some(Self::CreateThread),
            3 => Some(Self::SuspendThread),
            4 => Some(Self::StopThread),
            5 => Some(Self::TriggerGc),
            6 => Some(Self::DoGc),
            7 => Some(Self::DoneGc),
            8 => Some(Self::WakeSync),
            9 => Some(Self::EnterBarrier),
            10 => Some(Self::EnterSemaphore),
            11 => Some(Self::LeaveSemaphore),
            12 => Some(Self::WaitForEvent),
            13 => Some(Self::SetEvent),
            14 => Some(Self::ResetEvent),
            15 => Some(Self::Alive),
            16 => Some(Self::Restart),
            _ => None,
        }
    }

    /// The stable wire value.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self as u32
    }
}

/// One control-channel message.
///
/// Field use by command:
///
/// | Command | `param` | `param2` | `param3` | `param4` |
/// |---|---|---|---|---|
/// | `CreateThread` | entry index | user param | object key | payload length |
/// | sync requests | wait generation | thread id | object key | — |
/// | `WakeSync` | thread id | wait generation | — | — |
/// | `Close`/`Alive`/`Restart` | — | — | — | — |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandPacket {
    pub cmd: u32,
    pub param: u32,
    pub param2: u32,
    pub param3: u64,
    pub param4: u32,
}

impl CommandPacket {
    /// Packet size on the wire.
    pub const WIRE_SIZE: usize = COMMAND_WIRE_SIZE;

    /// A packet carrying only a command code.
    #[must_use]
    pub const fn bare(cmd: Command) -> Self {
        Self {
            cmd: cmd.raw(),
            param: 0,
            param2: 0,
            param3: 0,
            param4: 0,
        }
    }

    /// A `WakeSync` aimed at `thread`'s wait `generation`.
    #[must_use]
    pub const fn wake(thread: ThreadId, generation: u32) -> Self {
        Self {
            cmd: Command::WakeSync.raw(),
            param: thread.get(),
            param2: generation,
            param3: 0,
            param4: 0,
        }
    }

    /// A suspension request (`EnterBarrier`, `EnterSemaphore`,
    /// `LeaveSemaphore`, `WaitForEvent`) on the primitive named by `key`.
    #[must_use]
    pub const fn sync_request(
        cmd: Command,
        key: ObjectKey,
        thread: ThreadId,
        generation: u32,
    ) -> Self {
        Self {
            cmd: cmd.raw(),
            param: generation,
            param2: thread.get(),
            param3: key.get(),
            param4: 0,
        }
    }

    /// A key-only command (`SetEvent`, `ResetEvent`).
    #[must_use]
    pub const fn keyed(cmd: Command, key: ObjectKey) -> Self {
        Self {
            cmd: cmd.raw(),
            param: 0,
            param2: 0,
            param3: key.get(),
            param4: 0,
        }
    }

    /// A `CreateThread` header. `payload_len` of 0 means no inline bytes.
    #[must_use]
    pub const fn create_thread(index: u32, param: u32, key: ObjectKey, payload_len: u32) -> Self {
        Self {
            cmd: Command::CreateThread.raw(),
            param: index,
            param2: param,
            param3: key.get(),
            param4: payload_len,
        }
    }

    /// Decode the command code, if known.
    #[must_use]
    pub const fn command(&self) -> Option<Command> {
        Command::from_raw(self.cmd)
    }

    /// The object key (`param3`).
    #[must_use]
    pub const fn key(&self) -> ObjectKey {
        ObjectKey::new(self.param3)
    }

    /// The suspended thread of a sync request (`param2`).
    #[must_use]
    pub const fn waiter_thread(&self) -> ThreadId {
        ThreadId::new(self.param2)
    }

    /// The wait generation of a sync request (`param`).
    #[must_use]
    pub const fn wait_generation(&self) -> u32 {
        self.param
    }

    /// Encode with 4-byte packing in host byte order.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut out = [0u8; Self::WIRE_SIZE];
        out[0..4].copy_from_slice(&self.cmd.to_ne_bytes());
        out[4..8].copy_from_slice(&self.param.to_ne_bytes());
        out[8..12].copy_from_slice(&self.param2.to_ne_bytes());
        out[12..20].copy_from_slice(&self.param3.to_ne_bytes());
        out[20..24].copy_from_slice(&self.param4.to_ne_bytes());
        out
    }

    /// Decode a wire record produced by [`CommandPacket::to_bytes`].
    #[must_use]
    pub fn from_bytes(bytes: [u8; Self::WIRE_SIZE]) -> Self {
        Self {
            cmd: u32::from_ne_bytes(bytes[0..4].try_into().expect("4-byte slice")),
            param: u32::from_ne_bytes(bytes[4..8].try_into().expect("4-byte slice")),
            param2: u32::from_ne_bytes(bytes[8..12].try_into().expect("4-byte slice")),
            param3: u64::from_ne_bytes(bytes[12..20].try_into().expect("8-byte slice")),
            param4: u32::from_ne_bytes(bytes[20..24].try_into().expect("4-byte slice")),
        }
    }
}
