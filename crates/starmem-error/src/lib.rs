//! Primary error type for starmem control-plane operations.
//!
//! Structured variants for the cases callers can act on; transport
//! failures fold into [`StarmemError::Io`] / [`StarmemError::ShortRead`].
//! Sync waits do not error on expiry — they return `Ok(false)` — so there
//! is no timeout variant for them here.

use std::time::Duration;

use thiserror::Error;

/// Primary error type for starmem control-plane operations.
#[derive(Error, Debug)]
pub enum StarmemError {
    // === Transport ===
    /// Socket-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection mid-message. Fatal on control
    /// channels: there is no way to resynchronize a fixed-layout stream.
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    /// Handshake magic mismatch; the peer is not a starmem node of a
    /// compatible build.
    #[error("bad handshake magic: expected {expected:#010x}, got {actual:#010x}")]
    BadMagic { expected: u32, actual: u32 },

    // === Protocol ===
    /// Command code outside the stable table.
    #[error("unknown command code {code}")]
    UnknownCommand { code: u32 },

    /// Inline thread payload exceeds the wire ceiling.
    #[error("inline payload of {len} bytes exceeds the {max}-byte limit")]
    PayloadTooLarge { len: u32, max: u32 },

    /// Handshake host record longer than the wire format allows.
    #[error("host record of {len} bytes exceeds the {max}-byte limit")]
    HostTooLong { len: usize, max: usize },

    /// Wire value outside its valid domain (e.g. a port above 65535).
    #[error("{what} out of range: {value}")]
    OutOfRange { what: &'static str, value: u64 },

    // === Usage ===
    /// The calling thread never registered a wakeup event and therefore
    /// cannot suspend on a sync primitive.
    #[error("calling thread is not registered with the cluster")]
    ThreadNotRegistered,

    /// A message named a node outside this generation's address table.
    #[error("no control link for node {node}")]
    UnknownNode { node: u32 },

    // === Fatal init ===
    /// The data-socket mesh did not become ready in time.
    #[error("data plane not ready after {timeout:?}")]
    ReadinessTimeout { timeout: Duration },

    /// Storage subsystem failed to initialize.
    #[error("storage initialization failed: {detail}")]
    StorageInit { detail: String },

    /// Invariant violation; indicates a bug.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, StarmemError>;
