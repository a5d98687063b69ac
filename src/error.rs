//! Error Types
//!
//! Three layers of errors flow through the gateway:
//!
//! - [`ProtocolError`]: the byte stream of one connection can no longer be
//!   trusted (bad header, sequence mismatch, oversized frame). Always fatal
//!   for that connection.
//! - [`CloseReason`]: why a descriptor left the ACTIVE state. This is what
//!   routers see in `on_descriptor_error`; it separates protocol corruption
//!   from network failure so a router never retries a desynchronized stream.
//! - [`CoreError`]: misuse of the core API (unknown descriptor, invalid state
//!   transition, blocking on the wrong thread) and I/O errors at setup time.

use crate::descriptor::{DescriptorId, DescriptorState};
use std::io;
use thiserror::Error;

/// Fatal framing errors detected by the packet parser.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The frame carries a sequence number other than the expected one
    #[error("sequence mismatch: expected {expected}, got {actual}")]
    SequenceMismatch { expected: u8, actual: u8 },

    /// A single frame announces a payload above the configured maximum
    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// The reassembled logical packet exceeds the configured cap
    #[error("packet too large: {size} bytes (max: {max})")]
    PacketTooLarge { size: usize, max: usize },

    /// The packet is structurally invalid
    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    /// Bulk-load mode was left with a frame half received
    #[error("bulk load desynchronized: {pending} bytes of an unfinished frame")]
    BulkDesync { pending: usize },

    /// Input after a fatal error
    #[error("parser is poisoned by an earlier error")]
    Poisoned,
}

/// Why a descriptor was (or is being) closed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed its end (read returned 0)
    #[error("connection closed by peer")]
    PeerClosed,

    /// Reset, broken pipe, refused, or any other fatal socket error
    #[error("network error ({kind:?}): {message}")]
    Network { kind: io::ErrorKind, message: String },

    /// The byte stream is desynchronized
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A backend connect did not complete in time
    #[error("connect timed out")]
    ConnectTimeout,

    /// Queued data could not be flushed before the drain deadline
    #[error("drain timed out with {discarded} buffers unsent")]
    DrainTimeout { discarded: usize },

    /// Closed on request by the router
    #[error("closed by router")]
    Requested,

    /// The worker is shutting down
    #[error("worker shutdown")]
    Shutdown,
}

impl CloseReason {
    /// Stable machine-readable reason code.
    pub fn code(&self) -> &'static str {
        match self {
            CloseReason::PeerClosed => "peer_closed",
            CloseReason::Network { .. } => "network",
            CloseReason::Protocol(_) => "protocol",
            CloseReason::ConnectTimeout => "connect_timeout",
            CloseReason::DrainTimeout { .. } => "drain_timeout",
            CloseReason::Requested => "requested",
            CloseReason::Shutdown => "shutdown",
        }
    }

    /// True when the stream itself is corrupt; retrying it is pointless.
    pub fn is_protocol(&self) -> bool {
        matches!(self, CloseReason::Protocol(_))
    }

    /// True for failures where a new connection may succeed.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            CloseReason::PeerClosed | CloseReason::Network { .. } | CloseReason::ConnectTimeout
        )
    }
}

impl From<io::Error> for CloseReason {
    fn from(err: io::Error) -> Self {
        CloseReason::Network {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Errors returned by the core API.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("unknown descriptor {0}")]
    UnknownDescriptor(DescriptorId),

    #[error("invalid state transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: DescriptorState,
        to: DescriptorState,
    },

    #[error("descriptor {0} is not a backend")]
    NotBackend(DescriptorId),

    #[error("descriptor {0} is closed")]
    Closed(DescriptorId),

    #[error("worker {0} is gone")]
    WorkerGone(usize),

    #[error("blocking wait from worker {0} would deadlock")]
    WouldDeadlock(usize),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
