//! Descriptor Module
//!
//! A descriptor wraps one non-blocking socket (client-facing or
//! backend-facing) together with everything the worker needs to drive it:
//! read buffer, packet parser, write queue, lifecycle state and the
//! role-specific [`Handler`].
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Descriptor                            │
//! │                                                             │
//! │  socket ──read──> read_buf ──feed──> PacketParser ──┐       │
//! │    ▲                                                │       │
//! │    │                                           Vec<Packet>  │
//! │    │                                                ▼       │
//! │  write_queue <──enqueue── router          Handler (client:  │
//! │  (Buffer, Buffer, ...)                     trx tracking)    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything in a descriptor is owned by exactly one worker. Other workers
//! refer to it by [`DescriptorId`] and reach it only by posting a task.

pub mod dcb;
pub mod handler;
pub mod socket;

// Re-export commonly used types
pub use dcb::{
    CloseProgress, Descriptor, DescriptorId, DescriptorLimits, DescriptorState, FlushStatus,
    ReadOutcome, TimeoutEvent,
};
pub use handler::{
    backoff_delay, BackendHandler, BackendTarget, ClientHandler, Credentials, Handler,
};
pub use socket::{connect, Socket};
