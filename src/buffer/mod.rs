//! Buffer Module
//!
//! Byte storage shared between the read path, the protocol parser and the
//! write queues of every descriptor.
//!
//! ## Overview
//!
//! Data read from a socket is appended to a descriptor's read buffer as a new
//! segment. When the parser completes a logical packet it splits the packet's
//! bytes off the front of the read buffer; the resulting `Buffer` shares the
//! same storage, so forwarding a packet to another descriptor never copies
//! the payload.
//!
//! ```text
//!  socket read ──> [ read buffer: seg seg seg ]
//!                         │ split_to(packet_len)
//!                         ▼
//!                  [ packet: seg seg ] ──> router ──> write queue
//! ```
//!
//! Buffers have no internal locking. They are `Send`, so they can be moved
//! between workers through the task queue, but a buffer is only ever used by
//! one thread at a time.

pub mod chain;

pub use chain::{Buffer, BufferFlags};
