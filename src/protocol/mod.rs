//! MySQL/MariaDB Protocol Layer
//!
//! This module turns the byte stream of a connection into classified logical
//! packets that a router can act on.
//!
//! ## Modules
//!
//! - `types`: frame header, command opcodes, packet metadata and builders for
//!   synthetic packets
//! - `parser`: incremental, zero-copy packet reassembly
//! - `classify`: command and SQL keyword classification
//! - `tracker`: per-session transaction state
//!
//! ## Example
//!
//! ```ignore
//! use dbgate::buffer::Buffer;
//! use dbgate::protocol::{PacketParser, Phase, Role};
//!
//! let mut parser = PacketParser::with_defaults(Role::Client);
//! parser.set_phase(Phase::Command);
//!
//! let mut buf = Buffer::copy_from_slice(b"\x09\x00\x00\x00\x03SELECT 1");
//! let feed = parser.feed(&mut buf);
//! assert_eq!(feed.packets.len(), 1);
//! ```

pub mod classify;
pub mod parser;
pub mod tracker;
pub mod types;

// Re-export commonly used types for convenience
pub use classify::{classify, classify_sql, CommandInfo, SqlInfo, TypeMask};
pub use parser::{Feed, Packet, PacketParser, ParserLimits, Phase, Role};
pub use tracker::{TransactionTracker, TrxState};
pub use types::{
    command_packet, encode_packet, error_packet, ok_packet, Command, FrameHeader, PacketKind,
    PacketMeta, ResponseKind,
};
