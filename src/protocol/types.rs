//! MySQL/MariaDB Wire Types
//!
//! This module defines the framing constants, command opcodes and packet
//! descriptions used by the gateway's protocol layer.
//!
//! ## Frame Format
//!
//! Every frame starts with a 4-byte header:
//!
//! ```text
//!  0      1      2      3      4 ...
//! ┌──────┬──────┬──────┬──────┬──────────────────────┐
//! │  payload length (LE 24) │ seq  │ payload (length bytes) │
//! └──────┴──────┴──────┴──────┴──────────────────────┘
//! ```
//!
//! A payload of exactly `0xFFFFFF` bytes means the logical packet continues
//! in the next frame; the packet ends with the first shorter frame (which may
//! be empty).
//!
//! ## Examples
//!
//! `COM_PING`: `01 00 00 00 0e`
//! `COM_QUERY "SELECT 1"`: `09 00 00 00 03 53 45 4c 45 43 54 20 31`

use crate::buffer::Buffer;
use crate::protocol::classify::CommandInfo;
use crate::protocol::tracker::TrxState;
use bytes::{BufMut, BytesMut};
use std::fmt;

/// Size of the frame header.
pub const HEADER_LEN: usize = 4;

/// Largest payload a single frame can carry.
pub const MAX_FRAME_PAYLOAD: usize = 0xFF_FFFF;

/// Largest payload of an EOF packet; longer 0xFE packets are data.
pub const EOF_MAX_PAYLOAD: usize = 8;

/// First payload byte of server replies
pub mod reply {
    pub const OK: u8 = 0x00;
    pub const LOCAL_INFILE: u8 = 0xFB;
    pub const EOF: u8 = 0xFE;
    pub const ERR: u8 = 0xFF;
}

/// Server status flag reported in synthetic OK packets.
pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;

/// Another result set follows this one.
pub const SERVER_MORE_RESULTS_EXIST: u16 = 0x0008;

/// A cursor was opened; the rows are fetched later.
pub const SERVER_STATUS_CURSOR_EXISTS: u16 = 0x0040;

/// Client capability: result sets end with an OK packet instead of EOF.
pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

/// A client command opcode (first payload byte of a command packet).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Sleep,
    Quit,
    InitDb,
    Query,
    FieldList,
    CreateDb,
    DropDb,
    Refresh,
    Shutdown,
    Statistics,
    ProcessInfo,
    Connect,
    ProcessKill,
    Debug,
    Ping,
    Time,
    DelayedInsert,
    ChangeUser,
    BinlogDump,
    TableDump,
    ConnectOut,
    RegisterSlave,
    StmtPrepare,
    StmtExecute,
    StmtSendLongData,
    StmtClose,
    StmtReset,
    SetOption,
    StmtFetch,
    Daemon,
    ResetConnection,
    StmtBulkExecute,
    Multi,
    Unknown(u8),
}

impl Command {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x00 => Command::Sleep,
            0x01 => Command::Quit,
            0x02 => Command::InitDb,
            0x03 => Command::Query,
            0x04 => Command::FieldList,
            0x05 => Command::CreateDb,
            0x06 => Command::DropDb,
            0x07 => Command::Refresh,
            0x08 => Command::Shutdown,
            0x09 => Command::Statistics,
            0x0A => Command::ProcessInfo,
            0x0B => Command::Connect,
            0x0C => Command::ProcessKill,
            0x0D => Command::Debug,
            0x0E => Command::Ping,
            0x0F => Command::Time,
            0x10 => Command::DelayedInsert,
            0x11 => Command::ChangeUser,
            0x12 => Command::BinlogDump,
            0x13 => Command::TableDump,
            0x14 => Command::ConnectOut,
            0x15 => Command::RegisterSlave,
            0x16 => Command::StmtPrepare,
            0x17 => Command::StmtExecute,
            0x18 => Command::StmtSendLongData,
            0x19 => Command::StmtClose,
            0x1A => Command::StmtReset,
            0x1B => Command::SetOption,
            0x1C => Command::StmtFetch,
            0x1D => Command::Daemon,
            0x1F => Command::ResetConnection,
            0xFA => Command::StmtBulkExecute,
            0xFE => Command::Multi,
            other => Command::Unknown(other),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Command::Sleep => 0x00,
            Command::Quit => 0x01,
            Command::InitDb => 0x02,
            Command::Query => 0x03,
            Command::FieldList => 0x04,
            Command::CreateDb => 0x05,
            Command::DropDb => 0x06,
            Command::Refresh => 0x07,
            Command::Shutdown => 0x08,
            Command::Statistics => 0x09,
            Command::ProcessInfo => 0x0A,
            Command::Connect => 0x0B,
            Command::ProcessKill => 0x0C,
            Command::Debug => 0x0D,
            Command::Ping => 0x0E,
            Command::Time => 0x0F,
            Command::DelayedInsert => 0x10,
            Command::ChangeUser => 0x11,
            Command::BinlogDump => 0x12,
            Command::TableDump => 0x13,
            Command::ConnectOut => 0x14,
            Command::RegisterSlave => 0x15,
            Command::StmtPrepare => 0x16,
            Command::StmtExecute => 0x17,
            Command::StmtSendLongData => 0x18,
            Command::StmtClose => 0x19,
            Command::StmtReset => 0x1A,
            Command::SetOption => 0x1B,
            Command::StmtFetch => 0x1C,
            Command::Daemon => 0x1D,
            Command::ResetConnection => 0x1F,
            Command::StmtBulkExecute => 0xFA,
            Command::Multi => 0xFE,
            Command::Unknown(b) => b,
        }
    }

    /// Returns true if the server sends a reply to this command.
    pub fn expects_response(self) -> bool {
        !matches!(
            self,
            Command::Quit | Command::StmtSendLongData | Command::StmtClose
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Command::Sleep => "COM_SLEEP",
            Command::Quit => "COM_QUIT",
            Command::InitDb => "COM_INIT_DB",
            Command::Query => "COM_QUERY",
            Command::FieldList => "COM_FIELD_LIST",
            Command::CreateDb => "COM_CREATE_DB",
            Command::DropDb => "COM_DROP_DB",
            Command::Refresh => "COM_REFRESH",
            Command::Shutdown => "COM_SHUTDOWN",
            Command::Statistics => "COM_STATISTICS",
            Command::ProcessInfo => "COM_PROCESS_INFO",
            Command::Connect => "COM_CONNECT",
            Command::ProcessKill => "COM_PROCESS_KILL",
            Command::Debug => "COM_DEBUG",
            Command::Ping => "COM_PING",
            Command::Time => "COM_TIME",
            Command::DelayedInsert => "COM_DELAYED_INSERT",
            Command::ChangeUser => "COM_CHANGE_USER",
            Command::BinlogDump => "COM_BINLOG_DUMP",
            Command::TableDump => "COM_TABLE_DUMP",
            Command::ConnectOut => "COM_CONNECT_OUT",
            Command::RegisterSlave => "COM_REGISTER_SLAVE",
            Command::StmtPrepare => "COM_STMT_PREPARE",
            Command::StmtExecute => "COM_STMT_EXECUTE",
            Command::StmtSendLongData => "COM_STMT_SEND_LONG_DATA",
            Command::StmtClose => "COM_STMT_CLOSE",
            Command::StmtReset => "COM_STMT_RESET",
            Command::SetOption => "COM_SET_OPTION",
            Command::StmtFetch => "COM_STMT_FETCH",
            Command::Daemon => "COM_DAEMON",
            Command::ResetConnection => "COM_RESET_CONNECTION",
            Command::StmtBulkExecute => "COM_STMT_BULK_EXECUTE",
            Command::Multi => "COM_MULTI",
            Command::Unknown(_) => "COM_UNKNOWN",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Unknown(b) => write!(f, "COM_UNKNOWN({:#04x})", b),
            other => f.write_str(other.name()),
        }
    }
}

/// A decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub payload_len: usize,
    pub seq: u8,
}

impl FrameHeader {
    pub fn new(payload_len: usize, seq: u8) -> Self {
        Self { payload_len, seq }
    }

    /// Decodes the first four bytes of `buf`, or `None` if it is too short.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        let payload_len = buf[0] as usize | (buf[1] as usize) << 8 | (buf[2] as usize) << 16;
        Some(Self {
            payload_len,
            seq: buf[3],
        })
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let len = self.payload_len.min(MAX_FRAME_PAYLOAD);
        [
            (len & 0xFF) as u8,
            ((len >> 8) & 0xFF) as u8,
            ((len >> 16) & 0xFF) as u8,
            self.seq,
        ]
    }
}

/// What a server packet means, judged from its first payload byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Ok,
    Err,
    Eof,
    /// The server asks the client to stream a local file
    LocalInfile,
    /// Result set metadata or rows, handshake payloads
    Data,
}

impl ResponseKind {
    /// Classifies a server packet.
    ///
    /// `0xFB` only means "send local file" as the first reply (sequence 1)
    /// to a query; elsewhere it is the NULL marker of a row.
    pub fn classify(first: Option<u8>, payload_len: usize, seq: u8) -> Self {
        match first {
            Some(reply::OK) => ResponseKind::Ok,
            Some(reply::ERR) => ResponseKind::Err,
            Some(reply::EOF) if payload_len <= EOF_MAX_PAYLOAD => ResponseKind::Eof,
            Some(reply::LOCAL_INFILE) if seq == 1 => ResponseKind::LocalInfile,
            _ => ResponseKind::Data,
        }
    }
}

/// The role a packet plays in the conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketKind {
    /// Connection-phase packet (greeting, auth exchange)
    Handshake,
    /// A classified client command
    Command(CommandInfo),
    /// A server reply
    Response(ResponseKind),
    /// One frame of bulk-load data
    BulkData,
    /// The empty frame that terminates a bulk load
    BulkEnd,
}

/// Metadata describing one logical packet emitted by the parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketMeta {
    pub kind: PacketKind,
    /// Sequence number of the first frame
    pub seq: u8,
    /// Number of frames the packet spans
    pub frames: u32,
    /// Payload length summed over all frames, headers excluded
    pub payload_len: usize,
    /// Transaction state after this command (client commands only)
    pub trx: Option<TrxState>,
}

impl PacketMeta {
    pub fn command(&self) -> Option<&CommandInfo> {
        match &self.kind {
            PacketKind::Command(info) => Some(info),
            _ => None,
        }
    }

    pub fn response(&self) -> Option<ResponseKind> {
        match self.kind {
            PacketKind::Response(kind) => Some(kind),
            _ => None,
        }
    }

    /// Sequence number of the last frame of the packet.
    pub fn last_seq(&self) -> u8 {
        self.seq.wrapping_add(self.frames.saturating_sub(1) as u8)
    }
}

/// Reads a length-encoded integer, returning the value and its width.
pub fn read_lenenc(buf: &[u8]) -> Option<(u64, usize)> {
    let (&first, rest) = buf.split_first()?;
    let width = match first {
        0..=0xFA => return Some((first as u64, 1)),
        0xFC => 2,
        0xFD => 3,
        0xFE => 8,
        _ => return None,
    };
    let bytes = rest.get(..width)?;
    let value = bytes
        .iter()
        .rev()
        .fold(0u64, |acc, &b| (acc << 8) | b as u64);
    Some((value, width + 1))
}

/// Frames `payload` starting at sequence `seq`.
///
/// Payloads of `max_frame` bytes or more are split into full frames followed
/// by a shorter (possibly empty) terminating frame.
pub fn encode_packet(seq: u8, payload: &[u8], max_frame: usize) -> Buffer {
    let max_frame = max_frame.clamp(1, MAX_FRAME_PAYLOAD);
    let frames = payload.len() / max_frame + 1;
    let mut out = BytesMut::with_capacity(payload.len() + frames * HEADER_LEN);
    let mut seq = seq;
    let mut rest = payload;

    loop {
        let n = rest.len().min(max_frame);
        out.put_slice(&FrameHeader::new(n, seq).encode());
        out.put_slice(&rest[..n]);
        rest = &rest[n..];
        seq = seq.wrapping_add(1);
        if n < max_frame {
            break;
        }
    }

    let mut buf = Buffer::from(out);
    buf.set_flag(crate::buffer::BufferFlags::COMPLETE_PACKETS);
    buf
}

/// Builds a command packet (sequence 0) with the given body.
pub fn command_packet(command: Command, body: &[u8]) -> Buffer {
    let mut payload = Vec::with_capacity(body.len() + 1);
    payload.push(command.as_byte());
    payload.extend_from_slice(body);
    encode_packet(0, &payload, MAX_FRAME_PAYLOAD)
}

/// Builds an ERR packet: `0xFF`, error code, `#`, 5-byte SQL state, message.
pub fn error_packet(seq: u8, code: u16, sqlstate: &str, message: &str) -> Buffer {
    let mut payload = Vec::with_capacity(9 + message.len());
    payload.push(reply::ERR);
    payload.extend_from_slice(&code.to_le_bytes());
    payload.push(b'#');

    let mut state = [b'H', b'Y', b'0', b'0', b'0'];
    for (dst, src) in state.iter_mut().zip(sqlstate.bytes()) {
        *dst = src;
    }
    payload.extend_from_slice(&state);
    payload.extend_from_slice(message.as_bytes());

    encode_packet(seq, &payload, MAX_FRAME_PAYLOAD)
}

/// Builds a minimal OK packet with no affected rows.
pub fn ok_packet(seq: u8) -> Buffer {
    let status = SERVER_STATUS_AUTOCOMMIT.to_le_bytes();
    let payload = [reply::OK, 0, 0, status[0], status[1], 0, 0];
    encode_packet(seq, &payload, MAX_FRAME_PAYLOAD)
}

/// Well-known error codes used for synthetic replies.
pub mod errcode {
    /// Lost connection to the backend during a query
    pub const SERVER_LOST: u16 = 2013;
    /// Malformed packet
    pub const MALFORMED_PACKET: u16 = 2027;
    /// Generic "connection refused" style error
    pub const CONNECTION_ERROR: u16 = 2003;
    /// Sent when the gateway shuts a session down
    pub const SERVER_SHUTDOWN: u16 = 1053;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_parse_and_encode() {
        let header = FrameHeader::parse(&[0x09, 0x00, 0x00, 0x03]).unwrap();
        assert_eq!(header, FrameHeader::new(9, 3));
        assert_eq!(header.encode(), [0x09, 0x00, 0x00, 0x03]);

        let big = FrameHeader::new(MAX_FRAME_PAYLOAD, 0);
        assert_eq!(big.encode(), [0xFF, 0xFF, 0xFF, 0x00]);
        assert!(FrameHeader::parse(&[1, 0, 0]).is_none());
    }

    #[test]
    fn test_command_opcodes() {
        assert_eq!(Command::from_byte(0x03), Command::Query);
        assert_eq!(Command::from_byte(0x16), Command::StmtPrepare);
        assert_eq!(Command::from_byte(0xFA), Command::StmtBulkExecute);
        assert_eq!(Command::from_byte(0x1E), Command::Unknown(0x1E));
        assert_eq!(Command::Unknown(0x1E).as_byte(), 0x1E);
        assert_eq!(Command::Ping.to_string(), "COM_PING");
        assert!(!Command::Quit.expects_response());
        assert!(Command::Query.expects_response());
    }

    #[test]
    fn test_lenenc_integers() {
        assert_eq!(read_lenenc(&[0x05, 0xAA]), Some((5, 1)));
        assert_eq!(read_lenenc(&[0xFC, 0x2C, 0x01]), Some((300, 3)));
        assert_eq!(read_lenenc(&[0xFD, 0x01, 0x00, 0x01]), Some((0x01_0001, 4)));
        assert_eq!(read_lenenc(&[0xFE, 1, 0, 0, 0, 0, 0, 0, 0]), Some((1, 9)));
        assert_eq!(read_lenenc(&[0xFC, 0x01]), None);
        assert_eq!(read_lenenc(&[0xFB]), None);
        assert_eq!(read_lenenc(&[]), None);
    }

    #[test]
    fn test_command_packet_layout() {
        let packet = command_packet(Command::Query, b"SELECT 1");
        assert_eq!(
            packet.to_vec(),
            b"\x09\x00\x00\x00\x03SELECT 1".to_vec()
        );
    }

    #[test]
    fn test_error_packet_layout() {
        let packet = error_packet(1, 2013, "HY000", "Lost connection").to_vec();
        assert_eq!(&packet[..4], &[24, 0, 0, 1]);
        assert_eq!(packet[4], reply::ERR);
        assert_eq!(u16::from_le_bytes([packet[5], packet[6]]), 2013);
        assert_eq!(&packet[7..13], b"#HY000");
        assert_eq!(&packet[13..], b"Lost connection");
    }

    #[test]
    fn test_encode_packet_splits_at_max_frame() {
        let payload = vec![7u8; 10];
        let packet = encode_packet(5, &payload, 4).to_vec();
        // 4 + 4 + 2 bytes in three frames
        assert_eq!(packet.len(), 10 + 3 * HEADER_LEN);
        assert_eq!(&packet[..4], &[4, 0, 0, 5]);
        assert_eq!(&packet[8..12], &[4, 0, 0, 6]);
        assert_eq!(&packet[16..20], &[2, 0, 0, 7]);

        // Exact multiple needs a trailing empty frame
        let exact = encode_packet(0, &[1u8; 8], 4).to_vec();
        assert_eq!(exact.len(), 8 + 3 * HEADER_LEN);
        assert_eq!(&exact[16..], &[0, 0, 0, 2]);
    }

    #[test]
    fn test_response_kind() {
        assert_eq!(ResponseKind::classify(Some(0x00), 7, 1), ResponseKind::Ok);
        assert_eq!(ResponseKind::classify(Some(0xFF), 20, 1), ResponseKind::Err);
        assert_eq!(ResponseKind::classify(Some(0xFE), 5, 3), ResponseKind::Eof);
        assert_eq!(ResponseKind::classify(Some(0xFE), 40, 3), ResponseKind::Data);
        assert_eq!(
            ResponseKind::classify(Some(0xFB), 12, 1),
            ResponseKind::LocalInfile
        );
        assert_eq!(ResponseKind::classify(Some(0xFB), 12, 4), ResponseKind::Data);
    }

    #[test]
    fn test_last_seq_wraps() {
        let meta = PacketMeta {
            kind: PacketKind::BulkData,
            seq: 255,
            frames: 2,
            payload_len: 0,
            trx: None,
        };
        assert_eq!(meta.last_seq(), 0);
    }
}
