//! Incremental Packet Parser
//!
//! This module reconstructs logical MySQL packets from the byte stream of one
//! connection. It is fed whatever the socket produced, in arbitrary-sized
//! pieces, and never blocks.
//!
//! ## How the Parser Works
//!
//! ```text
//!   read buffer
//!   ┌────────┬──────────────┬────────┬───────────┬────────┬──────
//!   │ header │ payload (max)│ header │ payload<max│ header │ par...
//!   └────────┴──────────────┴────────┴───────────┴────────┴──────
//!   ◄──────────── one logical packet ───────────►◄─ pending ──►
//!                                                 scanned = 0
//! ```
//!
//! 1. Fewer than four bytes: keep them and wait.
//! 2. Parse the header. The sequence number must be the expected one and the
//!    payload length must not exceed the configured frame maximum.
//! 3. Payload incomplete: remember the parsed header and how many bytes the
//!    buffer must hold before the frame is complete, so the next read resumes
//!    without re-parsing anything.
//! 4. A frame whose payload is exactly the frame maximum is continued by the
//!    next frame; the first shorter frame (possibly empty) ends the packet.
//! 5. Complete packet: classify it. In bulk-load mode every frame is passed
//!    through as opaque data until an empty frame ends the transfer.
//! 6. The packet is split off the read buffer (no copy) with its headers, so
//!    it can be forwarded verbatim.
//!
//! ## Sequence Numbers
//!
//! A client starts every command at sequence 0. Everything else (the
//! connection handshake, a `LOAD DATA LOCAL INFILE` transfer, and all server
//! replies) continues from the last packet the gateway wrote to that peer,
//! which is why the descriptor reports every outbound packet through
//! [`PacketParser::on_outbound`].

use crate::buffer::{Buffer, BufferFlags};
use crate::error::ProtocolError;
use crate::protocol::classify::classify;
use crate::protocol::types::{
    read_lenenc, reply, Command, FrameHeader, PacketKind, PacketMeta, ResponseKind,
    CLIENT_DEPRECATE_EOF, EOF_MAX_PAYLOAD, HEADER_LEN, MAX_FRAME_PAYLOAD,
    SERVER_MORE_RESULTS_EXIST, SERVER_STATUS_CURSOR_EXISTS,
};
use std::collections::VecDeque;
use std::fmt;

/// Default cap on a reassembled packet (1 GiB, the server's own limit).
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1 << 30;

/// Which side of the gateway a connection faces, i.e. which peer the
/// parsed bytes come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Bytes sent by a client: handshake responses and commands
    Client,
    /// Bytes sent by a backend server: greetings and replies
    Backend,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Backend => "backend",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection phase of the parsed stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Greeting and authentication exchange
    Handshake,
    /// Commands and their replies
    Command,
}

/// Size limits applied while parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParserLimits {
    /// A frame of exactly this many payload bytes continues the packet
    pub max_frame_payload: usize,
    /// Largest logical packet accepted
    pub max_packet_size: usize,
}

impl Default for ParserLimits {
    fn default() -> Self {
        Self {
            max_frame_payload: MAX_FRAME_PAYLOAD,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

/// One complete logical packet.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Frames of the packet, headers included
    pub data: Buffer,
    pub meta: PacketMeta,
}

/// Result of one [`PacketParser::feed`] call.
///
/// Packets completed before a fatal error are still returned; nothing from
/// the offending frame onward is.
#[derive(Debug, Default)]
pub struct Feed {
    pub packets: Vec<Packet>,
    pub error: Option<ProtocolError>,
}

/// State of the logical packet being reassembled at the buffer front.
#[derive(Debug, Default, Clone, Copy)]
struct Partial {
    /// Bytes of completed frames that belong to this packet
    scanned: usize,
    frames: u32,
    payload_len: usize,
    first_seq: u8,
    /// Header of the frame whose payload is still arriving
    header: Option<FrameHeader>,
}

/// Position of a backend within the reply to one command.
///
/// Sequence numbers wrap inside long result sets, so the parser follows the
/// reply structure to know when the next packet at sequence 1 may start the
/// reply to the next pipelined command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum ReplyState {
    /// No reply is open
    #[default]
    Idle,
    /// Expecting the first packet of a result
    Start,
    /// Column definitions still to come
    Columns(u64),
    /// The EOF after the column definitions
    ColumnsEof,
    Rows,
    /// Parameter and column metadata of a prepared statement
    Skip(u64),
}

/// Incremental parser for one connection.
#[derive(Debug)]
pub struct PacketParser {
    role: Role,
    phase: Phase,
    limits: ParserLimits,
    expected: u8,
    partial: Partial,
    /// Buffer length needed before another step can make progress
    need: usize,
    /// Client is streaming a local file to the server
    bulk: bool,
    /// The gateway is streaming a client's file to this backend
    outbound_bulk: bool,
    /// Commands written to a backend whose replies have not started yet
    queued: VecDeque<Command>,
    reply: ReplyState,
    /// Command whose reply is being parsed
    reply_command: Option<Command>,
    /// Capabilities the gateway announced to this backend
    capabilities: Option<u32>,
    last_command: Option<Command>,
    deferred_error: Option<ProtocolError>,
    poisoned: bool,
}

impl PacketParser {
    /// Creates a parser for a fresh connection (handshake phase).
    pub fn new(role: Role, limits: ParserLimits) -> Self {
        Self {
            role,
            phase: Phase::Handshake,
            limits,
            // The server greets with 0; the client answers with 1
            expected: match role {
                Role::Client => 1,
                Role::Backend => 0,
            },
            partial: Partial::default(),
            need: 0,
            bulk: false,
            outbound_bulk: false,
            queued: VecDeque::new(),
            reply: ReplyState::Idle,
            reply_command: None,
            capabilities: None,
            last_command: None,
            deferred_error: None,
            poisoned: false,
        }
    }

    pub fn with_defaults(role: Role) -> Self {
        Self::new(role, ParserLimits::default())
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn limits(&self) -> ParserLimits {
        self.limits
    }

    /// Sequence number the next inbound frame must carry.
    pub fn expected_seq(&self) -> u8 {
        self.expected
    }

    pub fn in_bulk_load(&self) -> bool {
        self.bulk
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// True while a backend reply is partially received.
    pub fn in_reply(&self) -> bool {
        self.reply != ReplyState::Idle
    }

    /// Commands sent to a backend whose replies have not started.
    pub fn pending_replies(&self) -> usize {
        self.queued.len()
    }

    /// Bytes the read buffer must hold before parsing can progress.
    pub fn bytes_needed(&self) -> usize {
        self.need
    }

    /// Parses every complete packet at the front of `buf`.
    ///
    /// Consumed bytes are split off `buf`; a trailing partial frame stays in
    /// it. After an error the parser is poisoned and rejects further input.
    pub fn feed(&mut self, buf: &mut Buffer) -> Feed {
        let mut feed = Feed::default();

        if let Some(err) = self.deferred_error.take() {
            self.poisoned = true;
            feed.error = Some(err);
            return feed;
        }
        if self.poisoned {
            feed.error = Some(ProtocolError::Poisoned);
            return feed;
        }
        if buf.len() < self.need {
            return feed;
        }

        loop {
            match self.step(buf) {
                Ok(Some(packet)) => feed.packets.push(packet),
                Ok(None) => break,
                Err(err) => {
                    self.poisoned = true;
                    feed.error = Some(err);
                    break;
                }
            }
        }

        feed
    }

    /// Produces at most one packet.
    fn step(&mut self, buf: &mut Buffer) -> Result<Option<Packet>, ProtocolError> {
        loop {
            let header = match self.partial.header {
                Some(header) => header,
                None => {
                    let start = self.partial.scanned;
                    let mut raw = [0u8; HEADER_LEN];
                    if buf.copy_to(start, &mut raw) < HEADER_LEN {
                        self.need = start + HEADER_LEN;
                        return Ok(None);
                    }
                    let header = FrameHeader::parse(&raw)
                        .ok_or(ProtocolError::Malformed("truncated frame header"))?;
                    self.check_header(header)?;
                    self.partial.header = Some(header);
                    header
                }
            };

            let frame_end = self.partial.scanned + HEADER_LEN + header.payload_len;
            if buf.len() < frame_end {
                self.need = frame_end;
                return Ok(None);
            }

            self.need = 0;
            self.partial.header = None;
            self.partial.frames += 1;
            self.partial.payload_len += header.payload_len;
            self.partial.scanned = frame_end;
            self.expected = header.seq.wrapping_add(1);

            if self.bulk {
                return Ok(Some(self.emit_bulk(buf, header)));
            }
            if header.payload_len == self.limits.max_frame_payload {
                continue;
            }
            return self.emit_packet(buf).map(Some);
        }
    }

    fn check_header(&mut self, header: FrameHeader) -> Result<(), ProtocolError> {
        if header.payload_len > self.limits.max_frame_payload {
            return Err(ProtocolError::FrameTooLarge {
                size: header.payload_len,
                max: self.limits.max_frame_payload,
            });
        }

        let total = self.partial.payload_len + header.payload_len;
        if total > self.limits.max_packet_size {
            return Err(ProtocolError::PacketTooLarge {
                size: total,
                max: self.limits.max_packet_size,
            });
        }

        let starts_packet = self.partial.frames == 0;
        if !self.accept_seq(header.seq, starts_packet) {
            return Err(ProtocolError::SequenceMismatch {
                expected: self.expected,
                actual: header.seq,
            });
        }

        if starts_packet {
            self.partial.first_seq = header.seq;
        }
        Ok(())
    }

    fn accept_seq(&mut self, seq: u8, starts_packet: bool) -> bool {
        // Replies to pipelined commands each restart at 1. Inside an open
        // reply a 1 is only the sequence wrapping around.
        let reply_start = starts_packet
            && seq == 1
            && self.role == Role::Backend
            && self.phase == Phase::Command
            && !self.outbound_bulk
            && self.reply == ReplyState::Idle;

        if seq == self.expected {
            if reply_start {
                self.open_reply();
            }
            return true;
        }

        if reply_start && !self.queued.is_empty() {
            self.open_reply();
            return true;
        }

        false
    }

    fn open_reply(&mut self) {
        self.reply_command = self.queued.pop_front();
        self.reply = ReplyState::Start;
    }

    /// State after one complete reply packet. `head` holds the first bytes
    /// of its payload.
    fn next_reply_state(
        &self,
        kind: ResponseKind,
        head: &[u8],
        payload_len: usize,
    ) -> ReplyState {
        if kind == ResponseKind::Err {
            return ReplyState::Idle;
        }

        match self.reply {
            ReplyState::Idle | ReplyState::Start => match (self.reply_command, kind) {
                // Rows (or bare column definitions) without a header
                (Some(Command::FieldList | Command::StmtFetch), _) => {
                    self.after_row(head, payload_len)
                }
                (Some(Command::Statistics), _) => ReplyState::Idle,
                (Some(Command::StmtPrepare), ResponseKind::Ok) => self.prepare_metadata(head),
                (_, ResponseKind::Ok) => more_results(ok_status(head)),
                // The server's verdict follows the file
                (_, ResponseKind::LocalInfile) => ReplyState::Start,
                (_, ResponseKind::Eof) => ReplyState::Idle,
                _ => match read_lenenc(head) {
                    Some((columns, _)) if columns > 0 => ReplyState::Columns(columns),
                    _ => ReplyState::Idle,
                },
            },
            ReplyState::Columns(left) if left > 1 => ReplyState::Columns(left - 1),
            ReplyState::Columns(_) if self.deprecate_eof() => ReplyState::Rows,
            ReplyState::Columns(_) => ReplyState::ColumnsEof,
            ReplyState::ColumnsEof => match eof_status(head) {
                // A cursor was opened; rows come with COM_STMT_FETCH
                Some(status) if status & SERVER_STATUS_CURSOR_EXISTS != 0 => ReplyState::Idle,
                _ => ReplyState::Rows,
            },
            ReplyState::Rows => self.after_row(head, payload_len),
            ReplyState::Skip(left) if left > 1 => ReplyState::Skip(left - 1),
            ReplyState::Skip(_) => ReplyState::Idle,
        }
    }

    fn after_row(&self, head: &[u8], payload_len: usize) -> ReplyState {
        if head.first() != Some(&reply::EOF) {
            return ReplyState::Rows;
        }
        if self.deprecate_eof() {
            // The terminating OK reuses the EOF marker; a row starting with
            // 0xFE holds a value of at least 16 MiB
            if payload_len < self.limits.max_frame_payload {
                return more_results(ok_status(head));
            }
        } else if payload_len <= EOF_MAX_PAYLOAD {
            return more_results(eof_status(head));
        }
        ReplyState::Rows
    }

    /// `COM_STMT_PREPARE` answers OK followed by the parameter and column
    /// definitions, each list closed by EOF unless EOFs are deprecated.
    fn prepare_metadata(&self, head: &[u8]) -> ReplyState {
        let field = |at: usize| {
            head.get(at..at + 2)
                .map_or(0, |b| u16::from_le_bytes([b[0], b[1]]) as u64)
        };
        let (columns, params) = (field(5), field(7));
        let mut packets = columns + params;
        if !self.deprecate_eof() {
            packets += (columns > 0) as u64 + (params > 0) as u64;
        }
        if packets == 0 {
            ReplyState::Idle
        } else {
            ReplyState::Skip(packets)
        }
    }

    fn deprecate_eof(&self) -> bool {
        self.capabilities
            .is_some_and(|caps| caps & CLIENT_DEPRECATE_EOF != 0)
    }

    fn emit_bulk(&mut self, buf: &mut Buffer, header: FrameHeader) -> Packet {
        let partial = std::mem::take(&mut self.partial);
        let mut data = buf.split_to(partial.scanned);
        data.set_flag(BufferFlags::COMPLETE_PACKETS | BufferFlags::BULK_DATA);

        let kind = if header.payload_len == 0 {
            self.bulk = false;
            self.expected = 0;
            PacketKind::BulkEnd
        } else {
            PacketKind::BulkData
        };

        Packet {
            data,
            meta: PacketMeta {
                kind,
                seq: header.seq,
                frames: 1,
                payload_len: header.payload_len,
                trx: None,
            },
        }
    }

    fn emit_packet(&mut self, buf: &mut Buffer) -> Result<Packet, ProtocolError> {
        let partial = std::mem::take(&mut self.partial);
        let mut data = buf.split_to(partial.scanned);
        data.set_flag(BufferFlags::COMPLETE_PACKETS);

        let first_byte = if partial.payload_len > 0 {
            data.byte_at(HEADER_LEN)
        } else {
            None
        };

        let kind = match (self.role, self.phase) {
            (Role::Client, Phase::Command) => {
                if partial.payload_len == 0 {
                    return Err(ProtocolError::Malformed("empty command packet"));
                }
                // Keyword scanning only needs the first frame
                let first_frame = partial.payload_len.min(self.limits.max_frame_payload);
                let payload = data
                    .contiguous(HEADER_LEN, first_frame)
                    .ok_or(ProtocolError::Malformed("short command payload"))?;
                let info = classify(&payload);

                if info.session_command {
                    data.set_flag(BufferFlags::SESSION_COMMAND);
                }
                self.last_command = Some(info.command);
                if info.command == Command::ChangeUser {
                    // Re-authentication continues the sequence
                    self.phase = Phase::Handshake;
                } else {
                    self.expected = 0;
                }
                PacketKind::Command(info)
            }
            (Role::Client, Phase::Handshake) => PacketKind::Handshake,
            (Role::Backend, Phase::Handshake) => {
                // The server ends authentication with OK or ERR
                if partial.first_seq > 0
                    && matches!(first_byte, Some(reply::OK) | Some(reply::ERR))
                {
                    self.phase = Phase::Command;
                }
                PacketKind::Handshake
            }
            (Role::Backend, Phase::Command) => {
                let at_start = matches!(self.reply, ReplyState::Idle | ReplyState::Start);
                let mut kind =
                    ResponseKind::classify(first_byte, partial.payload_len, partial.first_seq);
                if kind == ResponseKind::LocalInfile && !at_start {
                    // 0xFB inside a result set is a NULL column
                    kind = ResponseKind::Data;
                }
                if kind == ResponseKind::LocalInfile {
                    self.outbound_bulk = true;
                }

                let mut head = [0u8; 32];
                let visible = partial
                    .payload_len
                    .min(self.limits.max_frame_payload)
                    .min(head.len());
                let copied = data.copy_to(HEADER_LEN, &mut head[..visible]);
                self.reply = self.next_reply_state(kind, &head[..copied], partial.payload_len);
                if self.reply == ReplyState::Idle {
                    self.reply_command = None;
                }
                PacketKind::Response(kind)
            }
        };

        Ok(Packet {
            data,
            meta: PacketMeta {
                kind,
                seq: partial.first_seq,
                frames: partial.frames,
                payload_len: partial.payload_len,
                trx: None,
            },
        })
    }

    /// Observes a buffer the gateway is about to write to this peer.
    ///
    /// Only buffers flagged as complete packets are inspected; anything else
    /// is opaque to the parser.
    pub fn on_outbound(&mut self, packet: &Buffer) {
        if !packet.has_flag(BufferFlags::COMPLETE_PACKETS) {
            return;
        }

        let mut offset = 0;
        let mut continued = false;
        let mut raw = [0u8; HEADER_LEN];
        while packet.copy_to(offset, &mut raw) == HEADER_LEN {
            let Some(header) = FrameHeader::parse(&raw) else {
                break;
            };
            let first = if !continued && header.payload_len > 0 {
                packet.byte_at(offset + HEADER_LEN)
            } else {
                None
            };
            if self.role == Role::Backend
                && self.phase == Phase::Handshake
                && self.capabilities.is_none()
                && !continued
                && header.seq > 0
                && header.payload_len >= 4
            {
                // Handshake response (or SSL request): capabilities first
                let mut caps = [0u8; 4];
                if packet.copy_to(offset + HEADER_LEN, &mut caps) == caps.len() {
                    self.capabilities = Some(u32::from_le_bytes(caps));
                }
            }
            self.observe_outbound(header, first, !continued);
            continued = header.payload_len == self.limits.max_frame_payload;
            offset += HEADER_LEN + header.payload_len;
        }
    }

    fn observe_outbound(&mut self, header: FrameHeader, first: Option<u8>, starts_packet: bool) {
        match (self.role, self.phase) {
            (role, Phase::Handshake) => {
                self.expected = header.seq.wrapping_add(1);
                // The client's authentication ends when we forward the
                // server's verdict
                if role == Role::Client
                    && starts_packet
                    && header.seq > 0
                    && matches!(first, Some(reply::OK) | Some(reply::ERR))
                {
                    self.phase = Phase::Command;
                    self.expected = 0;
                }
            }
            (Role::Client, Phase::Command) => {
                if starts_packet
                    && header.seq == 1
                    && first == Some(reply::LOCAL_INFILE)
                    && self.last_command == Some(Command::Query)
                    && !self.bulk
                {
                    self.enter_bulk_load();
                }
            }
            (Role::Backend, Phase::Command) => {
                if self.outbound_bulk {
                    self.expected = header.seq.wrapping_add(1);
                    if header.payload_len == 0 {
                        self.outbound_bulk = false;
                    }
                } else if starts_packet && header.seq == 0 {
                    match first.map(Command::from_byte) {
                        Some(Command::ChangeUser) => {
                            self.phase = Phase::Handshake;
                            self.expected = 1;
                        }
                        Some(command) if command.expects_response() => {
                            self.queued.push_back(command);
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    /// Switches a client stream into bulk-load pass-through.
    ///
    /// The file transfer follows the server's sequence-1 request, so the
    /// first data frame carries sequence 2.
    pub fn enter_bulk_load(&mut self) {
        self.bulk = true;
        self.phase = Phase::Command;
        self.expected = 2;
    }

    /// Leaves bulk-load mode without waiting for the terminating empty frame.
    ///
    /// Leaving with a frame half received desynchronizes the stream; the next
    /// [`PacketParser::feed`] reports it.
    pub fn exit_bulk_load(&mut self) {
        if !self.bulk {
            return;
        }
        self.bulk = false;
        if let Some(header) = self.partial.header {
            self.deferred_error = Some(ProtocolError::BulkDesync {
                pending: header.payload_len,
            });
        } else {
            self.expected = 0;
        }
    }

    /// Moves the stream to `phase`, e.g. when the gateway authenticates the
    /// peer itself.
    pub fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
        self.reset();
    }

    /// Drops partial state; the next frame starts a new top-level exchange.
    pub fn reset(&mut self) {
        self.partial = Partial::default();
        self.need = 0;
        self.bulk = false;
        self.outbound_bulk = false;
        self.queued.clear();
        self.reply = ReplyState::Idle;
        self.reply_command = None;
        self.expected = match (self.role, self.phase) {
            (Role::Client, Phase::Command) => 0,
            (Role::Client, Phase::Handshake) => 1,
            (Role::Backend, Phase::Command) => 1,
            (Role::Backend, Phase::Handshake) => 0,
        };
    }
}

/// Ends the reply unless the server announced another result set.
fn more_results(status: Option<u16>) -> ReplyState {
    match status {
        Some(status) if status & SERVER_MORE_RESULTS_EXIST != 0 => ReplyState::Start,
        _ => ReplyState::Idle,
    }
}

/// Status flags of an EOF packet: marker, warnings, status.
fn eof_status(head: &[u8]) -> Option<u16> {
    head.get(3..5).map(|b| u16::from_le_bytes([b[0], b[1]]))
}

/// Status flags of an OK packet: marker, affected rows, insert id, status.
fn ok_status(head: &[u8]) -> Option<u16> {
    let mut at = 1;
    for _ in 0..2 {
        let (_, width) = read_lenenc(head.get(at..)?)?;
        at += width;
    }
    head.get(at..at + 2).map(|b| u16::from_le_bytes([b[0], b[1]]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::{command_packet, encode_packet, ok_packet};

    fn client(max_frame: usize) -> PacketParser {
        let mut parser = PacketParser::new(
            Role::Client,
            ParserLimits {
                max_frame_payload: max_frame,
                max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            },
        );
        parser.set_phase(Phase::Command);
        parser
    }

    fn query(sql: &str) -> Buffer {
        command_packet(Command::Query, sql.as_bytes())
    }

    fn stream(parts: &[Buffer]) -> Vec<u8> {
        parts.iter().flat_map(|b| b.to_vec()).collect()
    }

    fn feed_chunked(parser: &mut PacketParser, bytes: &[u8], chunk: usize) -> Vec<Packet> {
        let mut buf = Buffer::new();
        let mut packets = Vec::new();
        for piece in bytes.chunks(chunk) {
            buf.append(piece.to_vec());
            let feed = parser.feed(&mut buf);
            assert!(feed.error.is_none(), "{:?}", feed.error);
            packets.extend(feed.packets);
        }
        assert!(buf.is_empty());
        packets
    }

    #[test]
    fn test_single_command() {
        let mut parser = client(MAX_FRAME_PAYLOAD);
        let mut buf = query("SELECT 1");
        let feed = parser.feed(&mut buf);

        assert!(feed.error.is_none());
        assert_eq!(feed.packets.len(), 1);
        let packet = &feed.packets[0];
        assert_eq!(packet.data.to_vec(), b"\x09\x00\x00\x00\x03SELECT 1".to_vec());
        assert_eq!(packet.meta.seq, 0);
        assert_eq!(packet.meta.frames, 1);
        assert_eq!(packet.meta.payload_len, 9);
        assert_eq!(packet.meta.command().map(|c| c.command), Some(Command::Query));
        assert!(packet.data.has_flag(BufferFlags::COMPLETE_PACKETS));
    }

    #[test]
    fn test_incomplete_header_and_payload() {
        let mut parser = client(MAX_FRAME_PAYLOAD);
        let bytes = query("SELECT 1").to_vec();

        let mut buf = Buffer::copy_from_slice(&bytes[..3]);
        assert!(parser.feed(&mut buf).packets.is_empty());
        assert_eq!(parser.bytes_needed(), HEADER_LEN);

        buf.append(bytes[3..6].to_vec());
        assert!(parser.feed(&mut buf).packets.is_empty());
        assert_eq!(parser.bytes_needed(), bytes.len());

        buf.append(bytes[6..].to_vec());
        let feed = parser.feed(&mut buf);
        assert_eq!(feed.packets.len(), 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_framing_idempotence() {
        let long = format!("\x03SELECT '{}'", "x".repeat(40));
        let parts = vec![
            query("SELECT 1"),
            command_packet(Command::Ping, b""),
            encode_packet(0, long.as_bytes(), 16),
            command_packet(Command::InitDb, b"shop"),
            query("SET autocommit=0"),
        ];
        let bytes = stream(&parts);

        let whole = feed_chunked(&mut client(16), &bytes, bytes.len());
        assert_eq!(whole.len(), parts.len());

        for chunk in [1, 2, 3, 4, 5, 7, 13, 16, 17, 64] {
            let pieces = feed_chunked(&mut client(16), &bytes, chunk);
            assert_eq!(pieces.len(), whole.len(), "chunk size {}", chunk);
            for (a, b) in whole.iter().zip(pieces.iter()) {
                assert_eq!(a.data.to_vec(), b.data.to_vec(), "chunk size {}", chunk);
                assert_eq!(a.meta, b.meta, "chunk size {}", chunk);
            }
        }
    }

    #[test]
    fn test_multi_frame_reconstruction() {
        let max = 8;
        for (k, r) in [(1usize, 3usize), (2, 1), (3, 7)] {
            let mut payload = vec![0x03];
            payload.resize(k * max + r, b'a');
            let bytes = encode_packet(0, &payload, max).to_vec();

            let mut parser = client(max);
            let packets = feed_chunked(&mut parser, &bytes, 5);
            assert_eq!(packets.len(), 1);

            let meta = &packets[0].meta;
            assert_eq!(meta.payload_len, payload.len());
            assert_eq!(meta.frames as usize, k + 1);
            assert_eq!(meta.seq, 0);
            assert_eq!(meta.last_seq() as usize, k);

            // Frame headers carry consecutive sequence numbers
            let data = packets[0].data.to_vec();
            for frame in 0..=k {
                assert_eq!(data[frame * (max + HEADER_LEN) + 3] as usize, frame);
            }
        }
    }

    #[test]
    fn test_exact_multiple_needs_empty_frame() {
        let max = 8;
        let mut payload = vec![0x03];
        payload.resize(2 * max, b'b');
        let bytes = encode_packet(0, &payload, max).to_vec();

        let mut parser = client(max);
        let mut buf = Buffer::copy_from_slice(&bytes[..bytes.len() - HEADER_LEN]);
        assert!(parser.feed(&mut buf).packets.is_empty());

        buf.append(bytes[bytes.len() - HEADER_LEN..].to_vec());
        let feed = parser.feed(&mut buf);
        assert_eq!(feed.packets.len(), 1);
        assert_eq!(feed.packets[0].meta.frames, 3);
        assert_eq!(feed.packets[0].meta.payload_len, 16);
    }

    #[test]
    fn test_sequence_mismatch_stops_emission() {
        let mut parser = client(MAX_FRAME_PAYLOAD);
        let mut bad = encode_packet(5, b"\x03SELECT 2", MAX_FRAME_PAYLOAD);
        bad.clear_flag(BufferFlags::COMPLETE_PACKETS);
        let bytes = stream(&[query("SELECT 1"), bad, query("SELECT 3")]);

        let mut buf = Buffer::from(bytes);
        let feed = parser.feed(&mut buf);
        assert_eq!(feed.packets.len(), 1);
        assert_eq!(
            feed.error,
            Some(ProtocolError::SequenceMismatch {
                expected: 0,
                actual: 5
            })
        );
        assert!(parser.is_poisoned());

        let again = parser.feed(&mut buf);
        assert!(again.packets.is_empty());
        assert_eq!(again.error, Some(ProtocolError::Poisoned));
    }

    #[test]
    fn test_frame_and_packet_limits() {
        let mut parser = client(8);
        let mut buf = Buffer::copy_from_slice(&[9, 0, 0, 0]);
        assert_eq!(
            parser.feed(&mut buf).error,
            Some(ProtocolError::FrameTooLarge { size: 9, max: 8 })
        );

        let mut parser = PacketParser::new(
            Role::Client,
            ParserLimits {
                max_frame_payload: 8,
                max_packet_size: 12,
            },
        );
        parser.set_phase(Phase::Command);
        let mut payload = vec![0x03];
        payload.resize(20, b'c');
        let mut buf = encode_packet(0, &payload, 8);
        let feed = parser.feed(&mut buf);
        assert!(feed.packets.is_empty());
        assert_eq!(
            feed.error,
            Some(ProtocolError::PacketTooLarge { size: 16, max: 12 })
        );
    }

    #[test]
    fn test_empty_command_is_malformed() {
        let mut parser = client(MAX_FRAME_PAYLOAD);
        let mut buf = Buffer::copy_from_slice(&[0, 0, 0, 0]);
        assert!(matches!(
            parser.feed(&mut buf).error,
            Some(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_bulk_load_pass_through() {
        let mut parser = client(MAX_FRAME_PAYLOAD);

        let mut buf = query("LOAD DATA LOCAL INFILE 'f.csv' INTO TABLE t");
        let feed = parser.feed(&mut buf);
        assert!(feed.packets[0].meta.command().is_some_and(|c| c.bulk_load));

        // Server asks for the file
        parser.on_outbound(&encode_packet(1, b"\xfbf.csv", MAX_FRAME_PAYLOAD));
        assert!(parser.in_bulk_load());

        // Data that looks like a command must not be classified
        let bytes = stream(&[
            encode_packet(2, b"1,2\n", MAX_FRAME_PAYLOAD),
            encode_packet(3, b"\x03SELECT", MAX_FRAME_PAYLOAD),
            encode_packet(4, b"", MAX_FRAME_PAYLOAD),
            command_packet(Command::Ping, b""),
        ]);
        let packets = feed_chunked(&mut parser, &bytes, 3);
        let kinds: Vec<_> = packets.iter().map(|p| p.meta.kind.clone()).collect();
        assert_eq!(kinds[0], PacketKind::BulkData);
        assert_eq!(kinds[1], PacketKind::BulkData);
        assert_eq!(kinds[2], PacketKind::BulkEnd);
        assert!(packets[1].data.has_flag(BufferFlags::BULK_DATA));
        assert_eq!(
            packets[3].meta.command().map(|c| c.command),
            Some(Command::Ping)
        );
        assert!(!parser.in_bulk_load());
    }

    #[test]
    fn test_forced_bulk_exit_mid_frame_desyncs() {
        let mut parser = client(MAX_FRAME_PAYLOAD);
        parser.enter_bulk_load();

        let bytes = encode_packet(2, b"abcdef", MAX_FRAME_PAYLOAD).to_vec();
        let mut buf = Buffer::copy_from_slice(&bytes[..6]);
        assert!(parser.feed(&mut buf).packets.is_empty());

        parser.exit_bulk_load();
        buf.append(bytes[6..].to_vec());
        assert_eq!(
            parser.feed(&mut buf).error,
            Some(ProtocolError::BulkDesync { pending: 6 })
        );
    }

    #[test]
    fn test_client_handshake_then_commands() {
        let mut parser = PacketParser::with_defaults(Role::Client);

        // Greeting forwarded to the client
        parser.on_outbound(&encode_packet(0, b"\x0a5.7.0\0", MAX_FRAME_PAYLOAD));
        let mut buf = encode_packet(1, b"auth-response", MAX_FRAME_PAYLOAD);
        let feed = parser.feed(&mut buf);
        assert_eq!(feed.packets[0].meta.kind, PacketKind::Handshake);
        assert_eq!(parser.phase(), Phase::Handshake);

        // Auth switch round trip, then OK
        parser.on_outbound(&encode_packet(2, b"\xfemysql_native_password\0", MAX_FRAME_PAYLOAD));
        let mut buf = encode_packet(3, b"scramble", MAX_FRAME_PAYLOAD);
        assert!(parser.feed(&mut buf).error.is_none());
        parser.on_outbound(&ok_packet(4));
        assert_eq!(parser.phase(), Phase::Command);

        let mut buf = query("SELECT 1");
        let feed = parser.feed(&mut buf);
        assert!(feed.error.is_none());
        assert!(feed.packets[0].meta.command().is_some());
    }

    #[test]
    fn test_change_user_reenters_handshake() {
        let mut parser = client(MAX_FRAME_PAYLOAD);
        let mut buf = command_packet(Command::ChangeUser, b"bob\0");
        parser.feed(&mut buf);
        assert_eq!(parser.phase(), Phase::Handshake);
        assert_eq!(parser.expected_seq(), 1);

        parser.on_outbound(&encode_packet(1, b"\xfemysql_native_password\0", MAX_FRAME_PAYLOAD));
        let mut buf = encode_packet(2, b"scramble", MAX_FRAME_PAYLOAD);
        assert!(parser.feed(&mut buf).error.is_none());
        parser.on_outbound(&ok_packet(3));
        assert_eq!(parser.phase(), Phase::Command);
        assert_eq!(parser.expected_seq(), 0);
    }

    #[test]
    fn test_backend_handshake_and_replies() {
        let mut parser = PacketParser::with_defaults(Role::Backend);

        let mut buf = encode_packet(0, b"\x0a8.0.0\0", MAX_FRAME_PAYLOAD);
        assert_eq!(parser.feed(&mut buf).packets[0].meta.kind, PacketKind::Handshake);

        parser.on_outbound(&encode_packet(1, b"auth-response", MAX_FRAME_PAYLOAD));
        let mut buf = ok_packet(2);
        assert_eq!(parser.feed(&mut buf).packets[0].meta.kind, PacketKind::Handshake);
        assert_eq!(parser.phase(), Phase::Command);

        // Two pipelined commands; each reply restarts at 1
        parser.on_outbound(&query("SELECT 1"));
        parser.on_outbound(&command_packet(Command::Ping, b""));
        let bytes = stream(&[
            encode_packet(1, b"\x01", MAX_FRAME_PAYLOAD),
            encode_packet(2, b"\x03def-column", MAX_FRAME_PAYLOAD),
            encode_packet(3, b"\xfe\0\0\x02\0", MAX_FRAME_PAYLOAD),
            encode_packet(4, b"\x011", MAX_FRAME_PAYLOAD),
            encode_packet(5, b"\xfe\0\0\x02\0", MAX_FRAME_PAYLOAD),
            ok_packet(1),
        ]);
        let packets = feed_chunked(&mut parser, &bytes, 7);
        let kinds: Vec<_> = packets.iter().filter_map(|p| p.meta.response()).collect();
        assert_eq!(
            kinds,
            vec![
                ResponseKind::Data,
                ResponseKind::Data,
                ResponseKind::Eof,
                ResponseKind::Data,
                ResponseKind::Eof,
                ResponseKind::Ok,
            ]
        );

        // No command outstanding: a reply restarting at 1 is a desync
        let mut buf = ok_packet(1);
        assert!(matches!(
            parser.feed(&mut buf).error,
            Some(ProtocolError::SequenceMismatch { .. })
        ));
    }

    #[test]
    fn test_backend_local_infile_sequence() {
        let mut parser = PacketParser::with_defaults(Role::Backend);
        parser.set_phase(Phase::Command);

        parser.on_outbound(&query("LOAD DATA LOCAL INFILE 'f' INTO TABLE t"));
        let mut buf = encode_packet(1, b"\xfbf", MAX_FRAME_PAYLOAD);
        let feed = parser.feed(&mut buf);
        assert_eq!(feed.packets[0].meta.response(), Some(ResponseKind::LocalInfile));

        // The client's data frames are forwarded with their own sequence
        parser.on_outbound(&encode_packet(2, b"\x11not-a-change-user", MAX_FRAME_PAYLOAD));
        parser.on_outbound(&encode_packet(3, b"", MAX_FRAME_PAYLOAD));
        assert_eq!(parser.phase(), Phase::Command);

        let mut buf = ok_packet(4);
        let feed = parser.feed(&mut buf);
        assert!(feed.error.is_none());
        assert_eq!(feed.packets[0].meta.response(), Some(ResponseKind::Ok));
    }

    /// One-column result set with `rows` rows of a single NULL, starting at
    /// `seq`. Returns the stream and the number of packets in it.
    fn result_set(seq: u8, rows: usize, last_status: u16) -> (Vec<u8>, usize) {
        let status = last_status.to_le_bytes();
        let mut payloads: Vec<Vec<u8>> = vec![
            b"\x01".to_vec(),
            b"\x03def\x01t\x01t\x01a\x01a".to_vec(),
            b"\xfe\0\0\x02\0".to_vec(),
        ];
        payloads.extend(std::iter::repeat(b"\xfb".to_vec()).take(rows));
        payloads.push(vec![0xfe, 0, 0, status[0], status[1]]);

        let mut seq = seq;
        let mut parts = Vec::new();
        for payload in &payloads {
            parts.push(encode_packet(seq, payload, MAX_FRAME_PAYLOAD));
            seq = seq.wrapping_add(1);
        }
        (stream(&parts), payloads.len())
    }

    fn backend_in_command() -> PacketParser {
        let mut parser = PacketParser::with_defaults(Role::Backend);
        parser.set_phase(Phase::Command);
        parser
    }

    #[test]
    fn test_long_result_set_wraps_inside_reply() {
        let mut parser = backend_in_command();
        parser.on_outbound(&query("SELECT a FROM big"));
        parser.on_outbound(&query("SELECT 1"));
        assert_eq!(parser.pending_replies(), 2);

        // 300 packets: the sequence runs 1..=255, 0, 1, ... 44
        let (bytes, count) = result_set(1, 296, 0x0002);
        assert_eq!(count, 300);
        let packets = feed_chunked(&mut parser, &bytes, 4096);
        assert_eq!(packets.len(), 300);
        assert!(packets
            .iter()
            .all(|p| p.meta.response() != Some(ResponseKind::LocalInfile)));
        assert!(!parser.in_reply());
        assert_eq!(parser.pending_replies(), 1);
        assert_eq!(parser.expected_seq(), 45);

        // The second pipelined reply restarts at 1
        let (bytes, count) = result_set(1, 0, 0x0002);
        let packets = feed_chunked(&mut parser, &bytes, 4096);
        assert_eq!(packets.len(), count);
        assert_eq!(parser.pending_replies(), 0);
        assert!(!parser.in_reply());
    }

    #[test]
    fn test_sequence_one_inside_reply_is_rejected() {
        let mut parser = backend_in_command();
        parser.on_outbound(&query("SELECT a FROM t"));
        parser.on_outbound(&query("SELECT 1"));

        // Column count and definition, then a packet restarting at 1
        let bytes = stream(&[
            encode_packet(1, b"\x01", MAX_FRAME_PAYLOAD),
            encode_packet(2, b"\x03def", MAX_FRAME_PAYLOAD),
            ok_packet(1),
        ]);
        let mut buf = Buffer::from(bytes);
        let feed = parser.feed(&mut buf);
        assert_eq!(feed.packets.len(), 2);
        assert_eq!(
            feed.error,
            Some(ProtocolError::SequenceMismatch {
                expected: 3,
                actual: 1
            })
        );
    }

    #[test]
    fn test_multiple_result_sets_stay_in_one_reply() {
        let mut parser = backend_in_command();
        parser.on_outbound(&query("CALL p()"));
        parser.on_outbound(&command_packet(Command::Ping, b""));

        // More results follow the first set, then the final OK
        let (first, count) = result_set(1, 2, 0x000A);
        let packets = feed_chunked(&mut parser, &first, 5);
        assert_eq!(packets.len(), count);
        assert!(parser.in_reply());

        let mut buf = ok_packet(count as u8 + 1);
        assert!(parser.feed(&mut buf).error.is_none());
        assert!(!parser.in_reply());

        let mut buf = ok_packet(1);
        let feed = parser.feed(&mut buf);
        assert!(feed.error.is_none());
        assert_eq!(parser.pending_replies(), 0);
    }

    #[test]
    fn test_prepare_reply_metadata() {
        let mut parser = backend_in_command();
        parser.on_outbound(&command_packet(Command::StmtPrepare, b"SELECT ? FROM t"));
        parser.on_outbound(&command_packet(Command::Ping, b""));

        // OK: statement id, one column, one parameter
        let bytes = stream(&[
            encode_packet(1, &[0, 1, 0, 0, 0, 1, 0, 1, 0, 0, 0, 0], MAX_FRAME_PAYLOAD),
            encode_packet(2, b"\x03def-param", MAX_FRAME_PAYLOAD),
            encode_packet(3, b"\xfe\0\0\x02\0", MAX_FRAME_PAYLOAD),
            encode_packet(4, b"\x03def-column", MAX_FRAME_PAYLOAD),
            encode_packet(5, b"\xfe\0\0\x02\0", MAX_FRAME_PAYLOAD),
        ]);
        let packets = feed_chunked(&mut parser, &bytes, 6);
        assert_eq!(packets.len(), 5);
        assert!(!parser.in_reply());

        let mut buf = ok_packet(1);
        assert!(parser.feed(&mut buf).error.is_none());
    }

    #[test]
    fn test_deprecated_eof_ends_rows_with_ok() {
        let mut parser = PacketParser::with_defaults(Role::Backend);
        let mut buf = encode_packet(0, b"\x0a8.0.0\0", MAX_FRAME_PAYLOAD);
        assert!(parser.feed(&mut buf).error.is_none());

        let mut response = CLIENT_DEPRECATE_EOF.to_le_bytes().to_vec();
        response.extend_from_slice(b"user\0");
        parser.on_outbound(&encode_packet(1, &response, MAX_FRAME_PAYLOAD));
        let mut buf = ok_packet(2);
        parser.feed(&mut buf);
        assert_eq!(parser.phase(), Phase::Command);

        parser.on_outbound(&query("SELECT a FROM t"));
        parser.on_outbound(&query("SELECT 1"));
        let bytes = stream(&[
            encode_packet(1, b"\x01", MAX_FRAME_PAYLOAD),
            encode_packet(2, b"\x03def", MAX_FRAME_PAYLOAD),
            encode_packet(3, b"\x011", MAX_FRAME_PAYLOAD),
            // OK with the EOF marker: no rows affected, autocommit, info text
            encode_packet(4, b"\xfe\0\0\x02\0\0\0done", MAX_FRAME_PAYLOAD),
        ]);
        let packets = feed_chunked(&mut parser, &bytes, 3);
        assert_eq!(packets.len(), 4);
        assert!(!parser.in_reply());

        let mut buf = ok_packet(1);
        assert!(parser.feed(&mut buf).error.is_none());
    }

    #[test]
    fn test_session_command_flag() {
        let mut parser = client(MAX_FRAME_PAYLOAD);
        let mut buf = query("SET NAMES utf8mb4");
        let feed = parser.feed(&mut buf);
        assert!(feed.packets[0].data.has_flag(BufferFlags::SESSION_COMMAND));
    }
}
