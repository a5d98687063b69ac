//! Descriptor Control Block
//!
//! A `Descriptor` is one end of a proxied connection: the socket, the read
//! buffer and packet parser for inbound bytes, the queue of buffers waiting
//! to be written, the lifecycle state, and the role-specific handler.
//!
//! ## Lifecycle
//!
//! ```text
//!   backend:  CONNECTING ──> AUTHENTICATING ──> ACTIVE ──> DRAINING ──> CLOSED
//!   client:                  AUTHENTICATING ──> ACTIVE ──> DRAINING ──> CLOSED
//!                                 │                │          │
//!   backend only:                 └────────> RECONNECTING <───┘
//!                                                │
//!                                                └──> CONNECTING (new socket)
//! ```
//!
//! Any state can fail straight to CLOSED. A descriptor never changes worker;
//! every method here runs on the owning worker's thread. Time is passed in as
//! heartbeat ticks so timeouts are testable without a running clock.

use crate::buffer::Buffer;
use crate::clock;
use crate::config::CoreConfig;
use crate::descriptor::handler::{BackendTarget, Handler};
use crate::descriptor::socket::Socket;
use crate::error::{CloseReason, CoreError};
use crate::protocol::{Packet, PacketParser, ParserLimits, Role};
use crate::session::SessionId;
use bytes::BytesMut;
use mio::{Interest, Registry, Token};
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, IoSlice, Read, Write};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, trace};

/// Most slices handed to one vectored write.
const MAX_IOV: usize = 64;

/// Stable handle to a descriptor.
///
/// `index` is the slot in the owning worker's arena; `generation` changes
/// every time the slot is reused, so a stale id never reaches a new
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescriptorId {
    worker: usize,
    index: u32,
    generation: u32,
}

impl DescriptorId {
    pub(crate) fn new(worker: usize, index: u32, generation: u32) -> Self {
        Self {
            worker,
            index,
            generation,
        }
    }

    /// Worker that owns the descriptor for its whole life.
    pub fn worker(&self) -> usize {
        self.worker
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for DescriptorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}/{}.{}", self.worker, self.index, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorState {
    Connecting,
    Authenticating,
    Active,
    Draining,
    Reconnecting,
    Closed,
}

impl DescriptorState {
    pub fn can_transition_to(self, next: DescriptorState) -> bool {
        use DescriptorState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Connecting, Authenticating | Active | Draining | Reconnecting) => true,
            (Authenticating, Active | Draining | Reconnecting) => true,
            (Active, Draining | Reconnecting | Authenticating) => true,
            (Draining, Reconnecting) => true,
            (Reconnecting, Connecting) => true,
            _ => false,
        }
    }

    /// True while the socket is connected and readable.
    pub fn is_open(self) -> bool {
        matches!(
            self,
            DescriptorState::Authenticating | DescriptorState::Active
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DescriptorState::Connecting => "CONNECTING",
            DescriptorState::Authenticating => "AUTHENTICATING",
            DescriptorState::Active => "ACTIVE",
            DescriptorState::Draining => "DRAINING",
            DescriptorState::Reconnecting => "RECONNECTING",
            DescriptorState::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for DescriptorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-descriptor limits taken from the core configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorLimits {
    pub read_chunk_size: usize,
    pub max_read_per_call: usize,
    pub drain_ticks: u64,
    pub connect_ticks: u64,
    pub parser: ParserLimits,
}

impl DescriptorLimits {
    pub fn from_config(config: &CoreConfig) -> Self {
        Self {
            read_chunk_size: config.read_chunk_size,
            max_read_per_call: config.max_read_per_call,
            drain_ticks: clock::ticks_for(config.drain_timeout()).max(1),
            connect_ticks: clock::ticks_for(config.connect_timeout()).max(1),
            parser: config.parser_limits(),
        }
    }
}

impl Default for DescriptorLimits {
    fn default() -> Self {
        Self::from_config(&CoreConfig::default())
    }
}

/// Result of one `on_readable` call.
#[derive(Debug, Default)]
pub struct ReadOutcome {
    /// Complete packets in byte-stream order
    pub packets: Vec<Packet>,
    /// Fatal condition found after the packets
    pub error: Option<CloseReason>,
    /// The per-call cap was hit; more bytes may be waiting
    pub more: bool,
    pub bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    /// Write queue is empty
    Idle,
    /// The socket stopped accepting bytes; wait for writability
    Pending,
    /// A draining descriptor flushed its last byte and can be closed
    Drained,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseProgress {
    Closed,
    Draining,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeoutEvent {
    /// The drain deadline passed; queued buffers were dropped
    DrainExpired { discarded: usize },
    ConnectTimedOut,
    ReconnectDue,
}

/// One connection owned by a worker.
pub struct Descriptor {
    id: DescriptorId,
    socket: Box<dyn Socket>,
    state: DescriptorState,
    handler: Handler,
    parser: PacketParser,
    read_buf: Buffer,
    scratch: BytesMut,
    write_queue: VecDeque<Buffer>,
    queued_bytes: usize,
    registered: Option<Interest>,
    drain_deadline: Option<u64>,
    connect_deadline: Option<u64>,
    session: Option<SessionId>,
    peer: Option<SocketAddr>,
    limits: DescriptorLimits,
    bytes_read: u64,
    bytes_written: u64,
    close_reason: Option<CloseReason>,
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("id", &self.id)
            .field("role", &self.role())
            .field("state", &self.state)
            .field("queued_buffers", &self.write_queue.len())
            .field("queued_bytes", &self.queued_bytes)
            .field("session", &self.session)
            .finish()
    }
}

impl Descriptor {
    /// A client connection that was just accepted.
    pub fn new_client(id: DescriptorId, socket: Box<dyn Socket>, limits: DescriptorLimits) -> Self {
        let peer = socket.peer_addr().ok();
        Self::build(
            id,
            socket,
            Handler::client(),
            Role::Client,
            DescriptorState::Authenticating,
            peer,
            limits,
        )
    }

    /// A backend connection whose non-blocking connect is in progress.
    pub fn new_backend(
        id: DescriptorId,
        socket: Box<dyn Socket>,
        target: BackendTarget,
        limits: DescriptorLimits,
        now: u64,
    ) -> Self {
        let peer = Some(target.address);
        let mut desc = Self::build(
            id,
            socket,
            Handler::backend(target),
            Role::Backend,
            DescriptorState::Connecting,
            peer,
            limits,
        );
        desc.connect_deadline = Some(now + limits.connect_ticks);
        desc
    }

    fn build(
        id: DescriptorId,
        socket: Box<dyn Socket>,
        handler: Handler,
        role: Role,
        state: DescriptorState,
        peer: Option<SocketAddr>,
        limits: DescriptorLimits,
    ) -> Self {
        Self {
            id,
            socket,
            state,
            handler,
            parser: PacketParser::new(role, limits.parser),
            read_buf: Buffer::new(),
            scratch: BytesMut::new(),
            write_queue: VecDeque::new(),
            queued_bytes: 0,
            registered: None,
            drain_deadline: None,
            connect_deadline: None,
            session: None,
            peer,
            limits,
            bytes_read: 0,
            bytes_written: 0,
            close_reason: None,
        }
    }

    pub fn id(&self) -> DescriptorId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.handler.role()
    }

    pub fn state(&self) -> DescriptorState {
        self.state
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut Handler {
        &mut self.handler
    }

    pub fn parser(&self) -> &PacketParser {
        &self.parser
    }

    pub fn parser_mut(&mut self) -> &mut PacketParser {
        &mut self.parser
    }

    /// Non-owning back-reference to the session using this descriptor.
    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    pub fn set_session(&mut self, session: Option<SessionId>) {
        self.session = session;
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn queued_buffers(&self) -> usize {
        self.write_queue.len()
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn is_closed(&self) -> bool {
        self.state == DescriptorState::Closed
    }

    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.close_reason.as_ref()
    }

    pub fn drain_deadline(&self) -> Option<u64> {
        self.drain_deadline
    }

    fn transition(&mut self, next: DescriptorState) -> Result<(), CoreError> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        trace!(descriptor = %self.id, from = %self.state, to = %next, "State change");
        self.state = next;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Interest matching the current state: writability only while there is
    /// something to write or a connect to complete.
    pub fn desired_interest(&self) -> Interest {
        if self.state == DescriptorState::Connecting || !self.write_queue.is_empty() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    pub fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        let interest = self.desired_interest();
        self.socket.register(registry, token, interest)?;
        self.registered = Some(interest);
        Ok(())
    }

    /// Re-registers only when the desired interest changed.
    pub fn sync_interest(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        let interest = self.desired_interest();
        match self.registered {
            Some(current) if current == interest => Ok(()),
            Some(_) => {
                self.socket.reregister(registry, token, interest)?;
                self.registered = Some(interest);
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn deregister(&mut self, registry: &Registry) {
        if self.registered.take().is_some() {
            if let Err(e) = self.socket.deregister(registry) {
                debug!(descriptor = %self.id, error = %e, "Deregister failed");
            }
        }
    }

    /// Deregisters and shuts the socket down; the descriptor is finished.
    pub fn release(&mut self, registry: &Registry) {
        self.deregister(registry);
        if let Err(e) = self.socket.shutdown() {
            debug!(descriptor = %self.id, error = %e, "Shutdown failed");
        }
    }

    // ------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------

    /// Reads what the socket has (up to the per-call cap) and parses it.
    pub fn on_readable(&mut self) -> ReadOutcome {
        let mut outcome = ReadOutcome::default();
        if !self.state.is_open() {
            return outcome;
        }

        let mut io_error = None;
        loop {
            if outcome.bytes >= self.limits.max_read_per_call {
                outcome.more = true;
                break;
            }

            // Reads fill what is left of the scratch after earlier splits;
            // memory is only zeroed when it runs out
            if self.scratch.is_empty() {
                self.scratch.resize(self.limits.read_chunk_size, 0);
            }
            let want = self
                .scratch
                .len()
                .min(self.limits.max_read_per_call - outcome.bytes);

            match self.socket.read(&mut self.scratch[..want]) {
                Ok(0) => {
                    io_error = Some(CloseReason::PeerClosed);
                    break;
                }
                Ok(n) => {
                    let chunk = self.scratch.split_to(n).freeze();
                    self.read_buf.append(chunk);
                    outcome.bytes += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    io_error = Some(CloseReason::from(e));
                    break;
                }
            }
        }

        self.bytes_read += outcome.bytes as u64;
        if outcome.bytes > 0 {
            trace!(descriptor = %self.id, bytes = outcome.bytes, "Read data");
        }

        let feed = self.parser.feed(&mut self.read_buf);
        outcome.packets = feed.packets;
        self.handler.on_packets(&mut outcome.packets);

        // Corruption is reported ahead of a later network failure
        outcome.error = feed.error.map(CloseReason::Protocol).or(io_error);
        if outcome.error.is_some() {
            outcome.more = false;
        }
        outcome
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    /// Completes a non-blocking connect.
    ///
    /// Returns `Ok(true)` once connected (state AUTHENTICATING), `Ok(false)`
    /// on a spurious wakeup.
    pub fn finish_connect(&mut self) -> Result<bool, CloseReason> {
        if self.state != DescriptorState::Connecting {
            return Ok(true);
        }
        if let Some(err) = self.socket.take_error().map_err(CloseReason::from)? {
            return Err(CloseReason::from(err));
        }
        match self.socket.peer_addr() {
            Ok(addr) => {
                self.peer = Some(addr);
                self.connect_deadline = None;
                self.state = DescriptorState::Authenticating;
                debug!(descriptor = %self.id, backend = %addr, "Backend connected");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(CloseReason::from(e)),
        }
    }

    /// Writable readiness: flush the queue.
    pub fn on_writable(&mut self) -> Result<FlushStatus, CloseReason> {
        self.flush()
    }

    /// Queues `buf` for writing.
    ///
    /// Nothing new is accepted once the descriptor is draining or closed.
    pub fn enqueue(&mut self, buf: Buffer) -> Result<(), CoreError> {
        match self.state {
            DescriptorState::Draining | DescriptorState::Closed => {
                return Err(CoreError::Closed(self.id))
            }
            _ => {}
        }
        if buf.is_empty() {
            return Ok(());
        }
        self.parser.on_outbound(&buf);
        self.queued_bytes += buf.len();
        self.write_queue.push_back(buf);
        Ok(())
    }

    /// True when writes can reach the peer.
    pub fn can_flush(&self) -> bool {
        matches!(
            self.state,
            DescriptorState::Authenticating | DescriptorState::Active | DescriptorState::Draining
        )
    }

    /// Writes as much of the queue as the socket accepts.
    pub fn flush(&mut self) -> Result<FlushStatus, CloseReason> {
        if !self.can_flush() {
            return Ok(FlushStatus::Pending);
        }

        while !self.write_queue.is_empty() {
            let result = {
                let mut slices = [IoSlice::new(&[]); MAX_IOV];
                let mut n = 0;
                for buf in self.write_queue.iter() {
                    if n == MAX_IOV {
                        break;
                    }
                    n += buf.io_slices(&mut slices[n..]);
                }
                self.socket.write_vectored(&slices[..n])
            };

            match result {
                Ok(0) => {
                    return Err(CloseReason::from(io::Error::from(io::ErrorKind::WriteZero)));
                }
                Ok(written) => self.advance(written),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(FlushStatus::Pending);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(CloseReason::from(e)),
            }
        }

        if self.state == DescriptorState::Draining {
            self.drain_deadline = None;
            self.state = DescriptorState::Closed;
            return Ok(FlushStatus::Drained);
        }
        Ok(FlushStatus::Idle)
    }

    fn advance(&mut self, written: usize) {
        self.bytes_written += written as u64;
        self.queued_bytes -= written.min(self.queued_bytes);

        let mut left = written;
        while left > 0 {
            let Some(front) = self.write_queue.front_mut() else {
                break;
            };
            if front.len() <= left {
                left -= front.len();
                self.write_queue.pop_front();
            } else {
                front.consume(left);
                left = 0;
            }
        }
        trace!(descriptor = %self.id, bytes = written, queued = self.queued_bytes, "Wrote data");
    }

    fn discard_queue(&mut self) -> usize {
        let discarded = self.write_queue.len();
        self.write_queue.clear();
        self.queued_bytes = 0;
        discarded
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Graceful close: straight to CLOSED when nothing is queued, otherwise
    /// DRAINING until the queue is flushed or the drain deadline passes.
    pub fn close(&mut self, now: u64) -> CloseProgress {
        match self.state {
            DescriptorState::Closed => CloseProgress::Closed,
            DescriptorState::Draining => CloseProgress::Draining,
            // Nothing queued can reach a peer that is not connected
            DescriptorState::Connecting | DescriptorState::Reconnecting => {
                self.discard_queue();
                self.state = DescriptorState::Closed;
                self.close_reason.get_or_insert(CloseReason::Requested);
                CloseProgress::Closed
            }
            _ if self.write_queue.is_empty() => {
                self.state = DescriptorState::Closed;
                self.close_reason.get_or_insert(CloseReason::Requested);
                CloseProgress::Closed
            }
            _ => {
                self.state = DescriptorState::Draining;
                self.drain_deadline = Some(now + self.limits.drain_ticks);
                debug!(
                    descriptor = %self.id,
                    queued = self.write_queue.len(),
                    deadline = now + self.limits.drain_ticks,
                    "Draining before close"
                );
                CloseProgress::Draining
            }
        }
    }

    /// Fatal error: CLOSED immediately, queued buffers released.
    ///
    /// Returns how many buffers were discarded.
    pub fn fail(&mut self, reason: CloseReason) -> usize {
        if self.state == DescriptorState::Closed {
            return 0;
        }
        let discarded = self.discard_queue();
        debug!(
            descriptor = %self.id,
            reason = %reason,
            discarded = discarded,
            "Descriptor failed"
        );
        self.state = DescriptorState::Closed;
        self.drain_deadline = None;
        self.close_reason = Some(reason);
        discarded
    }

    /// Applies drain, connect and reconnect deadlines.
    pub fn check_timeouts(&mut self, now: u64) -> Option<TimeoutEvent> {
        match self.state {
            DescriptorState::Draining if self.drain_deadline.is_some_and(|at| now >= at) => {
                let discarded = self.discard_queue();
                self.state = DescriptorState::Closed;
                self.drain_deadline = None;
                self.close_reason = Some(CloseReason::DrainTimeout { discarded });
                Some(TimeoutEvent::DrainExpired { discarded })
            }
            DescriptorState::Connecting if self.connect_deadline.is_some_and(|at| now >= at) => {
                Some(TimeoutEvent::ConnectTimedOut)
            }
            DescriptorState::Reconnecting
                if self
                    .handler
                    .as_backend()
                    .is_some_and(|backend| backend.retry_due(now)) =>
            {
                Some(TimeoutEvent::ReconnectDue)
            }
            _ => None,
        }
    }

    /// Marks the handshake as complete.
    pub fn mark_active(&mut self) -> Result<(), CoreError> {
        self.transition(DescriptorState::Active)?;
        if let Some(backend) = self.handler.as_backend_mut() {
            backend.connected();
        }
        Ok(())
    }

    /// Moves back to AUTHENTICATING, e.g. for a `COM_CHANGE_USER`.
    pub fn mark_authenticating(&mut self) -> Result<(), CoreError> {
        self.transition(DescriptorState::Authenticating)
    }

    /// Starts a bounded-backoff reconnect of a backend.
    ///
    /// Queued data belongs to the broken connection and is dropped. The
    /// caller deregisters the old socket.
    pub fn begin_reconnect(
        &mut self,
        now: u64,
        base: Duration,
        max: Duration,
    ) -> Result<Duration, CoreError> {
        if self.handler.as_backend().is_none() {
            return Err(CoreError::NotBackend(self.id));
        }
        self.transition(DescriptorState::Reconnecting)?;

        self.discard_queue();
        self.read_buf = Buffer::new();
        self.parser = PacketParser::new(Role::Backend, self.limits.parser);
        self.drain_deadline = None;
        self.connect_deadline = None;

        let delay = match self.handler.as_backend_mut() {
            Some(backend) => backend.schedule_retry(now, base, max),
            None => return Err(CoreError::NotBackend(self.id)),
        };
        debug!(descriptor = %self.id, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
        Ok(delay)
    }

    /// Installs the socket of a new connect attempt (RECONNECTING ->
    /// CONNECTING). The caller registers it.
    pub fn replace_socket(&mut self, socket: Box<dyn Socket>, now: u64) -> Result<(), CoreError> {
        self.transition(DescriptorState::Connecting)?;
        self.socket = socket;
        self.registered = None;
        self.connect_deadline = Some(now + self.limits.connect_ticks);
        if let Some(backend) = self.handler.as_backend_mut() {
            backend.clear_retry();
        }
        Ok(())
    }

    pub fn enter_bulk_load(&mut self) {
        self.parser.enter_bulk_load();
    }

    pub fn exit_bulk_load(&mut self) {
        self.parser.exit_bulk_load();
    }
}
