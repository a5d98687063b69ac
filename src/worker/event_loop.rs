//! Worker Event Loop
//!
//! Each worker is one OS thread running this loop over its own `mio::Poll`.
//! Nothing here is shared: the descriptor arena, the router instance, the
//! worker-local storage and the counters all belong to the thread. Other
//! threads reach the worker only through its task queue.
//!
//! ## One Iteration
//!
//! ```text
//!   ┌──────────────────────────────────────────────────────────────┐
//!   │ 1. poll(timeout)        zero when a capped read must resume   │
//!   │ 2. dispatch readiness   waker │ listener │ descriptors       │
//!   │                         (writable first, then readable)      │
//!   │ 3. drain task queue     each task behind a panic/Err guard   │
//!   │ 4. tick                 timeouts, deferred callbacks         │
//!   └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Router callbacks never re-enter the router. Failures caused while a
//! callback runs (a write that hits a reset socket, a close that completes
//! immediately) are queued as notices and handled once the callback has
//! returned.

use crate::buffer::Buffer;
use crate::clock;
use crate::config::CoreConfig;
use crate::descriptor::{
    socket, BackendTarget, CloseProgress, Descriptor, DescriptorId, DescriptorLimits,
    DescriptorState, FlushStatus, TimeoutEvent,
};
use crate::error::{CloseReason, CoreError, CoreResult};
use crate::protocol::Packet;
use crate::session::{ErrorAction, Router};
use crate::worker::context::Context;
use crate::worker::local::{LocalStorage, SlotRegistry};
use crate::worker::stats::{WorkerLoad, WorkerStats};
use crate::worker::task::{Mailbox, Task, TaskFn};
use crossbeam_channel::{Receiver, TryRecvError};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token};
use std::any::Any;
use std::cell::Cell;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

pub(crate) const WAKER: Token = Token(0);
pub(crate) const LISTENER: Token = Token(1);
const FIRST_DESCRIPTOR: usize = 2;

const EVENTS_CAPACITY: usize = 1024;

thread_local! {
    static CURRENT_WORKER: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Index of the worker running on this thread, if any.
pub fn current_worker() -> Option<usize> {
    CURRENT_WORKER.with(|current| current.get())
}

pub(crate) fn token_of(id: DescriptorId) -> Token {
    Token(id.index() as usize + FIRST_DESCRIPTOR)
}

/// The parts of a readiness event the loop acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Readiness {
    token: Token,
    readable: bool,
    writable: bool,
}

impl From<&mio::event::Event> for Readiness {
    fn from(event: &mio::event::Event) -> Self {
        Self {
            token: event.token(),
            // Errors and hangups surface through the read path
            readable: event.is_readable() || event.is_read_closed() || event.is_error(),
            writable: event.is_writable() || event.is_write_closed(),
        }
    }
}

// ----------------------------------------------------------------------
// Descriptor arena
// ----------------------------------------------------------------------

#[derive(Default)]
struct ArenaSlot {
    generation: u32,
    descriptor: Option<Descriptor>,
}

/// Descriptors owned by one worker, addressed by index and generation.
pub(crate) struct Arena {
    worker: usize,
    slots: Vec<ArenaSlot>,
    free: Vec<u32>,
    len: usize,
}

impl Arena {
    fn new(worker: usize) -> Self {
        Self {
            worker,
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Reserves a slot and returns the id the next descriptor will carry.
    fn reserve(&mut self) -> DescriptorId {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(ArenaSlot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let generation = self.slots[index as usize].generation;
        DescriptorId::new(self.worker, index, generation)
    }

    fn fill(&mut self, descriptor: Descriptor) {
        if let Some(slot) = self.slots.get_mut(descriptor.id().index() as usize) {
            slot.descriptor = Some(descriptor);
            self.len += 1;
        }
    }

    /// Returns a reserved slot that was never filled.
    fn cancel(&mut self, id: DescriptorId) {
        if let Some(slot) = self.slots.get_mut(id.index() as usize) {
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(id.index());
        }
    }

    fn slot(&self, id: DescriptorId) -> Option<&ArenaSlot> {
        if id.worker() != self.worker {
            return None;
        }
        self.slots
            .get(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
    }

    pub(crate) fn get(&self, id: DescriptorId) -> Option<&Descriptor> {
        self.slot(id).and_then(|slot| slot.descriptor.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: DescriptorId) -> Option<&mut Descriptor> {
        if id.worker() != self.worker {
            return None;
        }
        self.slots
            .get_mut(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.descriptor.as_mut())
    }

    fn remove(&mut self, id: DescriptorId) -> Option<Descriptor> {
        if id.worker() != self.worker {
            return None;
        }
        let slot = self.slots.get_mut(id.index() as usize)?;
        if slot.generation != id.generation() {
            return None;
        }
        let descriptor = slot.descriptor.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index());
        self.len -= 1;
        Some(descriptor)
    }

    fn id_for(&self, token: Token) -> Option<DescriptorId> {
        let index = token.0.checked_sub(FIRST_DESCRIPTOR)?;
        self.slots
            .get(index)
            .and_then(|slot| slot.descriptor.as_ref())
            .map(|descriptor| descriptor.id())
    }

    fn ids(&self) -> Vec<DescriptorId> {
        self.slots
            .iter()
            .filter_map(|slot| slot.descriptor.as_ref().map(|d| d.id()))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

// ----------------------------------------------------------------------
// Core: everything a callback may touch
// ----------------------------------------------------------------------

/// Work discovered during a callback and handled after it returns.
#[derive(Debug)]
pub(crate) enum Notice {
    Error(DescriptorId, CloseReason),
    Closed(DescriptorId),
}

impl Notice {
    fn descriptor(&self) -> DescriptorId {
        match self {
            Notice::Error(id, _) | Notice::Closed(id) => *id,
        }
    }
}

/// Worker state reachable from a [`Context`].
pub(crate) struct Core {
    pub(crate) id: usize,
    pub(crate) config: Arc<CoreConfig>,
    pub(crate) limits: DescriptorLimits,
    pub(crate) registry: Registry,
    pub(crate) arena: Arena,
    pub(crate) notices: VecDeque<Notice>,
    /// Descriptors whose last read stopped at the per-call cap
    pub(crate) resume: VecDeque<DescriptorId>,
    pub(crate) deferred: Vec<(u64, TaskFn)>,
    pub(crate) locals: LocalStorage,
    pub(crate) stats: WorkerStats,
    pub(crate) load: Arc<WorkerLoad>,
    pub(crate) mailboxes: Arc<Vec<Mailbox>>,
}

impl Core {
    pub(crate) fn descriptor(&self, id: DescriptorId) -> CoreResult<&Descriptor> {
        self.arena.get(id).ok_or(CoreError::UnknownDescriptor(id))
    }

    pub(crate) fn descriptor_mut(&mut self, id: DescriptorId) -> CoreResult<&mut Descriptor> {
        self.arena
            .get_mut(id)
            .ok_or(CoreError::UnknownDescriptor(id))
    }

    fn insert(
        &mut self,
        make: impl FnOnce(DescriptorId) -> Descriptor,
    ) -> CoreResult<DescriptorId> {
        let id = self.arena.reserve();
        let mut descriptor = make(id);
        if let Err(e) = descriptor.register(&self.registry, token_of(id)) {
            self.arena.cancel(id);
            return Err(e.into());
        }
        self.arena.fill(descriptor);
        Ok(id)
    }

    /// Wraps an accepted stream in a client descriptor. The acceptor has
    /// already counted it in the worker load.
    fn adopt(&mut self, stream: TcpStream) -> CoreResult<DescriptorId> {
        stream.set_nodelay(true)?;
        let limits = self.limits;
        let id = self.insert(|id| Descriptor::new_client(id, Box::new(stream), limits))?;
        self.stats.connection_accepted();
        Ok(id)
    }

    pub(crate) fn open_backend(&mut self, target: BackendTarget) -> CoreResult<DescriptorId> {
        let address = target.address;
        let stream = socket::connect(address)?;
        let limits = self.limits;
        let now = clock::now();
        let id = self.insert(move |id| {
            Descriptor::new_backend(id, Box::new(stream), target, limits, now)
        })?;
        self.load.increment(self.id);
        self.stats.backend_opened();
        debug!(worker = self.id, descriptor = %id, backend = %address, "Backend connect started");
        Ok(id)
    }

    pub(crate) fn write(&mut self, id: DescriptorId, buf: Buffer) -> CoreResult<()> {
        let descriptor = self.descriptor_mut(id)?;
        descriptor.enqueue(buf)?;
        if descriptor.can_flush() {
            self.flush(id);
        } else {
            self.sync_interest(id);
        }
        Ok(())
    }

    pub(crate) fn close(&mut self, id: DescriptorId) -> CoreResult<()> {
        let now = clock::now();
        let progress = self.descriptor_mut(id)?.close(now);
        match progress {
            CloseProgress::Closed => self.notices.push_back(Notice::Closed(id)),
            CloseProgress::Draining => self.flush(id),
        }
        Ok(())
    }

    pub(crate) fn flush(&mut self, id: DescriptorId) {
        let Some(descriptor) = self.arena.get_mut(id) else {
            return;
        };
        let before = descriptor.bytes_written();
        let result = descriptor.flush();
        let written = descriptor.bytes_written() - before;
        self.stats.bytes_written(written);

        match result {
            Ok(FlushStatus::Drained) => {
                debug!(worker = self.id, descriptor = %id, "Drain complete");
                self.notices.push_back(Notice::Closed(id));
            }
            Ok(FlushStatus::Idle | FlushStatus::Pending) => self.sync_interest(id),
            Err(reason) => self.notices.push_back(Notice::Error(id, reason)),
        }
    }

    fn sync_interest(&mut self, id: DescriptorId) {
        if let Some(descriptor) = self.arena.get_mut(id) {
            if let Err(e) = descriptor.sync_interest(&self.registry, token_of(id)) {
                self.notices.push_back(Notice::Error(id, CloseReason::from(e)));
            }
        }
    }

    /// Drops the backend's connection and schedules a new connect attempt.
    pub(crate) fn begin_reconnect(&mut self, id: DescriptorId) -> CoreResult<Duration> {
        let now = clock::now();
        let base = self.config.reconnect_backoff_base();
        let max = self.config.reconnect_backoff_max();

        let descriptor = self
            .arena
            .get_mut(id)
            .ok_or(CoreError::UnknownDescriptor(id))?;
        let delay = descriptor.begin_reconnect(now, base, max)?;
        descriptor.release(&self.registry);

        // Anything still queued for the old connection is moot
        self.resume.retain(|queued| *queued != id);
        self.notices.retain(|notice| notice.descriptor() != id);
        Ok(delay)
    }

    fn retry_connect(&mut self, id: DescriptorId) {
        let now = clock::now();
        let Some(descriptor) = self.arena.get_mut(id) else {
            return;
        };
        let Some(backend) = descriptor.handler().as_backend() else {
            return;
        };
        let address = backend.target().address;
        let attempt = backend.attempts();

        match socket::connect(address) {
            Ok(stream) => {
                if let Err(e) = descriptor.replace_socket(Box::new(stream), now) {
                    warn!(worker = self.id, descriptor = %id, error = %e, "Reconnect aborted");
                    return;
                }
                if let Err(e) = descriptor.register(&self.registry, token_of(id)) {
                    self.notices.push_back(Notice::Error(id, CloseReason::from(e)));
                    return;
                }
                self.stats.reconnect_started();
                info!(
                    worker = self.id,
                    descriptor = %id,
                    backend = %address,
                    attempt = attempt,
                    "Reconnecting backend"
                );
            }
            Err(e) => self.notices.push_back(Notice::Error(id, CloseReason::from(e))),
        }
    }

    pub(crate) fn defer(&mut self, delay: Duration, f: TaskFn) {
        let at = clock::now() + clock::ticks_for(delay);
        self.deferred.push((at, f));
    }
}

// ----------------------------------------------------------------------
// Worker
// ----------------------------------------------------------------------

/// Everything a worker thread needs, prepared by the pool before spawning.
pub(crate) struct WorkerParts {
    pub(crate) id: usize,
    pub(crate) poll: Poll,
    pub(crate) registry: Registry,
    pub(crate) tasks: Receiver<Task>,
    pub(crate) config: Arc<CoreConfig>,
    pub(crate) load: Arc<WorkerLoad>,
    pub(crate) slots: Arc<SlotRegistry>,
    pub(crate) mailboxes: Arc<Vec<Mailbox>>,
}

/// One event loop.
pub struct Worker {
    poll: Poll,
    core: Core,
    router: Box<dyn Router>,
    tasks: Receiver<Task>,
    listener: Option<TcpListener>,
    last_tick: u64,
    shutting_down: bool,
}

impl Worker {
    pub(crate) fn new(parts: WorkerParts, router: Box<dyn Router>) -> Self {
        let limits = DescriptorLimits::from_config(&parts.config);
        let core = Core {
            id: parts.id,
            config: parts.config,
            limits,
            registry: parts.registry,
            arena: Arena::new(parts.id),
            notices: VecDeque::new(),
            resume: VecDeque::new(),
            deferred: Vec::new(),
            locals: LocalStorage::new(parts.slots),
            stats: WorkerStats::new(),
            load: parts.load,
            mailboxes: parts.mailboxes,
        };
        Self {
            poll: parts.poll,
            core,
            router,
            tasks: parts.tasks,
            listener: None,
            last_tick: clock::now(),
            shutting_down: false,
        }
    }

    pub fn id(&self) -> usize {
        self.core.id
    }

    /// Runs until a `Shutdown` task arrives. Must be called on the thread
    /// that owns the worker.
    pub fn run(mut self) {
        let id = self.core.id;
        CURRENT_WORKER.with(|current| current.set(Some(id)));
        info!(worker = id, "Worker started");

        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        while !self.shutting_down {
            let timeout = if self.core.resume.is_empty() {
                self.core.config.poll_timeout()
            } else {
                Duration::ZERO
            };

            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(worker = id, error = %e, "Poll failed, stopping worker");
                break;
            }

            self.dispatch(events.iter().map(Readiness::from));
            self.run_tasks();
            self.tick();
        }

        self.close_all();
        info!(worker = id, stats = %self.core.stats, "Worker stopped");
        CURRENT_WORKER.with(|current| current.set(None));
    }

    // ------------------------------------------------------------------
    // Readiness
    // ------------------------------------------------------------------

    /// Handles one round of readiness. Descriptors left over from the last
    /// round's read cap are served after everything that became ready.
    fn dispatch(&mut self, ready: impl IntoIterator<Item = Readiness>) {
        let resumed = std::mem::take(&mut self.core.resume);

        for event in ready {
            match event.token {
                WAKER => {}
                LISTENER => self.accept(),
                token => {
                    let Some(descriptor) = self.core.arena.id_for(token) else {
                        continue;
                    };
                    if event.writable {
                        self.on_writable(descriptor);
                    }
                    if event.readable {
                        self.on_readable(descriptor);
                    }
                }
            }
        }

        for descriptor in resumed {
            self.on_readable(descriptor);
        }
    }

    fn on_readable(&mut self, id: DescriptorId) {
        let Some(descriptor) = self.core.arena.get_mut(id) else {
            return;
        };
        let outcome = descriptor.on_readable();
        self.core.stats.bytes_read(outcome.bytes);
        if outcome.more {
            self.core.resume.push_back(id);
        }

        for packet in outcome.packets {
            // The router may have closed the descriptor on an earlier packet
            if !self
                .core
                .arena
                .get(id)
                .is_some_and(|d| d.state().is_open())
            {
                break;
            }
            trace!(
                descriptor = %id,
                kind = ?packet.meta.kind,
                bytes = packet.data.len(),
                "Packet ready"
            );
            self.core.stats.packets_routed(1);
            let Packet { data, meta } = packet;
            let mut ctx = Context::new(&mut self.core);
            self.router.on_packet_ready(&mut ctx, id, data, meta);
        }

        if let Some(reason) = outcome.error {
            if reason.is_protocol() {
                self.core.stats.protocol_error();
                warn!(worker = self.core.id, descriptor = %id, error = %reason, "Protocol error");
            }
            self.core.notices.push_back(Notice::Error(id, reason));
        }
        self.process_notices();
    }

    fn on_writable(&mut self, id: DescriptorId) {
        let Some(descriptor) = self.core.arena.get_mut(id) else {
            return;
        };

        if descriptor.state() == DescriptorState::Connecting {
            match descriptor.finish_connect() {
                Ok(true) => {
                    self.core.flush(id);
                    let mut ctx = Context::new(&mut self.core);
                    self.router.on_backend_connected(&mut ctx, id);
                }
                Ok(false) => {}
                Err(reason) => self.core.notices.push_back(Notice::Error(id, reason)),
            }
        } else {
            self.core.flush(id);
        }
        self.process_notices();
    }

    // ------------------------------------------------------------------
    // Accepting
    // ------------------------------------------------------------------

    fn start_listening(&mut self, mut listener: TcpListener) {
        if let Err(e) = self
            .core
            .registry
            .register(&mut listener, LISTENER, Interest::READABLE)
        {
            error!(worker = self.core.id, error = %e, "Failed to register listener");
            return;
        }
        match listener.local_addr() {
            Ok(addr) => info!(worker = self.core.id, address = %addr, "Accepting clients"),
            Err(_) => info!(worker = self.core.id, "Accepting clients"),
        }
        self.listener = Some(listener);
    }

    fn accept(&mut self) {
        loop {
            let Some(listener) = self.listener.as_ref() else {
                return;
            };
            match listener.accept() {
                Ok((stream, addr)) => self.place(stream, addr),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(worker = self.core.id, error = %e, "Accept failed");
                    return;
                }
            }
        }
    }

    /// Hands a new client to the least loaded worker.
    fn place(&mut self, stream: TcpStream, addr: SocketAddr) {
        let target = self.core.load.least_loaded();
        self.core.load.increment(target);

        if target == self.core.id {
            self.adopt(stream, addr);
            return;
        }

        let sent = match self.core.mailboxes.get(target) {
            Some(mailbox) => mailbox.send(Task::Adopt(stream, addr)),
            None => Err(CoreError::WorkerGone(target)),
        };
        if let Err(e) = sent {
            self.core.load.decrement(target);
            warn!(client = %addr, worker = target, error = %e, "Dropping client");
        }
    }

    fn adopt(&mut self, stream: TcpStream, addr: SocketAddr) {
        match self.core.adopt(stream) {
            Ok(id) => {
                debug!(worker = self.core.id, descriptor = %id, client = %addr, "Client accepted");
                let mut ctx = Context::new(&mut self.core);
                self.router.on_client_accepted(&mut ctx, id);
            }
            Err(e) => {
                self.core.load.decrement(self.core.id);
                warn!(worker = self.core.id, client = %addr, error = %e, "Failed to adopt client");
            }
        }
        self.process_notices();
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    /// Runs the tasks queued when the round started.
    fn run_tasks(&mut self) {
        let queued = self.tasks.len();
        for _ in 0..queued {
            match self.tasks.try_recv() {
                Ok(task) => self.run_task(task),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.shutting_down = true;
                    break;
                }
            }
        }
    }

    fn run_task(&mut self, task: Task) {
        trace!(worker = self.core.id, task = task.name(), "Running task");
        match task {
            Task::Adopt(stream, addr) => self.adopt(stream, addr),
            Task::Listen(listener) => self.start_listening(listener),
            Task::Call(f) => self.run_guarded("call", f),
            Task::Broadcast(f, done) => {
                self.run_guarded("broadcast", move |ctx: &mut Context<'_>| f(ctx));
                drop(done);
            }
            Task::DeleteLocal(slot, done) => {
                if self.core.locals.delete(slot) {
                    trace!(worker = self.core.id, slot = slot, "Worker-local instance destroyed");
                }
                drop(done);
            }
            Task::CollectStats(reply, done) => {
                let _ = reply.send(self.core.stats.clone());
                drop(done);
            }
            Task::Shutdown => {
                debug!(worker = self.core.id, "Shutdown requested");
                self.shutting_down = true;
            }
        }
        self.process_notices();
    }

    /// Runs `f`, containing both errors and panics.
    fn run_guarded<F>(&mut self, kind: &'static str, f: F)
    where
        F: FnOnce(&mut Context<'_>) -> anyhow::Result<()>,
    {
        let result = {
            let mut ctx = Context::new(&mut self.core);
            panic::catch_unwind(AssertUnwindSafe(|| f(&mut ctx)))
        };
        match result {
            Ok(Ok(())) => self.core.stats.task_run(),
            Ok(Err(e)) => {
                self.core.stats.task_failed();
                error!(worker = self.core.id, task = kind, error = %e, "Task failed");
            }
            Err(payload) => {
                self.core.stats.task_failed();
                error!(
                    worker = self.core.id,
                    task = kind,
                    panic = panic_message(payload.as_ref()),
                    "Task panicked"
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Housekeeping
    // ------------------------------------------------------------------

    fn tick(&mut self) {
        let now = clock::now();
        if now != self.last_tick {
            self.last_tick = now;
            self.check_timeouts(now);
        }
        self.run_deferred(now);
    }

    fn check_timeouts(&mut self, now: u64) {
        for id in self.core.arena.ids() {
            let Some(descriptor) = self.core.arena.get_mut(id) else {
                continue;
            };
            match descriptor.check_timeouts(now) {
                Some(TimeoutEvent::DrainExpired { discarded }) => {
                    warn!(
                        worker = self.core.id,
                        descriptor = %id,
                        discarded = discarded,
                        "Drain timed out, discarding queued buffers"
                    );
                    self.core.notices.push_back(Notice::Closed(id));
                }
                Some(TimeoutEvent::ConnectTimedOut) => {
                    self.core
                        .notices
                        .push_back(Notice::Error(id, CloseReason::ConnectTimeout));
                }
                Some(TimeoutEvent::ReconnectDue) => self.core.retry_connect(id),
                None => {}
            }
        }
        self.process_notices();
    }

    fn run_deferred(&mut self, now: u64) {
        if !self.core.deferred.iter().any(|(at, _)| *at <= now) {
            return;
        }
        let (due, later): (Vec<_>, Vec<_>) = std::mem::take(&mut self.core.deferred)
            .into_iter()
            .partition(|(at, _)| *at <= now);
        self.core.deferred = later;
        for (_, f) in due {
            self.run_guarded("deferred", f);
        }
        self.process_notices();
    }

    // ------------------------------------------------------------------
    // Errors and closing
    // ------------------------------------------------------------------

    fn process_notices(&mut self) {
        while let Some(notice) = self.core.notices.pop_front() {
            match notice {
                Notice::Error(id, reason) => self.handle_error(id, reason),
                Notice::Closed(id) => self.finalize(id),
            }
        }
    }

    fn handle_error(&mut self, id: DescriptorId, reason: CloseReason) {
        let Some(state) = self.core.arena.get(id).map(|d| d.state()) else {
            return;
        };
        if state == DescriptorState::Closed {
            self.finalize(id);
            return;
        }

        debug!(
            worker = self.core.id,
            descriptor = %id,
            state = %state,
            code = reason.code(),
            reason = %reason,
            "Descriptor error"
        );

        let action = {
            let mut ctx = Context::new(&mut self.core);
            self.router.on_descriptor_error(&mut ctx, id, &reason)
        };

        match action {
            // A desynchronized stream is never retried
            ErrorAction::Reconnect if !reason.is_protocol() => {
                match self.core.begin_reconnect(id) {
                    Ok(_) => return,
                    Err(e) => debug!(descriptor = %id, error = %e, "Reconnect refused"),
                }
            }
            // Only a healthy socket can still deliver queued data
            ErrorAction::Drain if reason.is_protocol() => {
                if self.core.close(id).is_ok() {
                    self.process_notices();
                    return;
                }
            }
            _ => {}
        }

        if let Some(descriptor) = self.core.arena.get_mut(id) {
            descriptor.fail(reason);
        }
        self.finalize(id);
    }

    /// Removes a descriptor and reports it closed; runs at most once per id.
    fn finalize(&mut self, id: DescriptorId) {
        let Some(mut descriptor) = self.core.arena.remove(id) else {
            return;
        };
        descriptor.release(&self.core.registry);
        self.core.resume.retain(|queued| *queued != id);
        self.core.stats.descriptor_closed();
        self.core.load.decrement(self.core.id);

        debug!(
            worker = self.core.id,
            descriptor = %id,
            role = %descriptor.role(),
            reason = descriptor.close_reason().map_or("requested", |r| r.code()),
            bytes_read = descriptor.bytes_read(),
            bytes_written = descriptor.bytes_written(),
            "Descriptor closed"
        );
        drop(descriptor);

        let mut ctx = Context::new(&mut self.core);
        self.router.on_descriptor_closed(&mut ctx, id);
    }

    fn close_all(&mut self) {
        if let Some(mut listener) = self.listener.take() {
            let _ = self.core.registry.deregister(&mut listener);
        }
        for id in self.core.arena.ids() {
            if let Some(descriptor) = self.core.arena.get_mut(id) {
                descriptor.fail(CloseReason::Shutdown);
            }
            self.finalize(id);
        }
        self.process_notices();
        // Wait groups of tasks that will never run are released here
        while let Ok(task) = self.tasks.try_recv() {
            if let Task::Adopt(_, addr) = task {
                self.core.load.decrement(self.core.id);
                debug!(worker = self.core.id, client = %addr, "Dropping unadopted client");
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::socket::mock::MockSocket;
    use crate::error::ProtocolError;
    use crate::protocol::{command_packet, Command, PacketMeta, Phase};
    use crate::session::RouterFactory;
    use crate::worker::pool::WorkerPool;
    use mio::Waker;
    use std::cell::RefCell;
    use std::io::Read;
    use std::rc::Rc;
    use std::thread;
    use std::time::Instant;

    #[derive(Default)]
    struct Log {
        packets: Vec<DescriptorId>,
        errors: Vec<(DescriptorId, &'static str)>,
        closed: Vec<DescriptorId>,
    }

    /// Records callbacks and answers every error with one fixed action.
    struct Recorder {
        log: Rc<RefCell<Log>>,
        action: ErrorAction,
    }

    impl Router for Recorder {
        fn on_client_accepted(&mut self, _: &mut Context<'_>, _: DescriptorId) {}

        fn on_packet_ready(
            &mut self,
            _: &mut Context<'_>,
            id: DescriptorId,
            _: Buffer,
            _: PacketMeta,
        ) {
            self.log.borrow_mut().packets.push(id);
        }

        fn on_descriptor_error(
            &mut self,
            _: &mut Context<'_>,
            id: DescriptorId,
            reason: &CloseReason,
        ) -> ErrorAction {
            self.log.borrow_mut().errors.push((id, reason.code()));
            self.action
        }

        fn on_descriptor_closed(&mut self, _: &mut Context<'_>, id: DescriptorId) {
            self.log.borrow_mut().closed.push(id);
        }
    }

    /// A worker driven from the test thread instead of `run`.
    fn harness(config: CoreConfig, action: ErrorAction) -> (Worker, Rc<RefCell<Log>>) {
        let poll = Poll::new().unwrap();
        let registry = poll.registry().try_clone().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), WAKER).unwrap());
        let (tx, tasks) = crossbeam_channel::unbounded();
        let parts = WorkerParts {
            id: 0,
            poll,
            registry,
            tasks,
            config: Arc::new(config),
            load: Arc::new(WorkerLoad::new(1)),
            slots: Arc::new(SlotRegistry::new()),
            mailboxes: Arc::new(vec![Mailbox::new(0, tx, waker)]),
        };
        let log = Rc::new(RefCell::new(Log::default()));
        let router = Recorder {
            log: Rc::clone(&log),
            action,
        };
        (Worker::new(parts, Box::new(router)), log)
    }

    fn add_client(worker: &mut Worker, socket: &MockSocket) -> DescriptorId {
        let limits = worker.core.limits;
        let id = worker
            .core
            .insert(|id| {
                let mut desc = Descriptor::new_client(id, Box::new(socket.clone()), limits);
                desc.parser_mut().set_phase(Phase::Command);
                desc.mark_active().unwrap();
                desc
            })
            .unwrap();
        worker.core.load.increment(0);
        id
    }

    fn add_backend(worker: &mut Worker, socket: &MockSocket) -> DescriptorId {
        let limits = worker.core.limits;
        let target = BackendTarget::new("127.0.0.1:3306".parse().unwrap());
        let id = worker
            .core
            .insert(|id| {
                let mut desc = Descriptor::new_backend(
                    id,
                    Box::new(socket.clone()),
                    target,
                    limits,
                    clock::now(),
                );
                desc.mark_active().unwrap();
                desc
            })
            .unwrap();
        worker.core.load.increment(0);
        id
    }

    fn readable(id: DescriptorId) -> Readiness {
        Readiness {
            token: token_of(id),
            readable: true,
            writable: false,
        }
    }

    fn state(worker: &Worker, id: DescriptorId) -> Option<DescriptorState> {
        worker.core.arena.get(id).map(|d| d.state())
    }

    fn malformed() -> CloseReason {
        CloseReason::Protocol(ProtocolError::Malformed("bad header"))
    }


    fn client(arena: &mut Arena) -> DescriptorId {
        let id = arena.reserve();
        arena.fill(Descriptor::new_client(
            id,
            Box::new(MockSocket::new()),
            DescriptorLimits::default(),
        ));
        id
    }

    #[test]
    fn test_arena_rejects_stale_ids() {
        let mut arena = Arena::new(3);
        let first = client(&mut arena);
        assert_eq!(first.worker(), 3);
        assert_eq!(arena.id_for(token_of(first)), Some(first));

        assert!(arena.remove(first).is_some());
        assert!(arena.remove(first).is_none());
        assert_eq!(arena.len(), 0);

        // The slot is reused under a new generation
        let second = client(&mut arena);
        assert_eq!(second.index(), first.index());
        assert_ne!(second.generation(), first.generation());
        assert!(arena.get(first).is_none());
        assert!(arena.get(second).is_some());
    }

    #[test]
    fn test_arena_ignores_foreign_ids() {
        let mut arena = Arena::new(0);
        let id = client(&mut arena);
        let foreign = DescriptorId::new(1, id.index(), id.generation());
        assert!(arena.get(foreign).is_none());
        assert!(arena.id_for(WAKER).is_none());
        assert!(arena.id_for(LISTENER).is_none());
    }

    #[test]
    fn test_capped_reads_resume_after_other_descriptors() {
        let config = CoreConfig {
            read_chunk_size: 16,
            max_read_per_call: 32,
            ..Default::default()
        };
        let (mut worker, log) = harness(config, ErrorAction::Close);
        let packet = command_packet(Command::Query, b"SELECT 1234").to_vec();
        assert_eq!(packet.len(), 16);

        let busy = MockSocket::new();
        for _ in 0..6 {
            busy.push_input(&packet);
        }
        let quiet = MockSocket::new();
        quiet.push_input(&packet);
        let a = add_client(&mut worker, &busy);
        let b = add_client(&mut worker, &quiet);

        // Two packets fill A's allowance for the round
        worker.dispatch([readable(a), readable(b)]);
        assert_eq!(log.borrow().packets, vec![a, a, b]);
        assert_eq!(worker.core.resume, VecDeque::from([a]));

        // Fresh readiness is served before the resumed read
        quiet.push_input(&packet);
        worker.dispatch([readable(b)]);
        assert_eq!(log.borrow().packets[3..], [b, a, a]);

        worker.dispatch(std::iter::empty());
        assert_eq!(log.borrow().packets[6..], [a, a]);
        assert_eq!(worker.core.resume, VecDeque::from([a]));

        // Nothing left: the next read would block and A leaves the list
        worker.dispatch(std::iter::empty());
        assert_eq!(log.borrow().packets.len(), 8);
        assert!(worker.core.resume.is_empty());
        assert!(log.borrow().errors.is_empty());
    }

    #[test]
    fn test_finalize_reports_close_once() {
        let (mut worker, log) = harness(CoreConfig::default(), ErrorAction::Close);
        let a = add_client(&mut worker, &MockSocket::new());

        worker.core.notices.extend([
            Notice::Closed(a),
            Notice::Error(a, CloseReason::PeerClosed),
            Notice::Closed(a),
        ]);
        worker.process_notices();

        assert_eq!(log.borrow().closed, vec![a]);
        assert!(log.borrow().errors.is_empty());
        assert_eq!(worker.core.stats.descriptors_closed, 1);
        assert_eq!(worker.core.load.get(0), 0);
        assert_eq!(worker.core.arena.len(), 0);
    }

    #[test]
    fn test_drain_deadline_closes_stuck_descriptor() {
        let _clock = clock::testing::exclusive();
        let (mut worker, log) = harness(CoreConfig::default(), ErrorAction::Close);
        let socket = MockSocket::new();
        socket.set_write_budget(Some(0));
        let a = add_client(&mut worker, &socket);

        worker
            .core
            .write(a, command_packet(Command::Query, b"SELECT 1"))
            .unwrap();
        worker.core.close(a).unwrap();
        worker.process_notices();
        assert_eq!(state(&worker, a), Some(DescriptorState::Draining));

        worker.tick();
        assert_eq!(state(&worker, a), Some(DescriptorState::Draining));

        clock::testing::advance(worker.core.limits.drain_ticks);
        worker.tick();
        assert_eq!(state(&worker, a), None);
        assert_eq!(log.borrow().closed, vec![a]);
        assert!(log.borrow().errors.is_empty());
        assert!(socket.written().is_empty());
        assert_eq!(worker.core.load.get(0), 0);
    }

    #[test]
    fn test_reconnect_is_refused_for_protocol_errors() {
        let (mut worker, log) = harness(CoreConfig::default(), ErrorAction::Reconnect);
        let corrupt = add_backend(&mut worker, &MockSocket::new());
        let dropped = add_backend(&mut worker, &MockSocket::new());

        worker.handle_error(corrupt, malformed());
        assert_eq!(state(&worker, corrupt), None);
        assert_eq!(log.borrow().closed, vec![corrupt]);

        worker.handle_error(dropped, CloseReason::PeerClosed);
        assert_eq!(state(&worker, dropped), Some(DescriptorState::Reconnecting));
        assert_eq!(log.borrow().closed, vec![corrupt]);
        assert_eq!(worker.core.stats.reconnects, 0);
        assert_eq!(
            log.borrow().errors,
            vec![(corrupt, "protocol"), (dropped, "peer_closed")]
        );
    }

    #[test]
    fn test_drain_is_only_honored_for_protocol_errors() {
        let (mut worker, log) = harness(CoreConfig::default(), ErrorAction::Drain);
        let stalled = MockSocket::new();
        stalled.set_write_budget(Some(0));
        let corrupt = add_client(&mut worker, &stalled);
        let hung_up = add_client(&mut worker, &MockSocket::new());

        let err = command_packet(Command::Query, b"error reply");
        worker.core.write(corrupt, err).unwrap();
        worker.handle_error(corrupt, malformed());
        assert_eq!(state(&worker, corrupt), Some(DescriptorState::Draining));
        assert!(log.borrow().closed.is_empty());

        worker.handle_error(hung_up, CloseReason::PeerClosed);
        assert_eq!(state(&worker, hung_up), None);
        assert_eq!(log.borrow().closed, vec![hung_up]);

        // The queued reply goes out once the socket accepts it
        stalled.set_write_budget(None);
        worker.dispatch([Readiness {
            token: token_of(corrupt),
            readable: false,
            writable: true,
        }]);
        assert_eq!(state(&worker, corrupt), None);
        assert_eq!(log.borrow().closed, vec![hung_up, corrupt]);
        assert_eq!(stalled.written().len(), 16);
    }

    #[test]
    fn test_context_resets_client_transaction() {
        let (mut worker, log) = harness(CoreConfig::default(), ErrorAction::Close);
        let socket = MockSocket::new();
        socket.push_input(&command_packet(Command::Query, b"BEGIN").to_vec());
        let a = add_client(&mut worker, &socket);
        worker.dispatch([readable(a)]);
        assert_eq!(log.borrow().packets, vec![a]);

        let mut ctx = Context::new(&mut worker.core);
        assert!(ctx.trx_state(a).unwrap().is_some_and(|t| t.active));
        ctx.reset_transaction(a).unwrap();
        assert!(ctx.trx_state(a).unwrap().is_some_and(|t| !t.active));
    }

    #[test]
    fn test_close_all_releases_load_of_unadopted_clients() {
        let (mut worker, log) = harness(CoreConfig::default(), ErrorAction::Close);
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let _peer = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, from) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();

        worker.core.load.increment(0);
        worker.core.mailboxes[0]
            .send(Task::Adopt(TcpStream::from_std(accepted), from))
            .unwrap();
        worker.close_all();

        assert_eq!(worker.core.load.get(0), 0);
        assert!(log.borrow().closed.is_empty());
    }

    /// Queues more than the socket takes, then closes.
    struct Flooder;

    const FLOOD: usize = 32 * 1024 * 1024;

    impl Router for Flooder {
        fn on_client_accepted(&mut self, ctx: &mut Context<'_>, client: DescriptorId) {
            ctx.write(client, Buffer::from(vec![0u8; FLOOD])).unwrap();
            ctx.close(client).unwrap();
        }

        fn on_packet_ready(
            &mut self,
            _: &mut Context<'_>,
            _: DescriptorId,
            _: Buffer,
            _: PacketMeta,
        ) {
        }

        fn on_descriptor_closed(&mut self, _: &mut Context<'_>, _: DescriptorId) {}
    }

    #[test]
    fn test_running_worker_enforces_drain_timeout() {
        let _ticker = clock::testing::Ticker::start(Duration::from_millis(20));
        let config = CoreConfig {
            workers: 1,
            poll_timeout_ms: 20,
            drain_timeout_ms: 200,
            ..Default::default()
        };
        let factory: Arc<dyn RouterFactory> =
            Arc::new(|_worker: usize| Box::new(Flooder) as Box<dyn Router>);
        let pool = WorkerPool::start(config, factory).unwrap();
        let addr = pool.listen("127.0.0.1:0".parse().unwrap()).unwrap();

        // The client never reads, so the drain can only end by timing out
        let mut client = std::net::TcpStream::connect(addr).unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while pool.stats().unwrap().descriptors_closed < 1 {
            assert!(Instant::now() < deadline, "drain never timed out");
            thread::sleep(Duration::from_millis(20));
        }

        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut received = 0;
        let mut chunk = vec![0u8; 64 * 1024];
        while let Ok(n @ 1..) = client.read(&mut chunk) {
            received += n;
        }
        assert!(received < FLOOD);
        assert_eq!(pool.stats().unwrap().descriptors_closed, 1);
    }

    #[test]
    fn test_panic_message() {
        let payload = panic::catch_unwind(|| panic!("boom {}", 1)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom 1");
    }
}
