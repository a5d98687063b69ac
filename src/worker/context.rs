//! Callback context.
//!
//! A [`Context`] is what routers, tasks and deferred callbacks get to work
//! with. It borrows the worker's state for the duration of one callback, so
//! everything it can reach belongs to the calling thread: descriptors of
//! other workers are reachable only through [`Context::post`].

use crate::buffer::Buffer;
use crate::clock;
use crate::config::CoreConfig;
use crate::descriptor::{BackendTarget, DescriptorId, DescriptorState};
use crate::error::{CoreError, CoreResult};
use crate::protocol::{Phase, Role, TrxState};
use crate::session::SessionId;
use crate::worker::event_loop::Core;
use crate::worker::local::SlotKey;
use crate::worker::stats::WorkerStats;
use crate::worker::task::Task;
use std::net::SocketAddr;
use std::time::Duration;

/// Handle to the running worker, valid for one callback.
pub struct Context<'a> {
    core: &'a mut Core,
}

impl<'a> Context<'a> {
    pub(crate) fn new(core: &'a mut Core) -> Self {
        Self { core }
    }

    pub fn worker_id(&self) -> usize {
        self.core.id
    }

    /// Current heartbeat tick.
    pub fn now(&self) -> u64 {
        clock::now()
    }

    pub fn config(&self) -> &CoreConfig {
        &self.core.config
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.core.stats
    }

    /// Descriptors owned by this worker.
    pub fn descriptor_count(&self) -> usize {
        self.core.arena.len()
    }

    // ------------------------------------------------------------------
    // Descriptor operations
    // ------------------------------------------------------------------

    /// Queues `buf` on a descriptor and flushes what the socket accepts.
    ///
    /// A failure of the socket itself is not returned here; it reaches the
    /// router through `on_descriptor_error` once the callback returns.
    pub fn write(&mut self, id: DescriptorId, buf: Buffer) -> CoreResult<()> {
        self.core.write(id, buf)
    }

    /// Closes a descriptor once its queued data is flushed.
    pub fn close(&mut self, id: DescriptorId) -> CoreResult<()> {
        self.core.close(id)
    }

    /// Starts a non-blocking connect to a backend.
    ///
    /// Completion is reported through `Router::on_backend_connected`,
    /// failure through `Router::on_descriptor_error`.
    pub fn open_backend(&mut self, target: BackendTarget) -> CoreResult<DescriptorId> {
        self.core.open_backend(target)
    }

    /// Drops a backend's connection and retries after the backoff delay.
    pub fn reconnect(&mut self, id: DescriptorId) -> CoreResult<Duration> {
        self.core.begin_reconnect(id)
    }

    /// Reconnect attempts since the backend was last ACTIVE.
    pub fn reconnect_attempts(&self, id: DescriptorId) -> CoreResult<u32> {
        self.core
            .descriptor(id)?
            .handler()
            .as_backend()
            .map(|backend| backend.attempts())
            .ok_or(CoreError::NotBackend(id))
    }

    pub fn mark_active(&mut self, id: DescriptorId) -> CoreResult<()> {
        self.core.descriptor_mut(id)?.mark_active()
    }

    pub fn mark_authenticating(&mut self, id: DescriptorId) -> CoreResult<()> {
        self.core.descriptor_mut(id)?.mark_authenticating()
    }

    pub fn state(&self, id: DescriptorId) -> CoreResult<DescriptorState> {
        Ok(self.core.descriptor(id)?.state())
    }

    pub fn role(&self, id: DescriptorId) -> CoreResult<Role> {
        Ok(self.core.descriptor(id)?.role())
    }

    pub fn peer_addr(&self, id: DescriptorId) -> CoreResult<Option<SocketAddr>> {
        Ok(self.core.descriptor(id)?.peer_addr())
    }

    /// Protocol phase of the descriptor's inbound stream.
    pub fn phase(&self, id: DescriptorId) -> CoreResult<Phase> {
        Ok(self.core.descriptor(id)?.parser().phase())
    }

    /// Sequence number the peer's next frame must carry.
    pub fn expected_seq(&self, id: DescriptorId) -> CoreResult<u8> {
        Ok(self.core.descriptor(id)?.parser().expected_seq())
    }

    /// Moves the descriptor's parser to `phase`, e.g. after the gateway
    /// completed authentication itself.
    pub fn set_phase(&mut self, id: DescriptorId, phase: Phase) -> CoreResult<()> {
        self.core.descriptor_mut(id)?.parser_mut().set_phase(phase);
        Ok(())
    }

    /// Transaction state of a client descriptor.
    pub fn trx_state(&self, id: DescriptorId) -> CoreResult<Option<TrxState>> {
        Ok(self
            .core
            .descriptor(id)?
            .handler()
            .as_client()
            .map(|client| client.trx_state()))
    }

    /// Forgets a client's transaction state, e.g. when its backend is being
    /// replaced.
    pub fn reset_transaction(&mut self, id: DescriptorId) -> CoreResult<()> {
        self.core.descriptor_mut(id)?.handler_mut().on_reset();
        Ok(())
    }

    pub fn set_session(&mut self, id: DescriptorId, session: Option<SessionId>) -> CoreResult<()> {
        self.core.descriptor_mut(id)?.set_session(session);
        Ok(())
    }

    pub fn session_of(&self, id: DescriptorId) -> CoreResult<Option<SessionId>> {
        Ok(self.core.descriptor(id)?.session())
    }

    pub fn enter_bulk_load(&mut self, id: DescriptorId) -> CoreResult<()> {
        self.core.descriptor_mut(id)?.enter_bulk_load();
        Ok(())
    }

    pub fn exit_bulk_load(&mut self, id: DescriptorId) -> CoreResult<()> {
        self.core.descriptor_mut(id)?.exit_bulk_load();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Scheduling and storage
    // ------------------------------------------------------------------

    /// Runs `f` on this worker after `delay` (heartbeat resolution).
    pub fn defer<F>(&mut self, delay: Duration, f: F)
    where
        F: FnOnce(&mut Context<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        self.core.defer(delay, Box::new(f));
    }

    /// Queues `f` on another worker (or this one, after the current round).
    pub fn post<F>(&self, worker: usize, f: F) -> CoreResult<()>
    where
        F: FnOnce(&mut Context<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        self.core
            .mailboxes
            .get(worker)
            .ok_or(CoreError::WorkerGone(worker))?
            .send(Task::Call(Box::new(f)))
    }

    /// This worker's instance of a local slot; `None` once deleted.
    pub fn local<T: 'static>(&mut self, key: SlotKey<T>) -> Option<&mut T> {
        self.core.locals.get(key)
    }
}
