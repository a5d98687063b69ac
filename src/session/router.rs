//! The routing seam between the connection core and a gateway's policy.
//!
//! The core knows how to move bytes and frame packets. What to do with a
//! packet, which backend to open and how to react to a failure is decided
//! by a [`Router`]. Every worker owns its own router instance, so
//! implementations need no locking for per-session state.

use crate::buffer::Buffer;
use crate::descriptor::DescriptorId;
use crate::error::CloseReason;
use crate::protocol::PacketMeta;
use crate::worker::Context;

/// How the worker should treat a failed descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorAction {
    /// Close immediately, discarding queued data
    #[default]
    Close,
    /// Flush what is queued (e.g. an error packet), then close. Only honored
    /// for protocol errors; a broken socket is closed at once.
    Drain,
    /// Keep the descriptor and reconnect its backend after the backoff
    /// delay. Never honored for protocol errors.
    Reconnect,
}

/// Per-worker routing policy.
///
/// All callbacks run on the worker that owns the descriptor. Descriptor ids
/// passed in are valid for the duration of the callback; ids held across
/// callbacks must be re-checked through the context.
pub trait Router {
    /// A client was accepted and placed on this worker.
    fn on_client_accepted(&mut self, ctx: &mut Context<'_>, client: DescriptorId);

    /// A backend connect started with `Context::open_backend` completed.
    fn on_backend_connected(&mut self, _ctx: &mut Context<'_>, _backend: DescriptorId) {}

    /// A complete logical packet arrived on `id`.
    fn on_packet_ready(
        &mut self,
        ctx: &mut Context<'_>,
        id: DescriptorId,
        packet: Buffer,
        meta: PacketMeta,
    );

    /// `id` failed. Called once per failure, before any close callback.
    fn on_descriptor_error(
        &mut self,
        _ctx: &mut Context<'_>,
        _id: DescriptorId,
        _reason: &CloseReason,
    ) -> ErrorAction {
        ErrorAction::Close
    }

    /// `id` is gone. Called exactly once per descriptor; the id is stale
    /// once this returns.
    fn on_descriptor_closed(&mut self, ctx: &mut Context<'_>, id: DescriptorId);
}

/// Builds one router per worker.
pub trait RouterFactory: Send + Sync {
    fn create(&self, worker: usize) -> Box<dyn Router>;
}

impl<F> RouterFactory for F
where
    F: Fn(usize) -> Box<dyn Router> + Send + Sync,
{
    fn create(&self, worker: usize) -> Box<dyn Router> {
        self(worker)
    }
}
