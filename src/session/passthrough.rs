//! Passthrough routing: one backend per client.
//!
//! The gateway does not authenticate anyone. The backend's greeting is
//! forwarded to the client and the client's answers to the backend until
//! the server's verdict passes through, at which point both descriptors
//! become ACTIVE. From then on every command goes to the session's backend
//! and every reply back to the client.
//!
//! ```text
//!   client ──handshake──> backend      (forwarded verbatim)
//!   client <──greeting─── backend
//!   client <──OK/ERR───── backend      (both sides ACTIVE, or both closed)
//!   client ──command────> backend      (session commands recorded)
//!   client <──replies──── backend
//! ```
//!
//! A backend that fails before greeting the client is reconnected a few
//! times. After that, or once anything was forwarded, the client receives
//! an ERR packet and the session ends.

use crate::buffer::Buffer;
use crate::config::GatewayConfig;
use crate::descriptor::{BackendTarget, DescriptorId, DescriptorState};
use crate::error::{CloseReason, CoreError};
use crate::protocol::types::{errcode, reply, HEADER_LEN};
use crate::protocol::{command_packet, error_packet, Command, PacketKind, PacketMeta, Phase, Role};
use crate::session::router::{ErrorAction, Router, RouterFactory};
use crate::session::table::{SessionId, SessionTable};
use crate::worker::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Settings for [`PassthroughRouter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassthroughSettings {
    pub backend: SocketAddr,
    pub max_reconnect_attempts: u32,
    pub max_session_commands: usize,
}

impl PassthroughSettings {
    pub fn new(backend: SocketAddr) -> Self {
        Self {
            backend,
            max_reconnect_attempts: 3,
            max_session_commands: 50,
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Result<Self, CoreError> {
        Ok(Self {
            backend: config.backend_addr()?,
            max_reconnect_attempts: config.server.max_reconnect_attempts,
            max_session_commands: config.core.max_session_commands,
        })
    }
}

/// Factory handing every worker its own router.
pub fn factory(settings: PassthroughSettings) -> Arc<dyn RouterFactory> {
    Arc::new(move |worker: usize| {
        Box::new(PassthroughRouter::new(worker, settings.clone())) as Box<dyn Router>
    })
}

pub struct PassthroughRouter {
    worker: usize,
    settings: PassthroughSettings,
    sessions: SessionTable,
}

impl PassthroughRouter {
    pub fn new(worker: usize, settings: PassthroughSettings) -> Self {
        let sessions = SessionTable::new(settings.max_session_commands);
        Self {
            worker,
            settings,
            sessions,
        }
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// Sends an ERR packet to the client and closes it after the flush.
    fn fail_client(
        &mut self,
        ctx: &mut Context<'_>,
        session: SessionId,
        seq: u8,
        code: u16,
        message: &str,
    ) {
        let Some(entry) = self.sessions.get_mut(session) else {
            return;
        };
        entry.closing = true;
        let client = entry.client;
        if ctx.state(client).is_ok_and(|state| state.is_open()) {
            let _ = ctx.write(client, error_packet(seq, code, "08S01", message));
        }
        let _ = ctx.close(client);
    }

    /// Sequence number for an unsolicited reply to the client.
    fn reply_seq(ctx: &Context<'_>, client: DescriptorId, greeted: bool) -> u8 {
        match ctx.phase(client) {
            Ok(Phase::Command) => 1,
            Ok(Phase::Handshake) if greeted => ctx.expected_seq(client).unwrap_or(0),
            _ => 0,
        }
    }

    fn from_backend(
        &mut self,
        ctx: &mut Context<'_>,
        session: SessionId,
        backend: DescriptorId,
        packet: Buffer,
        meta: &PacketMeta,
    ) {
        let Some(entry) = self.sessions.get_mut(session) else {
            return;
        };
        entry.greeted = true;
        let client = entry.client;

        let first = packet.byte_at(HEADER_LEN);
        if let Err(e) = ctx.write(client, packet) {
            trace!(descriptor = %client, error = %e, "Reply dropped");
            return;
        }

        // Forwarding the server's verdict completes the client's handshake
        if meta.kind == PacketKind::Handshake
            && ctx.phase(client).is_ok_and(|p| p == Phase::Command)
        {
            if first == Some(reply::ERR) {
                debug!(worker = self.worker, session = %session, "Authentication rejected");
                entry.closing = true;
                let _ = ctx.close(client);
                let _ = ctx.close(backend);
                return;
            }
            for id in [client, backend] {
                if let Err(e) = ctx.mark_active(id) {
                    debug!(descriptor = %id, error = %e, "Could not activate");
                }
            }
            debug!(worker = self.worker, session = %session, "Session authenticated");
        }
    }

    fn from_client(
        &mut self,
        ctx: &mut Context<'_>,
        session: SessionId,
        packet: Buffer,
        meta: &PacketMeta,
    ) {
        let Some(entry) = self.sessions.get_mut(session) else {
            return;
        };
        if entry.closing {
            return;
        }
        let Some(backend) = entry.primary() else {
            return;
        };
        let client = entry.client;

        if let PacketKind::Command(info) = &meta.kind {
            match info.command {
                Command::Quit => {
                    entry.closing = true;
                    if ctx.state(backend).is_ok_and(|s| s == DescriptorState::Active) {
                        let _ = ctx.write(backend, packet);
                    }
                    let _ = ctx.close(backend);
                    let _ = ctx.close(client);
                    return;
                }
                Command::ResetConnection => entry.history.clear(),
                Command::ChangeUser => {
                    entry.history.clear();
                    for id in [client, backend] {
                        if let Err(e) = ctx.mark_authenticating(id) {
                            debug!(
                                descriptor = %id,
                                error = %e,
                                "Could not restart authentication"
                            );
                        }
                    }
                }
                _ if info.session_command => entry.history.push(&packet),
                _ => {}
            }
        }

        if let Err(e) = ctx.write(backend, packet) {
            debug!(descriptor = %backend, error = %e, "Command dropped");
        }
    }
}

impl Router for PassthroughRouter {
    fn on_client_accepted(&mut self, ctx: &mut Context<'_>, client: DescriptorId) {
        let session = self.sessions.open(client);
        let _ = ctx.set_session(client, Some(session));

        match ctx.open_backend(BackendTarget::new(self.settings.backend)) {
            Ok(backend) => {
                self.sessions.attach_backend(session, backend);
                let _ = ctx.set_session(backend, Some(session));
                debug!(
                    worker = self.worker,
                    session = %session,
                    client = %client,
                    backend = %backend,
                    "Session opened"
                );
            }
            Err(e) => {
                warn!(
                    worker = self.worker,
                    backend = %self.settings.backend,
                    error = %e,
                    "Backend unavailable"
                );
                let message = format!("Can't connect to backend: {}", e);
                self.fail_client(ctx, session, 0, errcode::CONNECTION_ERROR, &message);
            }
        }
    }

    fn on_backend_connected(&mut self, ctx: &mut Context<'_>, backend: DescriptorId) {
        trace!(
            worker = ctx.worker_id(),
            descriptor = %backend,
            "Waiting for server greeting"
        );
    }

    fn on_packet_ready(
        &mut self,
        ctx: &mut Context<'_>,
        id: DescriptorId,
        packet: Buffer,
        meta: PacketMeta,
    ) {
        let Some(session) = self.sessions.lookup(id) else {
            trace!(descriptor = %id, "Packet without session dropped");
            return;
        };
        match ctx.role(id) {
            Ok(Role::Backend) => self.from_backend(ctx, session, id, packet, &meta),
            Ok(Role::Client) => self.from_client(ctx, session, packet, &meta),
            Err(_) => {}
        }
    }

    fn on_descriptor_error(
        &mut self,
        ctx: &mut Context<'_>,
        id: DescriptorId,
        reason: &CloseReason,
    ) -> ErrorAction {
        let Some(session) = self.sessions.lookup(id) else {
            return ErrorAction::Close;
        };
        let Some(entry) = self.sessions.get(session) else {
            return ErrorAction::Close;
        };
        let client = entry.client;
        let greeted = entry.greeted;

        if id == client {
            if reason.is_protocol() {
                let seq = Self::reply_seq(ctx, client, true);
                let message = format!("Malformed packet: {}", reason);
                let err = error_packet(seq, errcode::MALFORMED_PACKET, "08S01", &message);
                let _ = ctx.write(client, err);
                return ErrorAction::Drain;
            }
            return ErrorAction::Close;
        }

        // Nothing reached the client yet, so a fresh connection is invisible
        let attempts = ctx.reconnect_attempts(id).unwrap_or(u32::MAX);
        if !greeted && reason.is_network() && attempts < self.settings.max_reconnect_attempts {
            info!(
                worker = self.worker,
                descriptor = %id,
                attempt = attempts + 1,
                reason = %reason,
                "Backend failed before greeting, reconnecting"
            );
            if let Err(e) = ctx.reset_transaction(client) {
                debug!(descriptor = %client, error = %e, "Could not reset transaction state");
            }
            return ErrorAction::Reconnect;
        }

        warn!(
            worker = self.worker,
            session = %session,
            backend = %id,
            reason = %reason,
            "Backend lost"
        );
        let seq = Self::reply_seq(ctx, client, greeted);
        let message = format!("Lost connection to backend: {}", reason);
        self.fail_client(ctx, session, seq, errcode::SERVER_LOST, &message);
        ErrorAction::Close
    }

    fn on_descriptor_closed(&mut self, ctx: &mut Context<'_>, id: DescriptorId) {
        let Some(session) = self.sessions.lookup(id) else {
            return;
        };
        let is_client = self
            .sessions
            .get(session)
            .is_some_and(|entry| entry.client == id);

        if is_client {
            let Some(entry) = self.sessions.remove(session) else {
                return;
            };
            for backend in entry.backends {
                // Let the server end the session cleanly
                if ctx.state(backend).is_ok_and(|s| s == DescriptorState::Active) {
                    let _ = ctx.write(backend, command_packet(Command::Quit, &[]));
                }
                let _ = ctx.set_session(backend, None);
                let _ = ctx.close(backend);
            }
            debug!(worker = self.worker, session = %session, "Session closed");
            return;
        }

        self.sessions.detach_backend(id);
        if let Some(entry) = self.sessions.get_mut(session) {
            entry.closing = true;
            let _ = ctx.close(entry.client);
        }
    }
}
