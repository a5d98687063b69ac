//! Role-specific descriptor behavior.
//!
//! A descriptor *holds* a handler; it is never one. The handler is a tagged
//! variant so the hot path dispatches with a `match` instead of a vtable.

use crate::clock;
use crate::protocol::{Packet, PacketKind, Role, TransactionTracker, TrxState};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

/// Opaque login material for a backend. Never logged.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    secret: Vec<u8>,
}

impl Credentials {
    pub fn new(user: impl Into<String>, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            user: user.into(),
            secret: secret.into(),
        }
    }

    pub fn secret(&self) -> &[u8] {
        &self.secret
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Where a backend descriptor connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTarget {
    pub address: SocketAddr,
    pub credentials: Option<Credentials>,
}

impl BackendTarget {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }
}

/// Client-facing half: follows the session's transaction state.
#[derive(Debug, Default)]
pub struct ClientHandler {
    tracker: TransactionTracker,
}

impl ClientHandler {
    pub fn new() -> Self {
        Self {
            tracker: TransactionTracker::new(),
        }
    }

    pub fn trx_state(&self) -> TrxState {
        self.tracker.state()
    }
}

/// Backend-facing half: connection target and reconnect bookkeeping.
#[derive(Debug)]
pub struct BackendHandler {
    target: BackendTarget,
    attempts: u32,
    retry_at: Option<u64>,
}

impl BackendHandler {
    pub fn new(target: BackendTarget) -> Self {
        Self {
            target,
            attempts: 0,
            retry_at: None,
        }
    }

    pub fn target(&self) -> &BackendTarget {
        &self.target
    }

    /// Reconnect attempts since the connection was last ACTIVE.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn retry_at(&self) -> Option<u64> {
        self.retry_at
    }

    /// Schedules the next reconnect attempt and returns its delay.
    pub fn schedule_retry(&mut self, now: u64, base: Duration, max: Duration) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        let delay = backoff_delay(self.attempts, base, max);
        self.retry_at = Some(now + clock::ticks_for(delay).max(1));
        delay
    }

    pub fn retry_due(&self, now: u64) -> bool {
        self.retry_at.is_some_and(|at| now >= at)
    }

    pub(crate) fn clear_retry(&mut self) {
        self.retry_at = None;
    }

    pub(crate) fn connected(&mut self) {
        self.attempts = 0;
        self.retry_at = None;
    }
}

/// `base * 2^(attempt - 1)`, capped at `max`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent).unwrap_or(max).min(max)
}

/// The capability a descriptor holds for its role.
#[derive(Debug)]
pub enum Handler {
    Client(ClientHandler),
    Backend(BackendHandler),
}

impl Handler {
    pub fn client() -> Self {
        Handler::Client(ClientHandler::new())
    }

    pub fn backend(target: BackendTarget) -> Self {
        Handler::Backend(BackendHandler::new(target))
    }

    pub fn role(&self) -> Role {
        match self {
            Handler::Client(_) => Role::Client,
            Handler::Backend(_) => Role::Backend,
        }
    }

    pub fn as_backend(&self) -> Option<&BackendHandler> {
        match self {
            Handler::Backend(backend) => Some(backend),
            Handler::Client(_) => None,
        }
    }

    pub fn as_backend_mut(&mut self) -> Option<&mut BackendHandler> {
        match self {
            Handler::Backend(backend) => Some(backend),
            Handler::Client(_) => None,
        }
    }

    pub fn as_client(&self) -> Option<&ClientHandler> {
        match self {
            Handler::Client(client) => Some(client),
            Handler::Backend(_) => None,
        }
    }

    /// Annotates freshly parsed packets before they reach the router.
    pub fn on_packets(&mut self, packets: &mut [Packet]) {
        match self {
            Handler::Client(client) => {
                for packet in packets {
                    if let PacketKind::Command(info) = &packet.meta.kind {
                        packet.meta.trx = Some(client.tracker.observe(info));
                    }
                }
            }
            Handler::Backend(_) => {}
        }
    }

    /// Called when the session's backend connection was replaced; a
    /// transaction open on the old connection is gone.
    pub fn on_reset(&mut self) {
        if let Handler::Client(client) = self {
            client.tracker.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{command_packet, Command, PacketParser, Phase};

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(1000);
        assert_eq!(backoff_delay(1, base, max), Duration::from_millis(100));
        assert_eq!(backoff_delay(2, base, max), Duration::from_millis(200));
        assert_eq!(backoff_delay(4, base, max), Duration::from_millis(800));
        assert_eq!(backoff_delay(5, base, max), max);
        assert_eq!(backoff_delay(60, base, max), max);
    }

    #[test]
    fn test_schedule_retry() {
        let target = BackendTarget::new("127.0.0.1:3306".parse().unwrap());
        let mut backend = BackendHandler::new(target);
        let delay = backend.schedule_retry(10, Duration::from_millis(200), Duration::from_secs(5));
        assert_eq!(delay, Duration::from_millis(200));
        assert_eq!(backend.retry_at(), Some(12));
        assert!(!backend.retry_due(11));
        assert!(backend.retry_due(12));

        backend.schedule_retry(12, Duration::from_millis(200), Duration::from_secs(5));
        assert_eq!(backend.attempts(), 2);
        assert_eq!(backend.retry_at(), Some(16));

        backend.connected();
        assert_eq!(backend.attempts(), 0);
    }

    #[test]
    fn test_client_handler_tracks_transactions() {
        let mut parser = PacketParser::with_defaults(Role::Client);
        parser.set_phase(Phase::Command);
        let mut buf = command_packet(Command::Query, b"BEGIN");
        buf.append_buffer(command_packet(Command::Query, b"SELECT 1"));
        let mut packets = parser.feed(&mut buf).packets;

        let mut handler = Handler::client();
        handler.on_packets(&mut packets);
        assert!(packets[0].meta.trx.is_some_and(|t| t.starting));
        assert!(packets[1].meta.trx.is_some_and(|t| t.active && !t.starting));
        assert!(handler.as_client().is_some_and(|c| c.trx_state().active));

        handler.on_reset();
        assert!(handler.as_client().is_some_and(|c| !c.trx_state().active));
    }

    #[test]
    fn test_credentials_are_redacted() {
        let creds = Credentials::new("app", b"hunter2".to_vec());
        let shown = format!("{:?}", creds);
        assert!(shown.contains("app"));
        assert!(!shown.contains("hunter2"));
    }
}
