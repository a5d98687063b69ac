//! Transaction Tracking
//!
//! Follows the transaction state of a client session by observing the
//! classified commands it sends. The state is attached to every command the
//! parser emits so a router can keep a transaction on one backend.

use crate::protocol::classify::{CommandInfo, TypeMask};
use crate::protocol::types::Command;

/// Transaction state as seen by one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrxState {
    pub autocommit: bool,
    /// A transaction is open while this command runs
    pub active: bool,
    /// The open transaction was started `READ ONLY`
    pub read_only: bool,
    /// This command opened the transaction
    pub starting: bool,
    /// This command ends the transaction
    pub ending: bool,
}

impl Default for TrxState {
    fn default() -> Self {
        Self {
            autocommit: true,
            active: false,
            read_only: false,
            starting: false,
            ending: false,
        }
    }
}

/// Tracks explicit and implicit transactions of one client session.
#[derive(Debug, Clone, Default)]
pub struct TransactionTracker {
    autocommit: bool,
    active: bool,
    read_only: bool,
    initialized: bool,
}

impl TransactionTracker {
    pub fn new() -> Self {
        Self {
            autocommit: true,
            active: false,
            read_only: false,
            initialized: true,
        }
    }

    /// Current state between commands.
    pub fn state(&self) -> TrxState {
        TrxState {
            autocommit: self.autocommit(),
            active: self.active,
            read_only: self.read_only,
            starting: false,
            ending: false,
        }
    }

    fn autocommit(&self) -> bool {
        !self.initialized || self.autocommit
    }

    /// Updates the state with `info` and returns the state that applies to
    /// the command itself.
    pub fn observe(&mut self, info: &CommandInfo) -> TrxState {
        if !self.initialized {
            *self = Self::new();
        }

        if matches!(info.command, Command::ResetConnection | Command::ChangeUser) {
            *self = Self::new();
            return self.state();
        }

        let mask = info.type_mask;
        let mut snapshot = self.state();

        // With autocommit off, any statement after the end of a transaction
        // implicitly opens the next one.
        if !self.autocommit && !self.active && !mask.intersects(TypeMask::ENABLE_AUTOCOMMIT) {
            self.active = true;
            self.read_only = false;
            snapshot.active = true;
            snapshot.starting = true;
        }

        if mask.contains(TypeMask::DISABLE_AUTOCOMMIT) {
            self.autocommit = false;
            snapshot.autocommit = false;
            if !self.active {
                self.active = true;
                snapshot.active = true;
                snapshot.starting = true;
            }
        } else if mask.contains(TypeMask::ENABLE_AUTOCOMMIT) {
            snapshot.ending = self.active;
            self.autocommit = true;
            self.active = false;
            self.read_only = false;
        } else if mask.contains(TypeMask::BEGIN_TRX) {
            // BEGIN inside a transaction implicitly commits it first. AND
            // CHAIN ends it explicitly and keeps its access mode.
            let chained = mask.intersects(TypeMask::COMMIT | TypeMask::ROLLBACK);
            snapshot.ending = chained && self.active;
            self.active = true;
            if !chained {
                self.read_only = mask.contains(TypeMask::READONLY);
            }
            snapshot.active = true;
            snapshot.starting = true;
            snapshot.read_only = self.read_only;
        } else if mask.intersects(TypeMask::COMMIT | TypeMask::ROLLBACK) {
            snapshot.ending = self.active;
            self.active = false;
            self.read_only = false;
        }

        snapshot
    }

    /// Forgets everything, e.g. after the backend connection was replaced.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}
