//! Session bookkeeping.
//!
//! A session ties one client descriptor to the backend descriptors serving
//! it. The table owns that association; descriptors only carry the
//! [`SessionId`] as a back-reference, so dropping a session never leaves a
//! descriptor pointing at freed state: a stale id simply fails to resolve.

use crate::buffer::Buffer;
use crate::descriptor::DescriptorId;
use std::collections::{HashMap, VecDeque};
use std::fmt;

/// Generational handle to a session in a [`SessionTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId {
    index: u32,
    generation: u32,
}

impl SessionId {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}.{}", self.index, self.generation)
    }
}

/// Session commands seen on the client, oldest first.
///
/// Holds shallow clones of the forwarded packets, so recording costs no
/// copy. Once `capacity` is reached the oldest entry is dropped.
#[derive(Debug)]
pub struct SessionCommandHistory {
    commands: VecDeque<Buffer>,
    capacity: usize,
    dropped: u64,
}

impl SessionCommandHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            commands: VecDeque::new(),
            capacity,
            dropped: 0,
        }
    }

    pub fn push(&mut self, packet: &Buffer) {
        if self.capacity == 0 {
            self.dropped += 1;
            return;
        }
        if self.commands.len() == self.capacity {
            self.commands.pop_front();
            self.dropped += 1;
        }
        self.commands.push_back(packet.clone_shallow());
    }

    /// Forgets everything, e.g. after `COM_RESET_CONNECTION`.
    pub fn clear(&mut self) {
        self.commands.clear();
    }

    /// Packets to replay on a new backend, in the order they were sent.
    pub fn replay(&self) -> impl Iterator<Item = Buffer> + '_ {
        self.commands.iter().map(Buffer::clone_shallow)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Commands evicted because the history was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// One client and the backends serving it.
#[derive(Debug)]
pub struct Session {
    pub client: DescriptorId,
    pub backends: Vec<DescriptorId>,
    pub history: SessionCommandHistory,
    /// The backend has sent something to the client
    pub greeted: bool,
    /// Teardown started; further client packets are dropped
    pub closing: bool,
}

impl Session {
    fn new(client: DescriptorId, history_capacity: usize) -> Self {
        Self {
            client,
            backends: Vec::new(),
            history: SessionCommandHistory::new(history_capacity),
            greeted: false,
            closing: false,
        }
    }

    /// The backend commands are forwarded to.
    pub fn primary(&self) -> Option<DescriptorId> {
        self.backends.first().copied()
    }
}

#[derive(Debug, Default)]
struct SessionSlot {
    generation: u32,
    session: Option<Session>,
}

/// Sessions of one worker plus a descriptor-to-session index.
#[derive(Debug, Default)]
pub struct SessionTable {
    slots: Vec<SessionSlot>,
    free: Vec<u32>,
    by_descriptor: HashMap<DescriptorId, SessionId>,
    history_capacity: usize,
}

impl SessionTable {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            history_capacity,
            ..Default::default()
        }
    }

    /// Starts a session for `client`.
    pub fn open(&mut self, client: DescriptorId) -> SessionId {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(SessionSlot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.session = Some(Session::new(client, self.history_capacity));
        let id = SessionId {
            index,
            generation: slot.generation,
        };
        self.by_descriptor.insert(client, id);
        id
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.session.as_ref())
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.session.as_mut())
    }

    /// Session that `descriptor` belongs to, as client or backend.
    pub fn lookup(&self, descriptor: DescriptorId) -> Option<SessionId> {
        self.by_descriptor.get(&descriptor).copied()
    }

    pub fn attach_backend(&mut self, id: SessionId, backend: DescriptorId) -> bool {
        let Some(session) = self.get_mut(id) else {
            return false;
        };
        session.backends.push(backend);
        self.by_descriptor.insert(backend, id);
        true
    }

    /// Unlinks a backend, returning its session.
    pub fn detach_backend(&mut self, backend: DescriptorId) -> Option<SessionId> {
        let id = self.by_descriptor.remove(&backend)?;
        if let Some(session) = self.get_mut(id) {
            session.backends.retain(|b| *b != backend);
        }
        Some(id)
    }

    /// Ends a session. Every id of the session stops resolving.
    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)?;
        let session = slot.session.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);

        self.by_descriptor.remove(&session.client);
        for backend in &session.backends {
            self.by_descriptor.remove(backend);
        }
        Some(session)
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
