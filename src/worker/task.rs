//! Cross-thread task messages.
//!
//! Other threads never touch a worker's descriptors. They send one of these
//! messages through the worker's [`Mailbox`] instead, and the worker runs it
//! between two rounds of I/O dispatch, in the order the messages were sent.

use crate::error::{CoreError, CoreResult};
use crate::worker::context::Context;
use crate::worker::local::SlotId;
use crate::worker::stats::WorkerStats;
use crossbeam_channel::Sender;
use crossbeam_utils::sync::WaitGroup;
use mio::Waker;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// A one-shot closure run on a single worker.
pub type TaskFn = Box<dyn FnOnce(&mut Context<'_>) -> anyhow::Result<()> + Send>;

/// A closure run once on every worker.
pub type SharedTaskFn = Arc<dyn Fn(&mut Context<'_>) -> anyhow::Result<()> + Send + Sync>;

pub enum Task {
    /// Take ownership of an accepted client connection
    Adopt(mio::net::TcpStream, SocketAddr),
    /// Start accepting clients on this listener
    Listen(mio::net::TcpListener),
    Call(TaskFn),
    /// One worker's share of a broadcast; the wait group is released when
    /// the task is dropped
    Broadcast(SharedTaskFn, WaitGroup),
    /// Destroy this worker's instance of a local slot
    DeleteLocal(SlotId, WaitGroup),
    CollectStats(Sender<WorkerStats>, WaitGroup),
    Shutdown,
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Task::Adopt(..) => "adopt",
            Task::Listen(_) => "listen",
            Task::Call(_) => "call",
            Task::Broadcast(..) => "broadcast",
            Task::DeleteLocal(..) => "delete_local",
            Task::CollectStats(..) => "collect_stats",
            Task::Shutdown => "shutdown",
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Adopt(_, addr) => write!(f, "Task::Adopt({})", addr),
            Task::DeleteLocal(slot, _) => write!(f, "Task::DeleteLocal({})", slot),
            other => write!(f, "Task::{}", other.name()),
        }
    }
}

/// Sending half of a worker's task queue.
///
/// Every send wakes the worker's poll so the task runs without waiting for
/// the poll timeout.
#[derive(Clone)]
pub struct Mailbox {
    worker: usize,
    tx: Sender<Task>,
    waker: Arc<Waker>,
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("worker", &self.worker)
            .field("queued", &self.tx.len())
            .finish()
    }
}

impl Mailbox {
    pub fn new(worker: usize, tx: Sender<Task>, waker: Arc<Waker>) -> Self {
        Self { worker, tx, waker }
    }

    pub fn worker(&self) -> usize {
        self.worker
    }

    /// Queues `task`; fails once the worker has exited.
    pub fn send(&self, task: Task) -> CoreResult<()> {
        self.tx
            .send(task)
            .map_err(|_| CoreError::WorkerGone(self.worker))?;
        self.waker.wake()?;
        Ok(())
    }

    /// Tasks waiting to run.
    pub fn queued(&self) -> usize {
        self.tx.len()
    }
}
