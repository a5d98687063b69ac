//! Worker Pool
//!
//! Starts the worker threads and is the only way into them from the
//! outside. Every operation on the pool becomes a message on one or more
//! worker task queues.
//!
//! ## Broadcasts
//!
//! ```text
//!   caller ──Broadcast(f, wg)──> worker 0 ── f(ctx); drop(wg) ─┐
//!          ──Broadcast(f, wg)──> worker 1 ── f(ctx); drop(wg) ─┤
//!          ──Broadcast(f, wg)──> worker N ── f(ctx); drop(wg) ─┤
//!          wg.wait() <─────────────────────────────────────────┘
//! ```
//!
//! A worker waiting for a broadcast that includes itself would never get
//! to run its own share, so blocking operations refuse to run on a worker
//! thread.

use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::session::RouterFactory;
use crate::worker::context::Context;
use crate::worker::event_loop::{current_worker, Worker, WorkerParts, WAKER};
use crate::worker::local::{SlotKey, SlotRegistry};
use crate::worker::stats::{WorkerLoad, WorkerStats};
use crate::worker::task::{Mailbox, Task};
use crossbeam_utils::sync::WaitGroup;
use mio::{Poll, Waker};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Cloneable handle for submitting work to the pool.
#[derive(Debug, Clone)]
pub struct PoolHandle {
    mailboxes: Arc<Vec<Mailbox>>,
    load: Arc<WorkerLoad>,
    slots: Arc<SlotRegistry>,
}

impl PoolHandle {
    pub fn workers(&self) -> usize {
        self.mailboxes.len()
    }

    fn mailbox(&self, worker: usize) -> CoreResult<&Mailbox> {
        self.mailboxes
            .get(worker)
            .ok_or(CoreError::WorkerGone(worker))
    }

    /// Queues `f` on one worker.
    pub fn post<F>(&self, worker: usize, f: F) -> CoreResult<()>
    where
        F: FnOnce(&mut Context<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        self.mailbox(worker)?.send(Task::Call(Box::new(f)))
    }

    /// Queues `f` on every worker without waiting. Returns how many workers
    /// accepted it.
    pub fn broadcast<F>(&self, f: F) -> usize
    where
        F: Fn(&mut Context<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let f: Arc<dyn Fn(&mut Context<'_>) -> anyhow::Result<()> + Send + Sync> = Arc::new(f);
        let done = WaitGroup::new();
        self.send_all(|_| Task::Broadcast(Arc::clone(&f), done.clone()))
    }

    /// Runs `f` once on every worker and returns when all of them have.
    pub fn broadcast_wait<F>(&self, f: F) -> CoreResult<usize>
    where
        F: Fn(&mut Context<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.refuse_on_worker()?;
        let f: Arc<dyn Fn(&mut Context<'_>) -> anyhow::Result<()> + Send + Sync> = Arc::new(f);
        let done = WaitGroup::new();
        let sent = self.send_all(|_| Task::Broadcast(Arc::clone(&f), done.clone()));
        done.wait();
        Ok(sent)
    }

    /// Collects and merges the counters of every worker.
    pub fn stats(&self) -> CoreResult<WorkerStats> {
        self.refuse_on_worker()?;
        let (tx, rx) = crossbeam_channel::unbounded();
        let done = WaitGroup::new();
        self.send_all(|_| Task::CollectStats(tx.clone(), done.clone()));
        drop(tx);
        done.wait();

        let mut total = WorkerStats::default();
        for stats in rx.try_iter() {
            total.merge(&stats);
        }
        Ok(total)
    }

    /// Registers a worker-local slot. Each worker builds its own instance
    /// with `init` on first access.
    pub fn register_slot<T, I, D>(&self, init: I, destroy: D) -> SlotKey<T>
    where
        T: 'static,
        I: Fn() -> T + Send + Sync + 'static,
        D: Fn(T) + Send + Sync + 'static,
    {
        self.slots.register(init, destroy)
    }

    /// Deletes a slot: every worker destroys its instance on its own thread
    /// before this returns.
    pub fn delete_slot<T>(&self, key: SlotKey<T>) -> CoreResult<()> {
        self.refuse_on_worker()?;
        // Unregister first so no worker can lazily rebuild the instance
        self.slots.unregister(key.id());
        let done = WaitGroup::new();
        self.send_all(|_| Task::DeleteLocal(key.id(), done.clone()));
        done.wait();
        Ok(())
    }

    /// Descriptors currently owned by `worker`.
    pub fn load(&self, worker: usize) -> usize {
        self.load.get(worker)
    }

    fn send_all(&self, mut make: impl FnMut(usize) -> Task) -> usize {
        let mut sent = 0;
        for mailbox in self.mailboxes.iter() {
            match mailbox.send(make(mailbox.worker())) {
                Ok(()) => sent += 1,
                Err(e) => debug!(worker = mailbox.worker(), error = %e, "Broadcast skipped worker"),
            }
        }
        sent
    }

    fn refuse_on_worker(&self) -> CoreResult<()> {
        match current_worker() {
            Some(worker) => Err(CoreError::WouldDeadlock(worker)),
            None => Ok(()),
        }
    }
}

/// The running set of workers.
///
/// Dropping the pool shuts every worker down and joins its thread.
#[derive(Debug)]
pub struct WorkerPool {
    handle: PoolHandle,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `config.workers` workers, each with its own router.
    ///
    /// Returns once every worker's poll instance exists and its thread is
    /// running.
    pub fn start(config: CoreConfig, factory: Arc<dyn RouterFactory>) -> CoreResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let workers = config.workers;

        let mut mailboxes = Vec::with_capacity(workers);
        let mut pending = Vec::with_capacity(workers);
        for id in 0..workers {
            let poll = Poll::new()?;
            let registry = poll.registry().try_clone()?;
            let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
            let (tx, rx) = crossbeam_channel::unbounded();
            mailboxes.push(Mailbox::new(id, tx, waker));
            pending.push((poll, registry, rx));
        }

        let handle = PoolHandle {
            mailboxes: Arc::new(mailboxes),
            load: Arc::new(WorkerLoad::new(workers)),
            slots: Arc::new(SlotRegistry::new()),
        };

        let mut pool = WorkerPool {
            handle,
            threads: Vec::with_capacity(workers),
        };

        for (id, (poll, registry, tasks)) in pending.into_iter().enumerate() {
            let parts = WorkerParts {
                id,
                poll,
                registry,
                tasks,
                config: Arc::clone(&config),
                load: Arc::clone(&pool.handle.load),
                slots: Arc::clone(&pool.handle.slots),
                mailboxes: Arc::clone(&pool.handle.mailboxes),
            };
            let factory = Arc::clone(&factory);
            let thread = thread::Builder::new()
                .name(format!("dbgate-worker-{}", id))
                .spawn(move || {
                    let router = factory.create(id);
                    Worker::new(parts, router).run();
                });

            match thread {
                Ok(thread) => pool.threads.push(thread),
                // Dropping the partial pool stops the workers already running
                Err(e) => return Err(CoreError::Io(e)),
            }
        }

        info!(workers = workers, "Worker pool started");
        Ok(pool)
    }

    pub fn handle(&self) -> PoolHandle {
        self.handle.clone()
    }

    pub fn workers(&self) -> usize {
        self.handle.workers()
    }

    /// Binds a non-blocking listener. Worker 0 accepts and hands each client
    /// to the least loaded worker.
    pub fn listen(&self, addr: SocketAddr) -> CoreResult<SocketAddr> {
        let listener = mio::net::TcpListener::bind(addr)?;
        let local = listener.local_addr()?;
        self.handle.mailbox(0)?.send(Task::Listen(listener))?;
        Ok(local)
    }

    pub fn post<F>(&self, worker: usize, f: F) -> CoreResult<()>
    where
        F: FnOnce(&mut Context<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        self.handle.post(worker, f)
    }

    pub fn broadcast<F>(&self, f: F) -> usize
    where
        F: Fn(&mut Context<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handle.broadcast(f)
    }

    pub fn broadcast_wait<F>(&self, f: F) -> CoreResult<usize>
    where
        F: Fn(&mut Context<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handle.broadcast_wait(f)
    }

    pub fn stats(&self) -> CoreResult<WorkerStats> {
        self.handle.stats()
    }

    pub fn register_slot<T, I, D>(&self, init: I, destroy: D) -> SlotKey<T>
    where
        T: 'static,
        I: Fn() -> T + Send + Sync + 'static,
        D: Fn(T) + Send + Sync + 'static,
    {
        self.handle.register_slot(init, destroy)
    }

    pub fn delete_slot<T>(&self, key: SlotKey<T>) -> CoreResult<()> {
        self.handle.delete_slot(key)
    }

    /// Stops every worker and waits for its thread to exit.
    ///
    /// Descriptors still open are closed with reason `shutdown`.
    pub fn shutdown(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        self.handle.send_all(|_| Task::Shutdown);

        if let Some(worker) = current_worker() {
            warn!(worker = worker, "Pool shut down from a worker thread, not joining");
            self.threads.clear();
            return;
        }
        for thread in self.threads.drain(..) {
            let name = thread.thread().name().unwrap_or("worker").to_string();
            if thread.join().is_err() {
                warn!(thread = %name, "Worker thread panicked");
            }
        }
        info!("Worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
