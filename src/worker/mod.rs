//! Routing Workers
//!
//! A fixed pool of OS threads, each running its own event loop and owning
//! every descriptor it was handed for that descriptor's whole life.
//!
//! ## Architecture
//!
//! ```text
//!                      ┌────────────────────────┐
//!   accept ──────────> │ worker 0 (listener)    │── least loaded ──┐
//!                      └────────────────────────┘                  │
//!                                                                  ▼
//!   ┌──────────────┐   ┌──────────────┐         ┌──────────────┐
//!   │ worker 0     │   │ worker 1     │   ...   │ worker N     │
//!   │  mio::Poll   │   │  mio::Poll   │         │  mio::Poll   │
//!   │  descriptors │   │  descriptors │         │  descriptors │
//!   │  router      │   │  router      │         │  router      │
//!   │  locals      │   │  locals      │         │  locals      │
//!   └──────▲───────┘   └──────▲───────┘         └──────▲───────┘
//!          │ Mailbox          │                        │
//!          └──────────────────┴─── PoolHandle ─────────┘
//! ```
//!
//! ## Modules
//!
//! - `event_loop`: the per-thread loop and the descriptor arena
//! - `context`: what callbacks and tasks may touch
//! - `pool`: spawning, broadcasts, stats, shutdown
//! - `task`: cross-thread messages
//! - `local`: worker-local storage
//! - `stats`: per-worker counters

pub mod context;
pub mod event_loop;
pub mod local;
pub mod pool;
pub mod stats;
pub mod task;

pub use context::Context;
pub use event_loop::{current_worker, Worker};
pub use local::{LocalStorage, SlotId, SlotKey, SlotRegistry};
pub use pool::{PoolHandle, WorkerPool};
pub use stats::{WorkerLoad, WorkerStats};
pub use task::{Mailbox, SharedTaskFn, Task, TaskFn};
