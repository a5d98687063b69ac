//! # dbgate - A Multi-Threaded MySQL/MariaDB Gateway Core
//!
//! dbgate sits between database clients and MySQL/MariaDB servers. Clients
//! connect to the gateway, which opens backend connections on their behalf
//! and moves protocol packets between the two sides.
//!
//! ## Features
//!
//! - **Thread-per-core workers**: each worker owns a `mio` poll instance and
//!   every descriptor placed on it, so the data path takes no locks
//! - **Packet framing**: MySQL frames are reassembled into logical packets
//!   with sequence-number validation before any routing decision
//! - **Zero-copy buffers**: chained `bytes::Bytes` segments shared between
//!   the read path, the router and the write queue
//! - **Graceful draining**: a closing connection flushes what is queued, up
//!   to a bounded drain timeout
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                dbgate                                   │
//! │                                                                         │
//! │  ┌─────────────┐   Adopt    ┌─────────────────────────────────────────┐ │
//! │  │  Listener   │──────────> │ Worker N (own thread, own mio::Poll)    │ │
//! │  │ (worker 0)  │            │                                         │ │
//! │  └─────────────┘            │  Descriptor ──> PacketParser ──> Router │ │
//! │                             │      ▲                              │   │ │
//! │  ┌─────────────┐  Mailbox   │      └──────── write queue <────────┘   │ │
//! │  │ PoolHandle  │──────────> │                                         │ │
//! │  │ (any thread)│            │  LocalStorage   WorkerStats   Sessions  │ │
//! │  └─────────────┘            └─────────────────────────────────────────┘ │
//! │                                              ▲                          │
//! │                     ┌────────────────────────┴────────────────────────┐ │
//! │                     │        Heartbeat (background tokio task)        │ │
//! │                     └─────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use dbgate::clock::Heartbeat;
//! use dbgate::config::CoreConfig;
//! use dbgate::session::{passthrough_factory, PassthroughSettings};
//! use dbgate::worker::WorkerPool;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let _heartbeat = Heartbeat::start();
//!
//!     let settings = PassthroughSettings::new("127.0.0.1:3306".parse()?);
//!     let pool = WorkerPool::start(CoreConfig::default(), passthrough_factory(settings))?;
//!     pool.listen("127.0.0.1:4006".parse()?)?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`buffer`]: chained, shared byte buffers
//! - [`protocol`]: framing, sequence policy, command classification
//! - [`descriptor`]: one connection endpoint and its lifecycle
//! - [`worker`]: event loops, cross-thread tasks, worker-local storage
//! - [`session`]: the router interface and the passthrough router
//! - [`clock`]: the coarse heartbeat used for timeouts
//! - [`config`]: `gateway.toml` loading and validation
//!
//! ## Design Highlights
//!
//! ### Thread Affinity
//!
//! A descriptor is created on, and only ever touched by, the worker that
//! owns it. Other threads send closures through the worker's mailbox; the
//! closures run between two rounds of I/O.
//!
//! ### Fairness
//!
//! A single descriptor reads at most `max_read_per_call` bytes per readiness
//! event. Leftover input is resumed on the next round, after every other
//! ready descriptor had its turn.

pub mod buffer;
pub mod clock;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod protocol;
pub mod session;
pub mod worker;

// Re-export commonly used types for convenience
pub use buffer::{Buffer, BufferFlags};
pub use config::{CoreConfig, GatewayConfig};
pub use descriptor::{BackendTarget, Descriptor, DescriptorId, DescriptorState};
pub use error::{CloseReason, CoreError, CoreResult, ProtocolError};
pub use protocol::{PacketMeta, PacketParser};
pub use session::{ErrorAction, PassthroughRouter, Router, RouterFactory};
pub use worker::{Context, PoolHandle, WorkerPool, WorkerStats};

/// The default client-facing port
pub const DEFAULT_PORT: u16 = 4006;

/// Version of dbgate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
