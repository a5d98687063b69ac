//! Sessions and Routing
//!
//! The policy layer on top of the worker core:
//!
//! - [`Router`]: the callbacks a worker drives, one instance per worker
//! - [`SessionTable`]: which backends serve which client
//! - [`PassthroughRouter`]: one backend per client, forwarded verbatim

pub mod passthrough;
pub mod router;
pub mod table;

pub use passthrough::{factory as passthrough_factory, PassthroughRouter, PassthroughSettings};
pub use router::{ErrorAction, Router, RouterFactory};
pub use table::{Session, SessionCommandHistory, SessionId, SessionTable};
