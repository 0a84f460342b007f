//! osmo-engine: peer coordinator and data model for the osmo sync engine.
//!
//! osmo diffuses the change stream of a CRDT-aware local database (the
//! **Ledger**) to a dynamic set of remote peers over pluggable transports,
//! converging all replicas without dropped or duplicated writes.
//!
//! This crate holds the transport-independent core:
//!
//! - [`change`] / [`cursor`] / [`message`]: the wire-level data model,
//!   change records, per-site high-water cursors, peer messages.
//! - [`ledger`]: the contract the engine needs from storage, and
//!   [`memory::MemoryLedger`], an in-memory reference implementation.
//! - [`transport`]: the contract concrete transports implement.
//! - [`coordinator`]: the central state machine (peer registry, cursors,
//!   diffusion, serialized callbacks, catch-up sends).
//! - [`inproc`]: a direct channel transport for colocated peers.
//!
//! HTTP/SSE and relay transports live in their own crates (`osmo-http`,
//! `osmo-relay`).

pub mod change;
pub mod coordinator;
pub mod cursor;
pub mod error;
pub mod inproc;
pub mod ledger;
pub mod memory;
pub mod message;
pub mod transport;

pub use change::{ChangeRecord, SiteId, Value};
pub use coordinator::{Coordinator, CoordinatorConfig, CoordinatorHandle, SyncEvent};
pub use cursor::Cursor;
pub use error::Error;
pub use ledger::Ledger;
pub use message::PeerMessage;
pub use transport::Transport;
