//! osmo-relay: relay transport for the osmo sync engine.
//!
//! Each remote peer is a virtual relay-protocol participant: encrypted,
//! signed events published on store-and-forward pubsub relays. Per peer,
//! two half-duplex machines run independently: [`send::PeerSend`]
//! authors the outbound CHANGES chain, [`recv::PeerRecv`] follows the
//! remote's chain with causal reordering and a resync handshake. The
//! per-peer stream cursors are the only engine state that survives
//! restarts ([`store`]).

pub mod error;
pub mod event;
pub mod recv;
pub mod relay;
pub mod send;
pub mod store;
pub mod transport;

pub use error::RelayError;
pub use event::{KIND_CHANGES, KIND_CURSOR, RelayEvent};
pub use recv::{PeerRecv, PeerRecvConfig};
pub use relay::{Filter, MemoryRelay, Relay, RelaySet, SubMessage, Subscription};
pub use send::{PeerSend, PeerSendConfig, SendGate};
pub use store::{
    MemoryStateStore, PeerSpec, PeerStore, SqlitePeerStore, SqliteStateStore, StateStore,
    StaticPeerStore, StreamState,
};
pub use transport::{MemoryHub, RelayConnector, RelayTransport, RelayTransportConfig};
