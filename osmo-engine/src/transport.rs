//! The transport contract.
//!
//! A transport is an abstract bidirectional peer channel. Concrete
//! transports (in-process channel, HTTP+SSE, relay) plug in without the
//! coordinator knowing their medium: the coordinator calls down through
//! this trait, transports call up through the `CoordinatorHandle` they
//! receive on `start`.
//!
//! Transport failures never cross this boundary: `request_sync` and `send`
//! swallow and log their errors. The cursor protocol is idempotent by
//! construction, so the next successful round-trip catches the remote up.

use async_trait::async_trait;

use crate::coordinator::CoordinatorHandle;
use crate::cursor::Cursor;
use crate::error::Error;
use crate::message::PeerMessage;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Short stable name, used in events and logs ("inproc", "http", "relay").
    fn kind(&self) -> &'static str;

    /// Begin operating: connect, accept, subscribe, whatever the medium
    /// needs. The handle is the transport's only channel back into the
    /// coordinator.
    async fn start(&self, handle: CoordinatorHandle) -> Result<(), Error>;

    /// Stop all background work and drop connections.
    async fn stop(&self);

    /// Deliver our sync handshake (our cursor) to the remote peer, asking
    /// it to start its catch-up send toward us. Failures are logged, not
    /// returned.
    async fn request_sync(&self, peer: &str, cursor: &Cursor);

    /// Push a peer message toward the remote. Failures are logged, not
    /// returned.
    async fn send(&self, peer: &str, msg: &PeerMessage);

    /// Liveness flag for hosts that need connection signaling.
    fn connected(&self) -> bool;
}
