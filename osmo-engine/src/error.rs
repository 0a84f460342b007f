//! Engine-wide error type.

/// Errors surfaced by the engine and the Ledger contract.
///
/// Transport-internal failures never appear here: transports swallow and
/// log their own errors and catch the remote up via the cursor protocol.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The coordinator has been stopped or dropped; the callback was a no-op.
    #[error("coordinator stopped")]
    Stopped,

    /// The Ledger refused or failed an operation.
    #[error("ledger: {0}")]
    Ledger(String),

    /// A change record failed validation before apply.
    #[error("invalid change record: {0}")]
    InvalidRecord(String),

    /// A malformed identifier on the wire (site id, hex field).
    #[error("malformed identifier: {0}")]
    BadIdentifier(String),
}
