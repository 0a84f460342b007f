//! Relay transport error type.

/// Errors inside the relay transport. These never reach the coordinator:
/// the send/recv state machines retry, resync, or abort on their own.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Signature, key, or AEAD failure.
    #[error("crypto: {0}")]
    Crypto(String),

    /// A relay refused or failed an operation.
    #[error("relay: {0}")]
    Relay(String),

    /// The persistent state store failed.
    #[error("store: {0}")]
    Store(String),

    /// The event chain cannot be followed; a resync is required.
    #[error("stream broken: {0}")]
    StreamBroken(String),

    /// Applying a received batch failed; the recv stream is aborted.
    #[error("apply aborted: {0}")]
    Aborted(String),

    /// Wire payload did not parse.
    #[error("payload: {0}")]
    Payload(String),
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::Payload(e.to_string())
    }
}
