//! osmo-http: HTTP/SSE transport for the osmo sync engine.
//!
//! Request/response for send, server-sent events for receive. The client
//! side ([`client::HttpSseTransport`]) talks to exactly one remote peer
//! per endpoint and reconnects with exponential backoff; the server side
//! ([`server::HttpServerTransport`]) maintains one SSE channel per peer
//! id and routes POSTs to the hosting coordinator.

pub mod client;
pub mod envelope;
pub mod server;
pub mod sse;

pub use client::{HttpClientConfig, HttpSseTransport};
pub use envelope::TransportMessage;
pub use server::{HttpServerConfig, HttpServerTransport};
