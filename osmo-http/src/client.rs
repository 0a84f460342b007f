//! HTTP/SSE client transport.
//!
//! Sends via HTTP POST (`/sync` and `/data`), receives via a server-sent
//! event stream (`/stream?peerId=<local>`). Exactly one remote peer per
//! endpoint. Delivery is strictly single-threaded: incoming events are
//! applied sequentially in the read loop, so application of message N+1
//! cannot start before N completes.
//!
//! On any error or stream close the client reconnects with exponential
//! backoff (1 s doubling to a 30 s cap); a successful stream resets the
//! counter. While disconnected, one synthetic disconnect is reported to
//! the coordinator, under the fixed identifier `"server"` until a
//! `connect` envelope has named the real peer id.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::task::JoinHandle;

use osmo_engine::coordinator::CoordinatorHandle;
use osmo_engine::cursor::Cursor;
use osmo_engine::error::Error;
use osmo_engine::message::PeerMessage;
use osmo_engine::transport::Transport;

use crate::envelope::TransportMessage;
use crate::sse::SseParser;

/// Peer id reported for the remote before its real id is learned.
const FALLBACK_PEER: &str = "server";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Base URL of the remote endpoint, e.g. `http://127.0.0.1:8080`.
    pub base_url: String,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl HttpClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

struct ClientShared {
    config: HttpClientConfig,
    http: reqwest::Client,
    local: parking_lot::Mutex<Option<String>>,
    server_peer: parking_lot::Mutex<Option<String>>,
    connected: AtomicBool,
    stopping: AtomicBool,
}

impl ClientShared {
    fn remote_peer(&self) -> String {
        self.server_peer
            .lock()
            .clone()
            .unwrap_or_else(|| FALLBACK_PEER.to_string())
    }

    /// POST an envelope; transport failures are swallowed and logged.
    async fn post(&self, path: &str, msg: &TransportMessage) {
        let url = format!("{}{path}", self.config.base_url);
        match self.http.post(&url).json(msg).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                tracing::warn!(url = %url, status = %resp.status(), "http send rejected");
            }
            Err(e) => {
                tracing::warn!(url = %url, "http send failed: {e}");
            }
        }
    }
}

/// The client half of the HTTP/SSE transport.
pub struct HttpSseTransport {
    shared: Arc<ClientShared>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl HttpSseTransport {
    pub fn new(config: HttpClientConfig) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(ClientShared {
                config,
                http: reqwest::Client::new(),
                local: parking_lot::Mutex::new(None),
                server_peer: parking_lot::Mutex::new(None),
                connected: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
            }),
            task: parking_lot::Mutex::new(None),
        })
    }
}

#[async_trait]
impl Transport for HttpSseTransport {
    fn kind(&self) -> &'static str {
        "http"
    }

    async fn start(&self, handle: CoordinatorHandle) -> Result<(), Error> {
        let local = handle.local_site_id().await?.to_string();
        *self.shared.local.lock() = Some(local);
        let shared = self.shared.clone();
        let task = tokio::spawn(run_stream(shared, handle));
        *self.task.lock() = Some(task);
        Ok(())
    }

    async fn stop(&self) {
        self.shared.stopping.store(true, Ordering::Relaxed);
        self.shared.connected.store(false, Ordering::Relaxed);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    async fn request_sync(&self, _peer: &str, cursor: &Cursor) {
        let local = match self.shared.local.lock().clone() {
            Some(local) => local,
            None => return,
        };
        self.shared
            .post(
                "/sync",
                &TransportMessage::Sync {
                    peer_id: local,
                    cursor: cursor.clone(),
                },
            )
            .await;
    }

    async fn send(&self, _peer: &str, msg: &PeerMessage) {
        let local = match self.shared.local.lock().clone() {
            Some(local) => local,
            None => return,
        };
        self.shared
            .post(
                "/data",
                &TransportMessage::Data {
                    peer_id: local,
                    data: msg.clone(),
                },
            )
            .await;
    }

    fn connected(&self) -> bool {
        self.shared.connected.load(Ordering::Relaxed)
    }
}

/// The reconnecting SSE read loop.
async fn run_stream(shared: Arc<ClientShared>, handle: CoordinatorHandle) {
    let mut backoff = shared.config.initial_backoff;
    loop {
        if shared.stopping.load(Ordering::Relaxed) {
            return;
        }
        let local = match shared.local.lock().clone() {
            Some(local) => local,
            None => return,
        };
        let url = format!("{}/stream?peerId={local}", shared.config.base_url);
        match shared.http.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(url = %url, "sse stream open");
                let mut stream = resp.bytes_stream();
                let mut parser = SseParser::new();
                let mut got_event = false;
                'read: while let Some(chunk) = stream.next().await {
                    let chunk = match chunk {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            tracing::warn!("sse stream error: {e}");
                            break 'read;
                        }
                    };
                    for event in parser.push(&chunk) {
                        if !got_event {
                            got_event = true;
                            backoff = shared.config.initial_backoff;
                        }
                        apply_event(&shared, &handle, &event.data).await;
                        if shared.stopping.load(Ordering::Relaxed) {
                            return;
                        }
                    }
                }
                tracing::info!("sse stream closed");
            }
            Ok(resp) => {
                tracing::warn!(url = %url, status = %resp.status(), "sse connect rejected");
            }
            Err(e) => {
                tracing::warn!(url = %url, "sse connect failed: {e}");
            }
        }

        // One synthetic disconnect per established session.
        if shared.connected.swap(false, Ordering::Relaxed) {
            let peer = shared.remote_peer();
            if let Err(e) = handle.on_disconnect(&peer).await {
                tracing::debug!("disconnect callback: {e}");
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(shared.config.max_backoff);
    }
}

/// Decode one SSE payload and feed it to the coordinator. Strictly
/// sequential: the caller awaits before reading the next event.
async fn apply_event(shared: &Arc<ClientShared>, handle: &CoordinatorHandle, data: &str) {
    let msg: TransportMessage = match serde_json::from_str(data) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!("invalid envelope on sse stream: {e}");
            return;
        }
    };
    match msg {
        TransportMessage::Connect { peer_id } => {
            *shared.server_peer.lock() = Some(peer_id.clone());
            shared.connected.store(true, Ordering::Relaxed);
            if let Err(e) = handle.on_connect(&peer_id).await {
                tracing::warn!(peer = %peer_id, "connect callback failed: {e}");
            }
        }
        TransportMessage::Sync { peer_id, cursor } => {
            if let Err(e) = handle.on_sync(&peer_id, cursor).await {
                tracing::warn!(peer = %peer_id, "sync callback failed: {e}");
            }
        }
        TransportMessage::Data { peer_id, data } => {
            if let Err(e) = handle.on_receive(&peer_id, data).await {
                tracing::warn!(peer = %peer_id, "receive callback failed: {e}");
            }
        }
        TransportMessage::Ping { .. } => {}
        TransportMessage::Error { peer_id, error } => {
            tracing::warn!(peer = %peer_id, "server reported: {error}");
        }
    }
}
