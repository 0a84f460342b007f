//! HTTP/SSE server transport.
//!
//! The server half of the HTTP transport: one SSE downstream channel per
//! peer id (`GET /stream?peerId=…`), POSTs routed to the coordinator
//! callbacks (`/sync`, `/data`). The hosting coordinator pushes through
//! the per-peer channels like any other transport.
//!
//! A `ping` envelope is pushed periodically on every stream; it doubles as
//! the liveness probe: a closed channel during ping is how the server
//! notices a vanished client and reports `on_disconnect`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;

use osmo_engine::coordinator::CoordinatorHandle;
use osmo_engine::cursor::Cursor;
use osmo_engine::error::Error;
use osmo_engine::message::PeerMessage;
use osmo_engine::transport::Transport;

use crate::envelope::TransportMessage;

#[derive(Debug, Clone)]
pub struct HttpServerConfig {
    /// Interval between keepalive pings on each SSE stream.
    pub ping_interval: Duration,
    /// Per-peer downstream buffer before frames are dropped.
    pub channel_capacity: usize,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            channel_capacity: 256,
        }
    }
}

struct SseClient {
    tx: mpsc::Sender<TransportMessage>,
    generation: u64,
}

struct ServerShared {
    config: HttpServerConfig,
    handle: parking_lot::Mutex<Option<CoordinatorHandle>>,
    local: parking_lot::Mutex<Option<String>>,
    clients: parking_lot::Mutex<HashMap<String, SseClient>>,
    generation: AtomicU64,
    stopping: AtomicBool,
}

impl ServerShared {
    fn push(&self, peer: &str, msg: TransportMessage) {
        let clients = self.clients.lock();
        match clients.get(peer) {
            Some(client) => {
                if let Err(e) = client.tx.try_send(msg) {
                    tracing::warn!(peer = %peer, "sse push failed: {e}");
                }
            }
            None => tracing::debug!(peer = %peer, "sse push to unknown peer dropped"),
        }
    }
}

/// The server half of the HTTP/SSE transport.
pub struct HttpServerTransport {
    shared: Arc<ServerShared>,
    server_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl HttpServerTransport {
    pub fn new(config: HttpServerConfig) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(ServerShared {
                config,
                handle: parking_lot::Mutex::new(None),
                local: parking_lot::Mutex::new(None),
                clients: parking_lot::Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                stopping: AtomicBool::new(false),
            }),
            server_task: parking_lot::Mutex::new(None),
        })
    }

    /// The axum router; mount this into a host server, or use [`serve`].
    ///
    /// [`serve`]: Self::serve
    pub fn router(&self) -> Router {
        Router::new()
            .route("/stream", get(stream_handler))
            .route("/sync", post(sync_handler))
            .route("/data", post(data_handler))
            .layer(CorsLayer::permissive())
            .with_state(self.shared.clone())
    }

    /// Bind and serve on `addr`; returns the bound address (port 0 works).
    pub async fn serve(&self, addr: SocketAddr) -> std::io::Result<SocketAddr> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        let router = self.router();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                tracing::warn!("http server exited: {e}");
            }
        });
        *self.server_task.lock() = Some(task);
        tracing::info!(addr = %bound, "http transport serving");
        Ok(bound)
    }
}

#[async_trait]
impl Transport for HttpServerTransport {
    fn kind(&self) -> &'static str {
        "http"
    }

    async fn start(&self, handle: CoordinatorHandle) -> Result<(), Error> {
        let local = handle.local_site_id().await?.to_string();
        *self.shared.local.lock() = Some(local);
        *self.shared.handle.lock() = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        self.shared.stopping.store(true, Ordering::Relaxed);
        self.shared.clients.lock().clear();
        if let Some(task) = self.server_task.lock().take() {
            task.abort();
        }
    }

    async fn request_sync(&self, peer: &str, cursor: &Cursor) {
        let local = match self.shared.local.lock().clone() {
            Some(local) => local,
            None => return,
        };
        self.shared.push(
            peer,
            TransportMessage::Sync {
                peer_id: local,
                cursor: cursor.clone(),
            },
        );
    }

    async fn send(&self, peer: &str, msg: &PeerMessage) {
        let local = match self.shared.local.lock().clone() {
            Some(local) => local,
            None => return,
        };
        self.shared.push(
            peer,
            TransportMessage::Data {
                peer_id: local,
                data: msg.clone(),
            },
        );
    }

    fn connected(&self) -> bool {
        !self.shared.clients.lock().is_empty()
    }
}

async fn stream_handler(
    State(shared): State<Arc<ServerShared>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Sse<impl futures::Stream<Item = Result<Event, axum::Error>>>, StatusCode> {
    let peer = params
        .get("peerId")
        .cloned()
        .ok_or(StatusCode::BAD_REQUEST)?;
    if shared.stopping.load(Ordering::Relaxed) {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    let local = shared
        .local
        .lock()
        .clone()
        .ok_or(StatusCode::SERVICE_UNAVAILABLE)?;
    let handle = shared
        .handle
        .lock()
        .clone()
        .ok_or(StatusCode::SERVICE_UNAVAILABLE)?;

    let (tx, rx) = mpsc::channel(shared.config.channel_capacity);
    let generation = shared.generation.fetch_add(1, Ordering::Relaxed);
    {
        let mut clients = shared.clients.lock();
        if clients.contains_key(&peer) {
            tracing::info!(peer = %peer, "replacing existing sse client");
        }
        clients.insert(
            peer.clone(),
            SseClient {
                tx: tx.clone(),
                generation,
            },
        );
    }
    tracing::info!(peer = %peer, generation, "sse client connected");

    // First frame names us. Registration completes before the response
    // starts streaming, so the client's follow-up POSTs can never race a
    // not-yet-registered peer.
    let _ = tx.try_send(TransportMessage::Connect { peer_id: local });
    if let Err(e) = handle.on_connect(&peer).await {
        tracing::warn!(peer = %peer, "connect callback failed: {e}");
    }

    // Keepalive pings double as the liveness probe: a closed channel here
    // is how we learn the client went away.
    {
        let shared = shared.clone();
        let peer_id = peer.clone();
        let interval = shared.config.ping_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let ping = TransportMessage::Ping {
                    peer_id: peer_id.clone(),
                };
                if let Err(mpsc::error::TrySendError::Closed(_)) = tx.try_send(ping) {
                    let removed = {
                        let mut clients = shared.clients.lock();
                        match clients.get(&peer_id) {
                            Some(client) if client.generation == generation => {
                                clients.remove(&peer_id);
                                true
                            }
                            _ => false,
                        }
                    };
                    if removed {
                        tracing::info!(peer = %peer_id, "sse client gone");
                        if let Err(e) = handle.on_disconnect(&peer_id).await {
                            tracing::debug!(peer = %peer_id, "disconnect callback: {e}");
                        }
                    }
                    return;
                }
            }
        });
    }

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|msg| (Event::default().json_data(&msg), rx))
    });
    Ok(Sse::new(stream))
}

async fn sync_handler(
    State(shared): State<Arc<ServerShared>>,
    axum::Json(msg): axum::Json<TransportMessage>,
) -> StatusCode {
    let Some(handle) = shared.handle.lock().clone() else {
        return StatusCode::SERVICE_UNAVAILABLE;
    };
    match msg {
        TransportMessage::Sync { peer_id, cursor } => {
            if let Err(e) = handle.on_sync(&peer_id, cursor).await {
                tracing::warn!(peer = %peer_id, "sync callback failed: {e}");
                return StatusCode::INTERNAL_SERVER_ERROR;
            }
            StatusCode::OK
        }
        _ => StatusCode::BAD_REQUEST,
    }
}

async fn data_handler(
    State(shared): State<Arc<ServerShared>>,
    axum::Json(msg): axum::Json<TransportMessage>,
) -> StatusCode {
    let Some(handle) = shared.handle.lock().clone() else {
        return StatusCode::SERVICE_UNAVAILABLE;
    };
    match msg {
        TransportMessage::Data { peer_id, data } => {
            if let Err(e) = handle.on_receive(&peer_id, data).await {
                tracing::warn!(peer = %peer_id, "receive callback failed: {e}");
                return StatusCode::INTERNAL_SERVER_ERROR;
            }
            StatusCode::OK
        }
        _ => StatusCode::BAD_REQUEST,
    }
}
