//! In-process transport: a direct channel between two colocated peers.
//!
//! A thin bridge over an ordered, reliable, bidirectional message channel
//! (worker ↔ main, tests, embedded pairs). Exactly one remote peer. On
//! start each side announces its site id with a hello frame, which
//! triggers `on_connect` on the other side; after that, sync and peer
//! messages are forwarded verbatim. Channel closure is the only failure
//! mode and maps to `on_disconnect`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::coordinator::CoordinatorHandle;
use crate::cursor::Cursor;
use crate::error::Error;
use crate::message::PeerMessage;
use crate::transport::Transport;

#[derive(Debug)]
enum Frame {
    Hello { site: String },
    Sync { cursor: Cursor },
    Msg(PeerMessage),
}

/// One end of an in-process peer channel. Build both ends with [`pair`].
///
/// [`pair`]: InProcessTransport::pair
pub struct InProcessTransport {
    tx: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Frame>>>,
    connected: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl InProcessTransport {
    /// Two linked transports: frames sent by one are received by the other.
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (a2b_tx, a2b_rx) = mpsc::unbounded_channel();
        let (b2a_tx, b2a_rx) = mpsc::unbounded_channel();
        let a = Arc::new(Self {
            tx: Mutex::new(Some(a2b_tx)),
            rx: Mutex::new(Some(b2a_rx)),
            connected: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        });
        let b = Arc::new(Self {
            tx: Mutex::new(Some(b2a_tx)),
            rx: Mutex::new(Some(a2b_rx)),
            connected: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        });
        (a, b)
    }

    async fn push(&self, frame: Frame) {
        let tx = self.tx.lock().await;
        match tx.as_ref() {
            Some(tx) => {
                if tx.send(frame).is_err() {
                    tracing::warn!("in-process channel closed, frame dropped");
                }
            }
            None => tracing::warn!("in-process transport stopped, frame dropped"),
        }
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    fn kind(&self) -> &'static str {
        "inproc"
    }

    async fn start(&self, handle: CoordinatorHandle) -> Result<(), Error> {
        let site = handle.local_site_id().await?;
        self.push(Frame::Hello {
            site: site.to_string(),
        })
        .await;

        let mut rx = self
            .rx
            .lock()
            .await
            .take()
            .ok_or(Error::Stopped)?;
        let connected = self.connected.clone();
        connected.store(true, Ordering::Relaxed);

        let task = tokio::spawn(async move {
            let mut peer: Option<String> = None;
            while let Some(frame) = rx.recv().await {
                match frame {
                    Frame::Hello { site } => {
                        peer = Some(site.clone());
                        if let Err(e) = handle.on_connect(&site).await {
                            tracing::warn!(peer = %site, "connect callback failed: {e}");
                        }
                    }
                    Frame::Sync { cursor } => match &peer {
                        Some(peer) => {
                            if let Err(e) = handle.on_sync(peer, cursor).await {
                                tracing::warn!(peer = %peer, "sync callback failed: {e}");
                            }
                        }
                        None => tracing::warn!("sync frame before hello, dropped"),
                    },
                    Frame::Msg(msg) => match &peer {
                        Some(peer) => {
                            if let Err(e) = handle.on_receive(peer, msg).await {
                                tracing::warn!(peer = %peer, "receive callback failed: {e}");
                            }
                        }
                        None => tracing::warn!("peer message before hello, dropped"),
                    },
                }
            }
            connected.store(false, Ordering::Relaxed);
            if let Some(peer) = peer {
                let _ = handle.on_disconnect(&peer).await;
            }
        });
        *self.task.lock().await = Some(task);
        Ok(())
    }

    async fn stop(&self) {
        // Dropping our sender closes the remote's receive loop.
        self.tx.lock().await.take();
        self.connected.store(false, Ordering::Relaxed);
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
    }

    async fn request_sync(&self, _peer: &str, cursor: &Cursor) {
        self.push(Frame::Sync {
            cursor: cursor.clone(),
        })
        .await;
    }

    async fn send(&self, _peer: &str, msg: &PeerMessage) {
        self.push(Frame::Msg(msg.clone())).await;
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}
