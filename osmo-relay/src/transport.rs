//! The relay transport: one virtual peer per remote, reconciled from a
//! pluggable peer store.
//!
//! Relays are not transports carrying a peer underneath: each peer is a
//! full relay-protocol participant, possibly reachable via several relays
//! treated as redundant paths. The coordinator sees one remote peer per
//! entry regardless.
//!
//! A periodic pass reads the peer store and reconciles: newly listed
//! pubkeys get a [`PeerSend`] + [`PeerRecv`] pair and `on_connect`;
//! vanished pubkeys are stopped and reported with `on_disconnect`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use k256::ecdsa::{SigningKey, VerifyingKey};
use tokio::task::JoinHandle;

use osmo_engine::coordinator::CoordinatorHandle;
use osmo_engine::cursor::Cursor;
use osmo_engine::error::Error;
use osmo_engine::message::PeerMessage;
use osmo_engine::transport::Transport;

use crate::error::RelayError;
use crate::recv::{PeerRecv, PeerRecvConfig};
use crate::relay::{MemoryRelay, Relay, RelaySet};
use crate::send::{PeerSend, PeerSendConfig, SendGate};
use crate::store::{PeerStore, StateStore};

/// Opens relay connections by URL. The in-process hub serves tests and
/// colocated peers; network connectors plug in the same way.
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Relay>, RelayError>;
}

/// Get-or-create hub of in-process relays, shared between transports so
/// two peers given the same URL land on the same relay instance.
#[derive(Default)]
pub struct MemoryHub {
    relays: parking_lot::Mutex<HashMap<String, Arc<MemoryRelay>>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Direct access to a hub relay (observation point for tests).
    pub fn relay(&self, url: &str) -> Arc<MemoryRelay> {
        self.relays
            .lock()
            .entry(url.to_string())
            .or_insert_with(|| MemoryRelay::new(url))
            .clone()
    }
}

#[async_trait]
impl RelayConnector for MemoryHub {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Relay>, RelayError> {
        Ok(self.relay(url))
    }
}

#[derive(Debug, Clone)]
pub struct RelayTransportConfig {
    /// Interval between peer-store reconciliation passes.
    pub reconcile_interval: Duration,
    pub send: PeerSendConfig,
    pub recv: PeerRecvConfig,
}

impl Default for RelayTransportConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(30),
            send: PeerSendConfig::default(),
            recv: PeerRecvConfig::default(),
        }
    }
}

#[derive(Clone)]
struct PeerLink {
    peer_id: String,
    send: Arc<PeerSend>,
    recv: Arc<PeerRecv>,
}

struct RelayShared {
    keys: SigningKey,
    peer_store: Arc<dyn PeerStore>,
    state_store: Arc<dyn StateStore>,
    connector: Arc<dyn RelayConnector>,
    config: RelayTransportConfig,
    gate: parking_lot::Mutex<Option<Arc<dyn SendGate>>>,
    local_peer_id: parking_lot::Mutex<Option<String>>,
    links: parking_lot::Mutex<HashMap<String, PeerLink>>,
    cancel: AtomicBool,
}

impl RelayShared {
    async fn reconcile(&self, handle: &CoordinatorHandle) -> Result<(), RelayError> {
        let local_peer_id = self
            .local_peer_id
            .lock()
            .clone()
            .ok_or_else(|| RelayError::Relay("transport not started".into()))?;
        let peers = self.peer_store.list_peers().await?;

        let known: HashSet<String> = self.links.lock().keys().cloned().collect();
        let wanted: HashSet<String> = peers.iter().map(|p| p.pubkey.clone()).collect();

        for spec in &peers {
            if known.contains(&spec.pubkey) {
                continue;
            }
            let remote_vk = match hex::decode(&spec.pubkey)
                .ok()
                .and_then(|bytes| VerifyingKey::from_sec1_bytes(&bytes).ok())
            {
                Some(vk) => vk,
                None => {
                    tracing::warn!(peer = %spec.peer_id, "unusable peer pubkey, skipping");
                    continue;
                }
            };
            let mut relays: Vec<Arc<dyn Relay>> = Vec::new();
            for url in &spec.relays {
                match self.connector.connect(url).await {
                    Ok(relay) => relays.push(relay),
                    Err(e) => tracing::warn!(relay = %url, "connect failed: {e}"),
                }
            }
            if relays.is_empty() {
                tracing::warn!(peer = %spec.peer_id, "no reachable relays, skipping");
                continue;
            }
            // Register with the coordinator before the stream machines can
            // deliver a sync, so the registration is never replaced out
            // from under a running catch-up.
            if let Err(e) = handle.on_connect(&spec.peer_id).await {
                tracing::warn!(peer = %spec.peer_id, "connect callback failed: {e}");
                continue;
            }
            let set = Arc::new(RelaySet::new(relays));
            let send = PeerSend::spawn(
                spec.peer_id.clone(),
                local_peer_id.clone(),
                self.keys.clone(),
                remote_vk.clone(),
                set.clone(),
                self.state_store.clone(),
                handle.clone(),
                self.config.send.clone(),
                self.gate.lock().clone(),
            );
            let recv = PeerRecv::spawn(
                spec.peer_id.clone(),
                local_peer_id.clone(),
                self.keys.clone(),
                remote_vk,
                set,
                self.state_store.clone(),
                handle.clone(),
                self.config.recv.clone(),
            );
            self.links.lock().insert(
                spec.pubkey.clone(),
                PeerLink {
                    peer_id: spec.peer_id.clone(),
                    send,
                    recv,
                },
            );
            tracing::info!(peer = %spec.peer_id, "relay peer link created");
        }

        // Removals by pubkey.
        let removed: Vec<PeerLink> = {
            let mut links = self.links.lock();
            known
                .iter()
                .filter(|pubkey| !wanted.contains(*pubkey))
                .filter_map(|pubkey| links.remove(pubkey))
                .collect()
        };
        for link in removed {
            link.send.stop();
            link.recv.stop();
            tracing::info!(peer = %link.peer_id, "relay peer removed from store");
            if let Err(e) = handle.on_disconnect(&link.peer_id).await {
                tracing::debug!(peer = %link.peer_id, "disconnect callback: {e}");
            }
        }
        Ok(())
    }

    fn link_for(&self, peer_id: &str) -> Option<PeerLink> {
        self.links
            .lock()
            .values()
            .find(|l| l.peer_id == peer_id)
            .cloned()
    }
}

/// The relay transport.
pub struct RelayTransport {
    shared: Arc<RelayShared>,
    reconcile_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl RelayTransport {
    pub fn new(
        keys: SigningKey,
        peer_store: Arc<dyn PeerStore>,
        state_store: Arc<dyn StateStore>,
        connector: Arc<dyn RelayConnector>,
        config: RelayTransportConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(RelayShared {
                keys,
                peer_store,
                state_store,
                connector,
                config,
                gate: parking_lot::Mutex::new(None),
                local_peer_id: parking_lot::Mutex::new(None),
                links: parking_lot::Mutex::new(HashMap::new()),
                cancel: AtomicBool::new(false),
            }),
            reconcile_task: parking_lot::Mutex::new(None),
        })
    }

    /// Install a backpressure hook consulted before every enqueue. Takes
    /// effect for links created after the call.
    pub fn set_send_gate(&self, gate: Arc<dyn SendGate>) {
        *self.shared.gate.lock() = Some(gate);
    }

    /// Whether a peer's recv stream parked itself after an apply error.
    pub fn peer_aborted(&self, peer_id: &str) -> bool {
        self.shared
            .link_for(peer_id)
            .map(|l| l.recv.is_aborted())
            .unwrap_or(false)
    }
}

#[async_trait]
impl Transport for RelayTransport {
    fn kind(&self) -> &'static str {
        "relay"
    }

    async fn start(&self, handle: CoordinatorHandle) -> Result<(), Error> {
        let local = handle.local_site_id().await?.to_string();
        *self.shared.local_peer_id.lock() = Some(local);

        let shared = self.shared.clone();
        let task = tokio::spawn(async move {
            loop {
                if shared.cancel.load(Ordering::Relaxed) {
                    return;
                }
                if let Err(e) = shared.reconcile(&handle).await {
                    tracing::warn!("peer reconcile failed: {e}");
                }
                tokio::time::sleep(shared.config.reconcile_interval).await;
            }
        });
        *self.reconcile_task.lock() = Some(task);
        Ok(())
    }

    async fn stop(&self) {
        self.shared.cancel.store(true, Ordering::Relaxed);
        if let Some(task) = self.reconcile_task.lock().take() {
            task.abort();
        }
        let links: Vec<PeerLink> = self.shared.links.lock().drain().map(|(_, l)| l).collect();
        for link in links {
            link.send.stop();
            link.recv.stop();
        }
    }

    async fn request_sync(&self, peer: &str, _cursor: &Cursor) {
        // The relay sync handshake is CURSOR-driven: PeerRecv publishes the
        // request when it (re)establishes its stream, so there is nothing
        // to push here.
        tracing::debug!(peer = %peer, "sync handled by cursor stream");
    }

    async fn send(&self, peer: &str, msg: &PeerMessage) {
        match self.shared.link_for(peer) {
            Some(link) => link.send.send(msg).await,
            None => tracing::debug!(peer = %peer, "send to unknown relay peer dropped"),
        }
    }

    fn connected(&self) -> bool {
        !self.shared.links.lock().is_empty()
    }
}
