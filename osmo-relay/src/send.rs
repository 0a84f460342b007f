//! PeerSend: authoring the CHANGES chain toward one remote peer.
//!
//! Listens for the remote's CURSOR events; a new stream id installs fresh
//! send state and hands the cursor to the coordinator (`on_sync`), which
//! triggers the catch-up pipeline. Outbound records buffer behind a short
//! debounce, flush as size-capped batches chained by `e` tags, and the
//! state (cursor, last event id, timestamp) persists after every publish
//! so a restart continues the chain instead of restarting it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use k256::ecdsa::{SigningKey, VerifyingKey};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use osmo_engine::change::ChangeRecord;
use osmo_engine::coordinator::CoordinatorHandle;
use osmo_engine::message::PeerMessage;

use crate::error::RelayError;
use crate::event::{
    CHANGES_TTL_SECS, ChangesPayload, CursorPayload, KIND_CHANGES, KIND_CURSOR, RelayEvent, open,
    pubkey_hex, seal, unix_now,
};
use crate::relay::{Filter, RelaySet, SubMessage};
use crate::store::{StateStore, StreamState};

/// Backpressure hook: relay clients with their own buffer limits may make
/// producers wait before enqueueing.
#[async_trait]
pub trait SendGate: Send + Sync {
    async fn wait_can_send(&self);
}

#[derive(Debug, Clone)]
pub struct PeerSendConfig {
    /// Quiet period before a buffered batch is flushed.
    pub debounce: Duration,
    /// Target ceiling on summed record weight per CHANGES event.
    pub max_batch_bytes: usize,
    /// Pause before retrying after a publish failed on every relay.
    pub retry_interval: Duration,
    /// Pause before resubscribing after a relay closed the subscription.
    pub resubscribe_pause: Duration,
}

impl Default for PeerSendConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(100),
            max_batch_bytes: 200 * 1024,
            retry_interval: Duration::from_secs(10),
            resubscribe_pause: Duration::from_secs(5),
        }
    }
}

struct SendInner {
    /// Active stream, installed by the remote's CURSOR. `None` until the
    /// first CURSOR arrives; records buffer meanwhile.
    stream: Option<StreamState>,
    pending: Vec<ChangeRecord>,
    schema_version: u64,
    /// A coordinator eose is pending: terminate the next flush's chain
    /// with a synthetic eose event.
    eose_pending: bool,
}

/// The send half of a relay peer link.
pub struct PeerSend {
    peer_id: String,
    local_peer_id: String,
    keys: SigningKey,
    remote_vk: VerifyingKey,
    remote_pubkey: String,
    local_pubkey: String,
    relays: Arc<RelaySet>,
    store: Arc<dyn StateStore>,
    handle: CoordinatorHandle,
    config: PeerSendConfig,
    gate: Option<Arc<dyn SendGate>>,
    inner: Mutex<SendInner>,
    kick: mpsc::UnboundedSender<()>,
    cancel: Arc<AtomicBool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl PeerSend {
    pub fn spawn(
        peer_id: String,
        local_peer_id: String,
        keys: SigningKey,
        remote_vk: VerifyingKey,
        relays: Arc<RelaySet>,
        store: Arc<dyn StateStore>,
        handle: CoordinatorHandle,
        config: PeerSendConfig,
        gate: Option<Arc<dyn SendGate>>,
    ) -> Arc<Self> {
        let (kick, kick_rx) = mpsc::unbounded_channel();
        let this = Arc::new(Self {
            peer_id,
            local_peer_id,
            local_pubkey: pubkey_hex(keys.verifying_key()),
            remote_pubkey: pubkey_hex(&remote_vk),
            keys,
            remote_vk,
            relays,
            store,
            handle,
            config,
            gate,
            inner: Mutex::new(SendInner {
                stream: None,
                pending: Vec::new(),
                schema_version: 0,
                eose_pending: false,
            }),
            kick,
            cancel: Arc::new(AtomicBool::new(false)),
            tasks: parking_lot::Mutex::new(Vec::new()),
        });
        let cursor_task = tokio::spawn(Self::run_cursor_subscription(this.clone()));
        let flush_task = tokio::spawn(Self::run_flush(this.clone(), kick_rx));
        this.tasks.lock().extend([cursor_task, flush_task]);
        this
    }

    pub fn stop(&self) {
        self.cancel.store(true, Ordering::Relaxed);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Enqueue a peer message from the coordinator. The coordinator's
    /// eose is not forwarded as-is; it becomes the chain terminator of
    /// the next flush.
    pub async fn send(&self, msg: &PeerMessage) {
        if let Some(gate) = &self.gate {
            gate.wait_can_send().await;
        }
        {
            let mut inner = self.inner.lock().await;
            match msg {
                PeerMessage::Changes {
                    data,
                    schema_version,
                } => {
                    inner.schema_version = *schema_version;
                    inner.pending.extend(data.iter().cloned());
                }
                PeerMessage::Eose { .. } => inner.eose_pending = true,
            }
        }
        let _ = self.kick.send(());
    }

    /// Restore the persisted chain position so a restart continues the
    /// stream instead of forking it.
    async fn load_persisted(&self) {
        match self.store.send_state(&self.remote_pubkey).await {
            Ok(Some(state)) => {
                tracing::info!(
                    peer = %self.peer_id,
                    stream = %state.cursor_id,
                    "resuming persisted send stream"
                );
                self.inner.lock().await.stream = Some(state);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(peer = %self.peer_id, "send state load failed: {e}"),
        }
    }

    async fn run_cursor_subscription(this: Arc<Self>) {
        this.load_persisted().await;
        loop {
            if this.cancel.load(Ordering::Relaxed) {
                return;
            }
            let filter = Filter {
                authors: Some(vec![this.remote_pubkey.clone()]),
                kinds: Some(vec![KIND_CURSOR]),
                recipient: Some(this.local_pubkey.clone()),
                ..Filter::default()
            };
            let mut sub = match this.relays.subscribe_merged(filter).await {
                Ok(sub) => sub,
                Err(e) => {
                    tracing::warn!(peer = %this.peer_id, "cursor subscribe failed: {e}");
                    tokio::time::sleep(this.config.resubscribe_pause).await;
                    continue;
                }
            };
            loop {
                if this.cancel.load(Ordering::Relaxed) {
                    sub.close().await;
                    return;
                }
                match sub.rx.recv().await {
                    Some(SubMessage::Event(event)) => this.handle_cursor_event(event).await,
                    Some(SubMessage::EndOfStored) => {}
                    Some(SubMessage::Closed) | None => break,
                }
            }
            sub.close().await;
            tokio::time::sleep(this.config.resubscribe_pause).await;
        }
    }

    async fn handle_cursor_event(&self, event: RelayEvent) {
        if let Err(e) = event.verify() {
            tracing::warn!(peer = %self.peer_id, "invalid cursor event dropped: {e}");
            return;
        }
        let plain = match open(&self.keys, &self.remote_vk, &event.content) {
            Ok(plain) => plain,
            Err(e) => {
                tracing::warn!(peer = %self.peer_id, "cursor decrypt failed: {e}");
                return;
            }
        };
        let payload: CursorPayload = match serde_json::from_slice(&plain) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(peer = %self.peer_id, "cursor payload malformed: {e}");
                return;
            }
        };
        if payload.peer_id != self.peer_id {
            tracing::warn!(
                peer = %self.peer_id,
                claimed = %payload.peer_id,
                "cursor names a different peer, rejected"
            );
            return;
        }
        {
            let mut inner = self.inner.lock().await;
            if inner
                .stream
                .as_ref()
                .map(|s| s.cursor_id == payload.stream_id)
                .unwrap_or(false)
            {
                // Same stream id: the existing chain continues.
                return;
            }
            let state = StreamState {
                cursor: payload.cursor.clone(),
                cursor_id: payload.stream_id.clone(),
                event_id: String::new(),
                timestamp: 0,
            };
            if let Err(e) = self.store.set_send_state(&self.remote_pubkey, &state).await {
                tracing::warn!(peer = %self.peer_id, "send state persist failed: {e}");
            }
            // A new stream invalidates anything buffered for the old one;
            // the coordinator re-sends from the cursor.
            inner.pending.clear();
            inner.eose_pending = false;
            inner.stream = Some(state);
        }
        tracing::info!(peer = %self.peer_id, stream = %payload.stream_id, "send stream installed");
        if let Err(e) = self.handle.on_sync(&self.peer_id, payload.cursor).await {
            tracing::warn!(peer = %self.peer_id, "sync callback failed: {e}");
        }
    }

    async fn run_flush(this: Arc<Self>, mut kick_rx: mpsc::UnboundedReceiver<()>) {
        while kick_rx.recv().await.is_some() {
            tokio::time::sleep(this.config.debounce).await;
            while kick_rx.try_recv().is_ok() {}
            loop {
                if this.cancel.load(Ordering::Relaxed) {
                    return;
                }
                match this.flush_once().await {
                    Ok(()) => break,
                    Err(e) => {
                        tracing::warn!(
                            peer = %this.peer_id,
                            retry_secs = this.config.retry_interval.as_secs(),
                            "flush failed, will retry: {e}"
                        );
                        tokio::time::sleep(this.config.retry_interval).await;
                    }
                }
            }
        }
    }

    /// Publish everything buffered as a run of chained CHANGES events.
    /// On failure the unpublished remainder is requeued and the caller
    /// retries; a new CURSOR mid-flush aborts the rest cleanly.
    async fn flush_once(&self) -> Result<(), RelayError> {
        let (mut stream, batches, eose, schema_version) = {
            let mut inner = self.inner.lock().await;
            let Some(stream) = inner.stream.clone() else {
                return Ok(()); // no stream yet: keep buffering
            };
            let pending = std::mem::take(&mut inner.pending);
            let eose = std::mem::replace(&mut inner.eose_pending, false);
            if pending.is_empty() && !eose {
                return Ok(());
            }
            let batches = split_batches(pending, self.config.max_batch_bytes);
            (stream, batches, eose, inner.schema_version)
        };

        let mut remaining = batches;
        while !remaining.is_empty() {
            let batch = remaining.remove(0);
            let msg = PeerMessage::changes(batch.clone(), schema_version);
            match self.publish_chain_event(&mut stream, msg).await {
                Ok(()) => {
                    stream.cursor.advance_by(&batch);
                    if !self.commit_stream(&stream).await {
                        return Ok(()); // superseded by a new CURSOR, drop the rest
                    }
                }
                Err(e) => {
                    self.requeue(batch, remaining, eose).await;
                    return Err(e);
                }
            }
        }
        if eose {
            if let Err(e) = self.publish_chain_event(&mut stream, PeerMessage::eose()).await {
                self.requeue(Vec::new(), Vec::new(), true).await;
                return Err(e);
            }
            self.commit_stream(&stream).await;
        }
        Ok(())
    }

    async fn publish_chain_event(
        &self,
        stream: &mut StreamState,
        msg: PeerMessage,
    ) -> Result<(), RelayError> {
        let payload = ChangesPayload {
            peer_id: self.local_peer_id.clone(),
            msg,
        };
        let content = seal(
            &self.keys,
            &self.remote_vk,
            &serde_json::to_vec(&payload)?,
        )?;
        // Timestamps are monotone within a stream; round up if the wall
        // clock stepped backwards.
        let created_at = unix_now().max(stream.timestamp);
        let tags = vec![
            vec!["p".to_string(), self.remote_pubkey.clone()],
            vec!["r".to_string(), stream.cursor_id.clone()],
            vec!["e".to_string(), stream.event_id.clone()],
            vec![
                "expiration".to_string(),
                (created_at + CHANGES_TTL_SECS).to_string(),
            ],
        ];
        let event = RelayEvent::sign(KIND_CHANGES, tags, content, created_at, &self.keys)?;
        self.relays.publish_all(&event).await?;
        stream.event_id = event.id;
        stream.timestamp = created_at;
        Ok(())
    }

    /// Persist the advanced stream and mirror it into the live state, but
    /// only while the stream id is still current. Returns false when a new
    /// CURSOR superseded the chain mid-flight.
    async fn commit_stream(&self, stream: &StreamState) -> bool {
        let mut inner = self.inner.lock().await;
        let current = inner
            .stream
            .as_ref()
            .map(|s| s.cursor_id == stream.cursor_id)
            .unwrap_or(false);
        if !current {
            tracing::info!(peer = %self.peer_id, "send stream superseded mid-flush");
            return false;
        }
        inner.stream = Some(stream.clone());
        drop(inner);
        if let Err(e) = self.store.set_send_state(&self.remote_pubkey, stream).await {
            tracing::warn!(peer = %self.peer_id, "send state persist failed: {e}");
        }
        true
    }

    async fn requeue(&self, batch: Vec<ChangeRecord>, rest: Vec<Vec<ChangeRecord>>, eose: bool) {
        let mut inner = self.inner.lock().await;
        let mut restored: Vec<ChangeRecord> = batch;
        restored.extend(rest.into_iter().flatten());
        restored.append(&mut inner.pending);
        inner.pending = restored;
        inner.eose_pending |= eose;
    }
}

/// Greedy split by summed record weight; every batch carries at least one
/// record so an oversized single record still ships.
fn split_batches(records: Vec<ChangeRecord>, max_bytes: usize) -> Vec<Vec<ChangeRecord>> {
    let mut batches = Vec::new();
    let mut current: Vec<ChangeRecord> = Vec::new();
    let mut current_bytes = 0usize;
    for record in records {
        let weight = record.weight();
        if !current.is_empty() && current_bytes + weight > max_bytes {
            batches.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes += weight;
        current.push(record);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}
