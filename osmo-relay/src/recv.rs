//! PeerRecv: following the remote's CHANGES chain.
//!
//! Owns the recv half of a relay peer link. On start it loads the
//! persisted stream position; if there is none, it is stale against the
//! Ledger, or our CURSOR is no longer on the relays, it RESYNCs: allocate
//! a fresh random stream id, publish a CURSOR carrying what the Ledger
//! has absorbed, persist, and follow the new stream.
//!
//! Events arrive out of order; a buffer keyed by the `e` (previous event)
//! tag drains them causally. The persisted recv cursor always mirrors the
//! own-cursor the coordinator returns after apply; records the CRDT
//! merge discarded must not be echoed back in a future CURSOR, or phantom
//! sites reappear on resync.
//!
//! A broken chain (backlog cap exceeded, missing parent, undecryptable
//! expected link) restarts with a RESYNC. An apply *error* does not: the
//! stream parks in ABORTED so a bad record cannot loop, and an operator
//! signal is required.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use k256::ecdsa::{SigningKey, VerifyingKey};
use tokio::task::JoinHandle;

use osmo_engine::coordinator::CoordinatorHandle;
use osmo_engine::cursor::Cursor;

use crate::error::RelayError;
use crate::event::{
    ChangesPayload, CursorPayload, KIND_CHANGES, KIND_CURSOR, RelayEvent, new_stream_id, open,
    pubkey_hex, seal, unix_now,
};
use crate::relay::{Filter, RelaySet, SubMessage};
use crate::store::{StateStore, StreamState};

#[derive(Debug, Clone)]
pub struct PeerRecvConfig {
    /// Backlog pagination stops after this many events; overrun = broken.
    pub backlog_cap: usize,
    /// Reorder buffer limit; overrun restarts the stream.
    pub buffer_cap: usize,
    /// Page size for newest-first backlog queries.
    pub page_limit: usize,
    /// Pause before resubscribing after a relay closed the subscription.
    pub reconnect_pause: Duration,
}

impl Default for PeerRecvConfig {
    fn default() -> Self {
        Self {
            backlog_cap: 10_000,
            buffer_cap: 10_000,
            page_limit: 512,
            reconnect_pause: Duration::from_secs(5),
        }
    }
}

/// Bounded seen-set: hash set for membership, ring for eviction order.
struct DedupRing {
    seen: HashSet<String>,
    order: VecDeque<String>,
    cap: usize,
}

impl DedupRing {
    fn new(cap: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    fn insert(&mut self, id: String) {
        if self.seen.insert(id.clone()) {
            self.order.push_back(id);
            if self.order.len() > self.cap {
                if let Some(oldest) = self.order.pop_front() {
                    self.seen.remove(&oldest);
                }
            }
        }
    }
}

/// Per-subscription working state, rebuilt on every (re)subscribe.
struct Session {
    seen: DedupRing,
    /// Reorder buffer keyed by the event's `e` tag (its parent id).
    buffer: HashMap<String, RelayEvent>,
}

enum Flow {
    Continue,
    /// Chain unusable: abort the subscription and RESYNC.
    Restart,
}

/// The recv half of a relay peer link.
pub struct PeerRecv {
    peer_id: String,
    local_peer_id: String,
    keys: SigningKey,
    remote_vk: VerifyingKey,
    remote_pubkey: String,
    local_pubkey: String,
    relays: Arc<RelaySet>,
    store: Arc<dyn StateStore>,
    handle: CoordinatorHandle,
    config: PeerRecvConfig,
    cancel: Arc<AtomicBool>,
    aborted: Arc<AtomicBool>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl PeerRecv {
    pub fn spawn(
        peer_id: String,
        local_peer_id: String,
        keys: SigningKey,
        remote_vk: VerifyingKey,
        relays: Arc<RelaySet>,
        store: Arc<dyn StateStore>,
        handle: CoordinatorHandle,
        config: PeerRecvConfig,
    ) -> Arc<Self> {
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
            cancel: Arc::new(AtomicBool::new(false)),
            aborted: Arc::new(AtomicBool::new(false)),
            task: parking_lot::Mutex::new(None),
        });
        let task = tokio::spawn(Self::run(this.clone()));
        *this.task.lock() = Some(task);
        this
    }

    pub fn stop(&self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    /// True once an apply error parked the stream; no automatic restart.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }

    async fn run(this: Arc<Self>) {
        let mut force_resync = false;
        'outer: loop {
            if this.cancel.load(Ordering::Relaxed) {
                return;
            }
            let own = match this.handle.own_cursor().await {
                Ok(own) => own,
                Err(_) => return,
            };
            let persisted = match this.store.recv_state(&this.remote_pubkey).await {
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!(peer = %this.peer_id, "recv state load failed: {e}");
                    None
                }
            };
            let usable = !force_resync
                && persisted
                    .as_ref()
                    .map(|s| !s.cursor_id.is_empty() && !s.cursor.is_strictly_older_than(&own))
                    .unwrap_or(false);
            let mut st = if usable {
                let st = persisted.expect("usable implies present");
                if this.cursor_event_present(&st).await {
                    st
                } else {
                    tracing::info!(peer = %this.peer_id, "our cursor vanished from relays");
                    match this.resync(&own).await {
                        Ok(st) => st,
                        Err(e) => {
                            tracing::warn!(peer = %this.peer_id, "resync failed: {e}");
                            tokio::time::sleep(this.config.reconnect_pause).await;
                            continue;
                        }
                    }
                }
            } else {
                match this.resync(&own).await {
                    Ok(st) => st,
                    Err(e) => {
                        tracing::warn!(peer = %this.peer_id, "resync failed: {e}");
                        tokio::time::sleep(this.config.reconnect_pause).await;
                        continue;
                    }
                }
            };
            force_resync = false;

            // Live subscription opens before the backlog fetch so nothing
            // published in between can fall through the gap.
            let filter = Filter {
                authors: Some(vec![this.remote_pubkey.clone()]),
                kinds: Some(vec![KIND_CHANGES]),
                recipient: Some(this.local_pubkey.clone()),
                stream: Some(st.cursor_id.clone()),
                since: Some(st.timestamp),
                ..Filter::default()
            };
            let mut sub = match this.relays.subscribe_merged(filter).await {
                Ok(sub) => sub,
                Err(e) => {
                    tracing::warn!(peer = %this.peer_id, "subscribe failed: {e}");
                    tokio::time::sleep(this.config.reconnect_pause).await;
                    continue;
                }
            };

            let backlog = match this.fetch_backlog(&st).await {
                Ok(events) => events,
                Err(RelayError::StreamBroken(why)) => {
                    tracing::warn!(peer = %this.peer_id, "stream broken: {why}");
                    sub.close().await;
                    force_resync = true;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(peer = %this.peer_id, "backlog fetch failed: {e}");
                    sub.close().await;
                    tokio::time::sleep(this.config.reconnect_pause).await;
                    continue;
                }
            };

            let mut session = Session {
                seen: DedupRing::new(this.config.buffer_cap),
                buffer: HashMap::new(),
            };
            if !st.event_id.is_empty() {
                // The chain anchor itself is already applied.
                session.seen.insert(st.event_id.clone());
            }
            for event in backlog {
                match this.process_event(&mut st, &mut session, event).await {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Restart) => {
                        sub.close().await;
                        force_resync = true;
                        continue 'outer;
                    }
                    Err(e) => {
                        this.park_aborted(&e);
                        sub.close().await;
                        return;
                    }
                }
            }

            loop {
                if this.cancel.load(Ordering::Relaxed) {
                    sub.close().await;
                    return;
                }
                match sub.rx.recv().await {
                    Some(SubMessage::Event(event)) => {
                        match this.process_event(&mut st, &mut session, event).await {
                            Ok(Flow::Continue) => {}
                            Ok(Flow::Restart) => {
                                sub.close().await;
                                force_resync = true;
                                continue 'outer;
                            }
                            Err(e) => {
                                this.park_aborted(&e);
                                sub.close().await;
                                return;
                            }
                        }
                    }
                    Some(SubMessage::EndOfStored) => {}
                    Some(SubMessage::Closed) | None => {
                        sub.close().await;
                        tracing::info!(
                            peer = %this.peer_id,
                            pause_secs = this.config.reconnect_pause.as_secs(),
                            "relay closed subscription, reconnecting"
                        );
                        tokio::time::sleep(this.config.reconnect_pause).await;
                        continue 'outer;
                    }
                }
            }
        }
    }

    fn park_aborted(&self, err: &RelayError) {
        self.aborted.store(true, Ordering::Relaxed);
        tracing::error!(
            peer = %self.peer_id,
            "recv stream aborted, operator signal required: {err}"
        );
    }

    /// Publish a fresh CURSOR under a new stream id, carrying exactly what
    /// the Ledger has absorbed.
    async fn resync(&self, own: &Cursor) -> Result<StreamState, RelayError> {
        let stream_id = new_stream_id();
        let state = StreamState {
            cursor: own.clone(),
            cursor_id: stream_id.clone(),
            event_id: String::new(),
            timestamp: 0,
        };
        let payload = CursorPayload {
            peer_id: self.local_peer_id.clone(),
            stream_id: stream_id.clone(),
            cursor: own.clone(),
        };
        let content = seal(&self.keys, &self.remote_vk, &serde_json::to_vec(&payload)?)?;
        let tags = vec![vec!["p".to_string(), self.remote_pubkey.clone()]];
        let event = RelayEvent::sign(KIND_CURSOR, tags, content, unix_now(), &self.keys)?;
        self.relays.publish_all(&event).await?;
        if let Err(e) = self.store.set_recv_state(&self.remote_pubkey, &state).await {
            tracing::warn!(peer = %self.peer_id, "recv state persist failed: {e}");
        }
        tracing::info!(peer = %self.peer_id, stream = %stream_id, "resync: new cursor published");
        Ok(state)
    }

    /// Is our CURSOR for this stream still stored on some relay? The
    /// remote can only follow streams it can still read the request for.
    async fn cursor_event_present(&self, st: &StreamState) -> bool {
        let filter = Filter {
            authors: Some(vec![self.local_pubkey.clone()]),
            kinds: Some(vec![KIND_CURSOR]),
            recipient: Some(self.remote_pubkey.clone()),
            ..Filter::default()
        };
        let events = match self.relays.query_merged(filter).await {
            Ok(events) => events,
            Err(_) => return false,
        };
        events.iter().any(|event| {
            open(&self.keys, &self.remote_vk, &event.content)
                .ok()
                .and_then(|plain| serde_json::from_slice::<CursorPayload>(&plain).ok())
                .map(|payload| payload.stream_id == st.cursor_id)
                .unwrap_or(false)
        })
    }

    /// Paginate newest-first until the persisted chain anchor is found.
    /// Returns the collected events oldest-first for replay.
    async fn fetch_backlog(&self, st: &StreamState) -> Result<Vec<RelayEvent>, RelayError> {
        let mut collected: Vec<RelayEvent> = Vec::new();
        let mut ids: HashSet<String> = HashSet::new();
        let mut until: Option<u64> = None;
        loop {
            let filter = Filter {
                authors: Some(vec![self.remote_pubkey.clone()]),
                kinds: Some(vec![KIND_CHANGES]),
                recipient: Some(self.local_pubkey.clone()),
                stream: Some(st.cursor_id.clone()),
                until,
                limit: Some(self.config.page_limit),
                ..Filter::default()
            };
            let page = self.relays.query_merged(filter).await?;
            let mut new_any = false;
            for event in page {
                if ids.insert(event.id.clone()) {
                    collected.push(event);
                    new_any = true;
                }
            }
            if collected.len() > self.config.backlog_cap {
                return Err(RelayError::StreamBroken(format!(
                    "backlog cap {} exceeded before finding {}",
                    self.config.backlog_cap, st.event_id
                )));
            }
            if !st.event_id.is_empty() && ids.contains(&st.event_id) {
                break; // anchor found; the chain is intact
            }
            if !new_any {
                if st.event_id.is_empty() {
                    break; // fresh stream: the whole backlog is here
                }
                return Err(RelayError::StreamBroken(format!(
                    "chain anchor {} not stored on any relay",
                    st.event_id
                )));
            }
            until = collected.iter().map(|e| e.created_at).min();
        }
        collected.sort_by_key(|e| e.created_at);
        Ok(collected)
    }

    /// Buffer one event and drain everything that became causally ready.
    async fn process_event(
        &self,
        st: &mut StreamState,
        session: &mut Session,
        event: RelayEvent,
    ) -> Result<Flow, RelayError> {
        if session.seen.contains(&event.id) {
            return Ok(Flow::Continue);
        }
        let expected_next = event.tag_value("e").unwrap_or("") == st.event_id;
        if event.pubkey != self.remote_pubkey {
            tracing::warn!(peer = %self.peer_id, "event from foreign author dropped");
            return Ok(Flow::Continue);
        }
        if let Err(e) = event.verify() {
            tracing::warn!(peer = %self.peer_id, "bad event signature: {e}");
            return Ok(if expected_next { Flow::Restart } else { Flow::Continue });
        }
        let prev = event.tag_value("e").unwrap_or("").to_string();
        session.buffer.insert(prev, event);
        if session.buffer.len() > self.config.buffer_cap {
            tracing::warn!(peer = %self.peer_id, "reorder buffer overflow");
            return Ok(Flow::Restart);
        }

        while let Some(next) = session.buffer.remove(&st.event_id) {
            let plain = match open(&self.keys, &self.remote_vk, &next.content) {
                Ok(plain) => plain,
                Err(e) => {
                    // The expected next link is unreadable: structural break.
                    tracing::warn!(peer = %self.peer_id, "expected link undecryptable: {e}");
                    return Ok(Flow::Restart);
                }
            };
            let payload: ChangesPayload = match serde_json::from_slice(&plain) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!(peer = %self.peer_id, "changes payload malformed: {e}");
                    return Ok(Flow::Restart);
                }
            };
            if payload.peer_id != self.peer_id {
                tracing::warn!(
                    peer = %self.peer_id,
                    claimed = %payload.peer_id,
                    "changes event names a different peer"
                );
                return Ok(Flow::Restart);
            }
            let own = self
                .handle
                .on_receive(&self.peer_id, payload.msg)
                .await
                .map_err(|e| RelayError::Aborted(e.to_string()))?;
            // Persist what the Ledger absorbed, not what arrived.
            st.cursor = own;
            st.event_id = next.id.clone();
            st.timestamp = next.created_at;
            if let Err(e) = self.store.set_recv_state(&self.remote_pubkey, st).await {
                tracing::warn!(peer = %self.peer_id, "recv state persist failed: {e}");
            }
            session.seen.insert(next.id.clone());
        }
        Ok(Flow::Continue)
    }
}
