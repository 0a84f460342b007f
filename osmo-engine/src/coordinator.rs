//! The peer coordinator: registry, cursors, diffusion, serialization.
//!
//! The coordinator owns the authoritative per-peer cursors, runs the
//! diffusion algorithm, and bridges the Ledger's change stream to the
//! attached transports.
//!
//! # Serialization model
//!
//! All transport callbacks for all peers are serialized through one fair
//! async mutex: waiters are queued FIFO, so the mutex is the logical
//! callback queue. No two callbacks ever run concurrently. When the
//! coordinator must call back into a transport (`request_sync`, `send`),
//! the call is deferred to a spawned task after the lock is released, so a
//! transport's own code path can never synchronously re-enter the
//! coordinator.
//!
//! The one long-running exception is the initial catch-up send to a newly
//! synced peer: it runs as a detached task outside the queue, takes the
//! lock only at batch boundaries, and polls a cancel flag so a newer
//! `on_sync` for the same peer can cancel and restart it.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::change::{ChangeRecord, SiteId};
use crate::cursor::Cursor;
use crate::error::Error;
use crate::ledger::Ledger;
use crate::message::PeerMessage;
use crate::transport::Transport;

/// Events the coordinator emits to the host application.
///
/// Failures are never emitted as events, only logged; hosts that need
/// liveness signaling consult `Transport::connected`.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Changes were absorbed into the Ledger; `tables` is the distinct set
    /// of affected tables.
    Change { tables: Vec<String> },
    /// A remote peer registered with us.
    Connect { peer: String, transport: &'static str },
    /// A remote peer completed its sync handshake to us.
    Sync { peer: String, transport: &'static str },
    /// End of stored events: we are caught up with what was already on the
    /// wire from this peer.
    Eose { peer: String, transport: &'static str },
    /// A remote runs a newer schema; its batch was dropped unapplied.
    Outdated {
        schema_version: u64,
        peer: String,
        transport: &'static str,
    },
}

/// Tuning knobs. The defaults match the reference deployment.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Rows per catch-up page read from the Ledger and pushed per message.
    pub catchup_batch: usize,
    /// Ceiling on records applied per Ledger transaction.
    pub apply_batch: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            catchup_batch: 10_000,
            apply_batch: 2_000,
        }
    }
}

struct Catchup {
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

struct PeerEntry {
    transport: usize,
    kind: &'static str,
    /// What the remote is known to have absorbed.
    cursor: Cursor,
    /// Set once our catch-up send to the peer has finished.
    active: bool,
    /// Records produced while `active` is false, delivered after eose.
    pending: Vec<ChangeRecord>,
    catchup: Option<Catchup>,
}

struct State {
    running: bool,
    site_id: SiteId,
    schema_version: u64,
    own_cursor: Cursor,
    transports: Vec<Arc<dyn Transport>>,
    peers: HashMap<String, PeerEntry>,
    subscribers: Vec<mpsc::UnboundedSender<SyncEvent>>,
}

struct Shared {
    ledger: Arc<dyn Ledger>,
    state: Mutex<State>,
    scan_pending: AtomicBool,
    config: CoordinatorConfig,
}

/// The sync coordinator. Owns its transports; hand transports a
/// [`CoordinatorHandle`] (done by `start`) as their back-channel.
pub struct Coordinator {
    shared: Arc<Shared>,
}

impl Coordinator {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self::with_config(ledger, CoordinatorConfig::default())
    }

    pub fn with_config(ledger: Arc<dyn Ledger>, config: CoordinatorConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                ledger,
                state: Mutex::new(State {
                    running: false,
                    site_id: SiteId([0; 16]),
                    schema_version: 0,
                    own_cursor: Cursor::new(),
                    transports: Vec::new(),
                    peers: HashMap::new(),
                    subscribers: Vec::new(),
                }),
                scan_pending: AtomicBool::new(false),
                config,
            }),
        }
    }

    /// Attach a transport. Must be called before `start`.
    pub async fn attach(&self, transport: Arc<dyn Transport>) -> Result<(), Error> {
        let mut state = self.shared.state.lock().await;
        if state.running {
            return Err(Error::Stopped);
        }
        state.transports.push(transport);
        Ok(())
    }

    /// Read identity and cursor from the Ledger and start every attached
    /// transport. Idempotent.
    pub async fn start(&self) -> Result<(), Error> {
        let transports = {
            let mut state = self.shared.state.lock().await;
            if state.running {
                return Ok(());
            }
            state.site_id = self.shared.ledger.site_id().await?;
            state.schema_version = self.shared.ledger.schema_version().await?;
            state.own_cursor = self.shared.ledger.version_vector().await?;
            state.running = true;
            tracing::info!(site = %state.site_id, schema = state.schema_version, "coordinator started");
            state.transports.clone()
        };
        for (index, transport) in transports.iter().enumerate() {
            let handle = CoordinatorHandle {
                shared: Arc::downgrade(&self.shared),
                transport: index,
                kind: transport.kind(),
            };
            transport.start(handle).await?;
        }
        Ok(())
    }

    /// Clear the registry, stop every transport, drop local state.
    pub async fn stop(&self) {
        let transports = {
            let mut state = self.shared.state.lock().await;
            state.running = false;
            for (_, entry) in state.peers.drain() {
                if let Some(catchup) = entry.catchup {
                    catchup.cancel.store(true, Ordering::Relaxed);
                }
            }
            std::mem::take(&mut state.transports)
        };
        for transport in transports {
            transport.stop().await;
        }
        tracing::info!("coordinator stopped");
    }

    /// Subscribe to coordinator events.
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<SyncEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.state.lock().await.subscribers.push(tx);
        rx
    }

    /// A cheap handle the host wires into the Ledger's commit path.
    pub fn notifier(&self) -> LocalChangeNotifier {
        LocalChangeNotifier {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Scan the Ledger for fresh locally-authored records and broadcast
    /// them. Concurrent callers collapse into a single eventual scan.
    pub async fn check_local_changes(&self) -> Result<(), Error> {
        run_local_scan(&self.shared).await
    }

    pub async fn own_cursor(&self) -> Cursor {
        self.shared.state.lock().await.own_cursor.clone()
    }

    pub async fn site_id(&self) -> SiteId {
        self.shared.state.lock().await.site_id
    }

    /// The cursor we hold for a registered peer (observation point).
    pub async fn peer_cursor(&self, peer: &str) -> Option<Cursor> {
        self.shared
            .state
            .lock()
            .await
            .peers
            .get(peer)
            .map(|p| p.cursor.clone())
    }

    pub async fn peer_ids(&self) -> Vec<String> {
        self.shared.state.lock().await.peers.keys().cloned().collect()
    }
}

/// Invoked from the Ledger's commit path: schedules `check_local_changes`.
#[derive(Clone)]
pub struct LocalChangeNotifier {
    shared: Weak<Shared>,
}

impl LocalChangeNotifier {
    pub fn notify(&self) {
        if let Some(shared) = self.shared.upgrade() {
            tokio::spawn(async move {
                if let Err(e) = run_local_scan(&shared).await {
                    tracing::warn!("local change scan failed: {e}");
                }
            });
        }
    }
}

/// The callback struct a transport receives on `start`. Cloneable, cheap,
/// and holds only a weak back-reference: once the coordinator is stopped
/// or dropped, every method returns [`Error::Stopped`].
#[derive(Clone)]
pub struct CoordinatorHandle {
    shared: Weak<Shared>,
    transport: usize,
    kind: &'static str,
}

impl CoordinatorHandle {
    fn upgrade(&self) -> Result<Arc<Shared>, Error> {
        self.shared.upgrade().ok_or(Error::Stopped)
    }

    pub async fn local_site_id(&self) -> Result<SiteId, Error> {
        let shared = self.upgrade()?;
        let state = shared.state.lock().await;
        if !state.running {
            return Err(Error::Stopped);
        }
        Ok(state.site_id)
    }

    pub async fn own_cursor(&self) -> Result<Cursor, Error> {
        let shared = self.upgrade()?;
        let state = shared.state.lock().await;
        if !state.running {
            return Err(Error::Stopped);
        }
        Ok(state.own_cursor.clone())
    }

    pub async fn schema_version(&self) -> Result<u64, Error> {
        let shared = self.upgrade()?;
        let state = shared.state.lock().await;
        if !state.running {
            return Err(Error::Stopped);
        }
        Ok(state.schema_version)
    }

    /// Register a remote peer. Emits `connect` and asynchronously asks the
    /// transport to deliver our sync request to the peer.
    pub async fn on_connect(&self, peer: &str) -> Result<(), Error> {
        let shared = self.upgrade()?;
        let mut state = shared.state.lock().await;
        if !state.running {
            return Err(Error::Stopped);
        }
        if let Some(old) = state.peers.remove(peer) {
            tracing::info!(peer = %peer, "duplicate connect, replacing existing registration");
            if let Some(catchup) = old.catchup {
                catchup.cancel.store(true, Ordering::Relaxed);
            }
        }
        state.peers.insert(
            peer.to_string(),
            PeerEntry {
                transport: self.transport,
                kind: self.kind,
                cursor: Cursor::new(),
                active: false,
                pending: Vec::new(),
                catchup: None,
            },
        );
        tracing::info!(peer = %peer, transport = self.kind, "peer connected");
        emit(
            &mut state,
            SyncEvent::Connect {
                peer: peer.to_string(),
                transport: self.kind,
            },
        );
        let transport = state.transports[self.transport].clone();
        let cursor = state.own_cursor.clone();
        drop(state);

        // Deferred so the transport cannot synchronously re-enter us.
        let peer = peer.to_string();
        tokio::spawn(async move {
            transport.request_sync(&peer, &cursor).await;
        });
        Ok(())
    }

    /// The remote told us what it has; install its cursor and launch the
    /// catch-up send. A catch-up already in flight for this peer is
    /// cancelled and restarted from the new cursor.
    pub async fn on_sync(&self, peer: &str, cursor: Cursor) -> Result<(), Error> {
        let shared = self.upgrade()?;
        let mut state = shared.state.lock().await;
        if !state.running {
            return Err(Error::Stopped);
        }
        if !state.peers.contains_key(peer) {
            tracing::warn!(peer = %peer, "sync from unregistered peer, registering");
            state.peers.insert(
                peer.to_string(),
                PeerEntry {
                    transport: self.transport,
                    kind: self.kind,
                    cursor: Cursor::new(),
                    active: false,
                    pending: Vec::new(),
                    catchup: None,
                },
            );
            emit(
                &mut state,
                SyncEvent::Connect {
                    peer: peer.to_string(),
                    transport: self.kind,
                },
            );
        }
        emit(
            &mut state,
            SyncEvent::Sync {
                peer: peer.to_string(),
                transport: self.kind,
            },
        );

        let transport = state.transports[self.transport].clone();
        let entry = state.peers.get_mut(peer).expect("registered above");
        entry.cursor = cursor.clone();
        entry.active = false;
        let prev = entry.catchup.take().map(|c| {
            c.cancel.store(true, Ordering::Relaxed);
            c.handle
        });
        let cancel = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run_catchup(
            self.shared.clone(),
            transport,
            peer.to_string(),
            cursor,
            cancel.clone(),
            prev,
        ));
        let entry = state.peers.get_mut(peer).expect("registered above");
        entry.catchup = Some(Catchup {
            cancel,
            handle: task,
        });
        tracing::debug!(peer = %peer, "catch-up send scheduled");
        Ok(())
    }

    /// Apply or ignore an incoming peer message. Returns the own-cursor
    /// after the Ledger absorbed the batch; the relay transport persists
    /// this, never the raw incoming positions.
    pub async fn on_receive(&self, peer: &str, msg: PeerMessage) -> Result<Cursor, Error> {
        let shared = self.upgrade()?;
        let mut state = shared.state.lock().await;
        if !state.running {
            return Err(Error::Stopped);
        }
        let (data, schema_version) = match msg {
            PeerMessage::Eose { .. } => {
                emit(
                    &mut state,
                    SyncEvent::Eose {
                        peer: peer.to_string(),
                        transport: self.kind,
                    },
                );
                return Ok(state.own_cursor.clone());
            }
            PeerMessage::Changes {
                data,
                schema_version,
            } => (data, schema_version),
        };

        if schema_version > state.schema_version {
            tracing::warn!(
                peer = %peer,
                remote_schema = schema_version,
                local_schema = state.schema_version,
                "schema skew, dropping batch"
            );
            emit(
                &mut state,
                SyncEvent::Outdated {
                    schema_version,
                    peer: peer.to_string(),
                    transport: self.kind,
                },
            );
            return Ok(state.own_cursor.clone());
        }

        // Inclusive boundary on ingest: a transaction may span several
        // records at one db_version, so `≥` keeps the tail of a batch we
        // already started absorbing. Re-send filtering is strict `>`.
        let new: Vec<ChangeRecord> = data
            .iter()
            .filter(|r| r.db_version >= state.own_cursor.get(&r.site_id))
            .cloned()
            .collect();
        // The peer is now known to know the accepted set whatever happens
        // to it locally, so its cursor advances even when validation or
        // apply aborts the batch below. Only own_cursor is held back.
        if let Some(entry) = state.peers.get_mut(peer) {
            entry.cursor.advance_by(&new);
        }
        for record in &new {
            record.validate()?;
        }
        if new.is_empty() {
            return Ok(state.own_cursor.clone());
        }

        for chunk in new.chunks(shared.config.apply_batch) {
            shared.ledger.apply_changes(chunk).await?;
        }
        // Recompute from the Ledger: the merge may have discarded records,
        // which must not leak into the cursor.
        state.own_cursor = shared.ledger.version_vector().await?;

        let tables: BTreeSet<String> = new.iter().map(|r| r.table.clone()).collect();
        emit(
            &mut state,
            SyncEvent::Change {
                tables: tables.into_iter().collect(),
            },
        );

        let outbound = queue_broadcast(&mut state, &new, Some(peer));
        let own = state.own_cursor.clone();
        drop(state);
        dispatch(outbound);
        Ok(own)
    }

    /// Remove the peer; pending changes are discarded.
    pub async fn on_disconnect(&self, peer: &str) -> Result<(), Error> {
        let shared = self.upgrade()?;
        let mut state = shared.state.lock().await;
        if let Some(entry) = state.peers.remove(peer) {
            if let Some(catchup) = entry.catchup {
                catchup.cancel.store(true, Ordering::Relaxed);
            }
            tracing::info!(peer = %peer, transport = self.kind, "peer disconnected");
        }
        Ok(())
    }
}

fn emit(state: &mut State, event: SyncEvent) {
    state.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
}

/// Distribute `records` to every registered peer except `skip`, filtered
/// by what each peer already has and excluding each peer's own records.
/// Active peers get a message queued for send; inactive peers buffer.
fn queue_broadcast(
    state: &mut State,
    records: &[ChangeRecord],
    skip: Option<&str>,
) -> Vec<(Arc<dyn Transport>, String, PeerMessage)> {
    let schema_version = state.schema_version;
    let transports = state.transports.clone();
    let mut outbound = Vec::new();
    for (peer_id, entry) in state.peers.iter_mut() {
        if skip == Some(peer_id.as_str()) {
            continue;
        }
        let subset: Vec<ChangeRecord> = records
            .iter()
            .filter(|r| r.site_id.to_string() != *peer_id)
            .filter(|r| r.db_version > entry.cursor.get(&r.site_id))
            .cloned()
            .collect();
        if subset.is_empty() {
            continue;
        }
        if entry.active {
            entry.cursor.advance_by(&subset);
            outbound.push((
                transports[entry.transport].clone(),
                peer_id.clone(),
                PeerMessage::changes(subset, schema_version),
            ));
        } else {
            entry.pending.extend(subset);
        }
    }
    outbound
}

/// Send queued messages outside the lock, one task so per-peer order holds.
fn dispatch(outbound: Vec<(Arc<dyn Transport>, String, PeerMessage)>) {
    if outbound.is_empty() {
        return;
    }
    tokio::spawn(async move {
        for (transport, peer, msg) in outbound {
            transport.send(&peer, &msg).await;
        }
    });
}

/// Scan the Ledger for fresh locally-authored records and broadcast them.
/// Coalesced: concurrent requests fold into the next scan to run.
async fn run_local_scan(shared: &Arc<Shared>) -> Result<(), Error> {
    if shared.scan_pending.swap(true, Ordering::SeqCst) {
        // A queued scan will observe our writes.
        return Ok(());
    }
    let mut state = shared.state.lock().await;
    shared.scan_pending.store(false, Ordering::SeqCst);
    if !state.running {
        return Err(Error::Stopped);
    }

    let site = state.site_id;
    let mut floors: Cursor = [(site, state.own_cursor.get(&site))].into_iter().collect();
    let mut tables: BTreeSet<String> = BTreeSet::new();
    let mut outbound = Vec::new();
    loop {
        let page = shared
            .ledger
            .changes_since(&floors, shared.config.catchup_batch)
            .await?;
        if page.is_empty() {
            break;
        }
        floors.advance_by(&page);
        state.own_cursor.advance_by(&page);
        tables.extend(page.iter().map(|r| r.table.clone()));
        outbound.extend(queue_broadcast(&mut state, &page, None));
    }
    if !tables.is_empty() {
        tracing::debug!(tables = ?tables, "local changes broadcast");
        emit(
            &mut state,
            SyncEvent::Change {
                tables: tables.into_iter().collect(),
            },
        );
    }
    drop(state);
    dispatch(outbound);
    Ok(())
}

/// The initial catch-up send to a newly synced peer. Detached from the
/// callback queue; polls `cancel` at batch boundaries.
async fn run_catchup(
    shared: Weak<Shared>,
    transport: Arc<dyn Transport>,
    peer: String,
    peer_cursor: Cursor,
    cancel: Arc<AtomicBool>,
    prev: Option<JoinHandle<()>>,
) {
    // A superseded catch-up finishes (observing its cancel flag) before we
    // touch the peer's state.
    if let Some(prev) = prev {
        let _ = prev.await;
    }
    let Some(strong) = shared.upgrade() else {
        return;
    };
    let (mut floors, schema_version) = {
        let state = strong.state.lock().await;
        if !state.running {
            return;
        }
        // Effective gap map: the peer's floors, plus zero floors for every
        // site we know that the peer has never heard of.
        let mut floors = peer_cursor.clone();
        for site in state.own_cursor.sites() {
            if !floors.contains(site) {
                floors.advance(*site, 0);
            }
        }
        (floors, state.schema_version)
    };
    let ledger = strong.ledger.clone();
    let batch = strong.config.catchup_batch;
    drop(strong);

    let mut sent = 0usize;
    loop {
        if cancel.load(Ordering::Relaxed) {
            tracing::debug!(peer = %peer, sent, "catch-up cancelled");
            return;
        }
        let page = match ledger.changes_since(&floors, batch).await {
            Ok(page) => page,
            Err(e) => {
                tracing::warn!(peer = %peer, "catch-up read failed: {e}");
                return;
            }
        };
        if page.is_empty() {
            break;
        }
        sent += page.len();
        floors.advance_by(&page);
        transport
            .send(&peer, &PeerMessage::changes(page.clone(), schema_version))
            .await;

        let Some(strong) = shared.upgrade() else {
            return;
        };
        let mut state = strong.state.lock().await;
        if !state.running {
            return;
        }
        let Some(entry) = state.peers.get_mut(&peer) else {
            return;
        };
        entry.cursor.advance_by(&page);
    }

    if cancel.load(Ordering::Relaxed) {
        return;
    }
    transport.send(&peer, &PeerMessage::eose()).await;

    // Drain what accumulated during catch-up, then go steady-state.
    let Some(strong) = shared.upgrade() else {
        return;
    };
    let mut state = strong.state.lock().await;
    if !state.running || cancel.load(Ordering::Relaxed) {
        return;
    }
    let schema_version = state.schema_version;
    let Some(entry) = state.peers.get_mut(&peer) else {
        return;
    };
    let pending = std::mem::take(&mut entry.pending);
    let drained: Vec<ChangeRecord> = pending
        .into_iter()
        .filter(|r| r.site_id.to_string() != peer)
        .filter(|r| r.db_version > entry.cursor.get(&r.site_id))
        .collect();
    let msg = if drained.is_empty() {
        None
    } else {
        entry.cursor.advance_by(&drained);
        Some(PeerMessage::changes(drained, schema_version))
    };
    entry.active = true;
    entry.catchup = None;
    tracing::info!(peer = %peer, sent, "catch-up complete, peer active");
    drop(state);
    if let Some(msg) = msg {
        transport.send(&peer, &msg).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::Value;
    use crate::memory::MemoryLedger;
    use async_trait::async_trait;
    use tokio::sync::Mutex as TokioMutex;

    /// Transport that records every outbound call.
    #[derive(Default)]
    struct RecordingTransport {
        sent: TokioMutex<Vec<(String, PeerMessage)>>,
        syncs: TokioMutex<Vec<(String, Cursor)>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        fn kind(&self) -> &'static str {
            "recording"
        }
        async fn start(&self, _handle: CoordinatorHandle) -> Result<(), Error> {
            Ok(())
        }
        async fn stop(&self) {}
        async fn request_sync(&self, peer: &str, cursor: &Cursor) {
            self.syncs.lock().await.push((peer.to_string(), cursor.clone()));
        }
        async fn send(&self, peer: &str, msg: &PeerMessage) {
            self.sent.lock().await.push((peer.to_string(), msg.clone()));
        }
        fn connected(&self) -> bool {
            true
        }
    }

    fn site(byte: u8) -> SiteId {
        SiteId([byte; 16])
    }

    async fn setup() -> (Coordinator, Arc<MemoryLedger>, Arc<RecordingTransport>, CoordinatorHandle) {
        let ledger = Arc::new(MemoryLedger::new(site(1)));
        let coordinator = Coordinator::new(ledger.clone());
        let transport = Arc::new(RecordingTransport::default());
        coordinator.attach(transport.clone()).await.unwrap();
        coordinator.start().await.unwrap();
        let handle = CoordinatorHandle {
            shared: Arc::downgrade(&coordinator.shared),
            transport: 0,
            kind: "recording",
        };
        (coordinator, ledger, transport, handle)
    }

    #[tokio::test]
    async fn connect_dispatches_sync_request() {
        let (_c, _l, transport, handle) = setup().await;
        handle.on_connect(&site(2).to_string()).await.unwrap();
        tokio::task::yield_now().await;
        // deferred: give the spawned task a beat
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let syncs = transport.syncs.lock().await;
        assert_eq!(syncs.len(), 1);
        assert_eq!(syncs[0].0, site(2).to_string());
    }

    #[tokio::test]
    async fn ingest_boundary_is_inclusive() {
        let (coordinator, ledger, _t, handle) = setup().await;
        let peer = site(2).to_string();
        handle.on_connect(&peer).await.unwrap();

        // Two records of one transaction at db_version 1, applied in two
        // messages: the second must not be dropped by the boundary.
        let author = MemoryLedger::new(site(2));
        let tx = author
            .write_tx(vec![
                ("t".into(), b"k".to_vec(), "a".into(), Value::Integer(1)),
                ("t".into(), b"k".to_vec(), "b".into(), Value::Integer(2)),
            ])
            .await;
        handle
            .on_receive(&peer, PeerMessage::changes(vec![tx[0].clone()], 1))
            .await
            .unwrap();
        handle
            .on_receive(&peer, PeerMessage::changes(vec![tx[1].clone()], 1))
            .await
            .unwrap();
        assert_eq!(ledger.record_count().await, 2);
        assert_eq!(coordinator.own_cursor().await.get(&site(2)), 1);
    }

    #[tokio::test]
    async fn schema_skew_drops_batch_and_emits_outdated() {
        let (coordinator, ledger, _t, handle) = setup().await;
        let mut events = coordinator.subscribe().await;
        let peer = site(2).to_string();
        handle.on_connect(&peer).await.unwrap();

        let author = MemoryLedger::new(site(2));
        let record = author.write("t", b"k", "a", Value::Integer(1)).await;
        handle
            .on_receive(&peer, PeerMessage::changes(vec![record], 9))
            .await
            .unwrap();

        assert_eq!(ledger.record_count().await, 0);
        assert_eq!(coordinator.own_cursor().await.get(&site(2)), 0);
        let mut saw_outdated = false;
        while let Ok(ev) = events.try_recv() {
            if let SyncEvent::Outdated { schema_version, .. } = ev {
                assert_eq!(schema_version, 9);
                saw_outdated = true;
            }
        }
        assert!(saw_outdated);
    }

    #[tokio::test]
    async fn malformed_record_aborts_whole_batch() {
        let (coordinator, ledger, _t, handle) = setup().await;
        let peer = site(2).to_string();
        handle.on_connect(&peer).await.unwrap();

        let author = MemoryLedger::new(site(2));
        let good = author.write("t", b"k", "a", Value::Integer(1)).await;
        let mut bad = good.clone();
        bad.cid = String::new();
        bad.seq = 1;
        let db_version = good.db_version;

        let err = handle
            .on_receive(&peer, PeerMessage::changes(vec![good, bad], 1))
            .await;
        assert!(err.is_err());
        // Nothing reaches the Ledger and own_cursor stays put, but the
        // peer sent these records regardless: its cursor covers the batch.
        assert_eq!(ledger.record_count().await, 0);
        assert_eq!(coordinator.own_cursor().await.get(&site(2)), 0);
        assert_eq!(
            coordinator.peer_cursor(&peer).await.unwrap().get(&site(2)),
            db_version
        );
    }

    #[tokio::test]
    async fn stopped_coordinator_rejects_callbacks() {
        let (coordinator, _l, _t, handle) = setup().await;
        coordinator.stop().await;
        let err = handle.on_connect(&site(2).to_string()).await;
        assert!(matches!(err, Err(Error::Stopped)));
    }
}
