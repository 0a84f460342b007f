//! Persistent peer and stream-state stores.
//!
//! The relay transport is the only part of the engine that persists
//! anything: two rows per remote peer (send side and recv side), each a
//! cursor serialized as `[site_hex, db_version]` pairs plus the stream
//! token, the id of the last chain event, and its timestamp. Everything
//! else is rebuilt from the Ledger after a restart.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use rusqlite::{Connection, params};
use tokio::sync::Mutex;

use osmo_engine::cursor::Cursor;

use crate::error::RelayError;

/// One remote peer as configured by the host.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerSpec {
    /// The remote's site id, lowercase hex.
    pub peer_id: String,
    /// The remote's relay identity (compressed SEC1, hex).
    pub pubkey: String,
    /// Relay URLs, treated as redundant paths.
    pub relays: Vec<String>,
}

/// Source of the peer list the transport reconciles against.
#[async_trait]
pub trait PeerStore: Send + Sync {
    async fn list_peers(&self) -> Result<Vec<PeerSpec>, RelayError>;
}

/// Fixed (but swappable) peer list, for hosts that manage peers in memory.
#[derive(Default)]
pub struct StaticPeerStore {
    peers: parking_lot::Mutex<Vec<PeerSpec>>,
}

impl StaticPeerStore {
    pub fn new(peers: Vec<PeerSpec>) -> Self {
        Self {
            peers: parking_lot::Mutex::new(peers),
        }
    }

    /// Replace the peer list; the next reconcile pass picks it up.
    pub fn set_peers(&self, peers: Vec<PeerSpec>) {
        *self.peers.lock() = peers;
    }
}

#[async_trait]
impl PeerStore for StaticPeerStore {
    async fn list_peers(&self) -> Result<Vec<PeerSpec>, RelayError> {
        Ok(self.peers.lock().clone())
    }
}

/// Persisted state of one stream half (send or recv).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamState {
    /// Send side: what the peer last acknowledged. Recv side: what our
    /// Ledger has absorbed (never the raw incoming positions).
    pub cursor: Cursor,
    /// The stream token issued by the CURSOR event.
    pub cursor_id: String,
    /// Id of the last CHANGES event in the chain; empty before the first.
    pub event_id: String,
    /// `created_at` of that event; monotonic lower bound for the next one.
    pub timestamp: u64,
}

/// Key-value persistence for per-peer stream state. Plain semantics; no
/// transactional requirements across entries; distinct peers never touch
/// each other's rows.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn send_state(&self, peer_pubkey: &str) -> Result<Option<StreamState>, RelayError>;
    async fn set_send_state(&self, peer_pubkey: &str, state: &StreamState)
        -> Result<(), RelayError>;
    async fn recv_state(&self, peer_pubkey: &str) -> Result<Option<StreamState>, RelayError>;
    async fn set_recv_state(&self, peer_pubkey: &str, state: &StreamState)
        -> Result<(), RelayError>;
}

/// SQLite-backed peer list. One row per remote peer; relay URLs are a
/// JSON array. Hosts that pair peers out-of-band write rows here and the
/// transport's reconcile pass picks them up.
pub struct SqlitePeerStore {
    conn: Mutex<Connection>,
}

impl SqlitePeerStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RelayError> {
        let conn = Connection::open(path).map_err(sql_err)?;
        Self::init(conn)
    }

    /// In-memory database (for testing).
    pub fn open_memory() -> Result<Self, RelayError> {
        let conn = Connection::open_in_memory().map_err(sql_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, RelayError> {
        conn.execute_batch("PRAGMA journal_mode=WAL;").map_err(sql_err)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS peers (
                pubkey      TEXT PRIMARY KEY,
                peer_id     TEXT NOT NULL,
                relays_json TEXT NOT NULL DEFAULT '[]'
            );
            ",
        )
        .map_err(sql_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Add or update a peer row.
    pub async fn upsert_peer(&self, peer: &PeerSpec) -> Result<(), RelayError> {
        let relays_json =
            serde_json::to_string(&peer.relays).map_err(|e| RelayError::Store(e.to_string()))?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO peers (pubkey, peer_id, relays_json) VALUES (?1, ?2, ?3)
             ON CONFLICT(pubkey) DO UPDATE SET
                peer_id=excluded.peer_id,
                relays_json=excluded.relays_json",
            params![peer.pubkey, peer.peer_id, relays_json],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    /// Remove a peer row; the next reconcile pass stops its streams.
    pub async fn remove_peer(&self, pubkey: &str) -> Result<(), RelayError> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM peers WHERE pubkey = ?1", params![pubkey])
            .map_err(sql_err)?;
        Ok(())
    }
}

#[async_trait]
impl PeerStore for SqlitePeerStore {
    async fn list_peers(&self) -> Result<Vec<PeerSpec>, RelayError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT pubkey, peer_id, relays_json FROM peers ORDER BY pubkey")
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(sql_err)?;
        let mut peers = Vec::new();
        for row in rows {
            let (pubkey, peer_id, relays_json) = row.map_err(sql_err)?;
            let relays: Vec<String> = serde_json::from_str(&relays_json)
                .map_err(|e| RelayError::Store(format!("corrupt relays row: {e}")))?;
            peers.push(PeerSpec {
                peer_id,
                pubkey,
                relays,
            });
        }
        Ok(peers)
    }
}

/// In-memory state store for tests and throwaway deployments.
#[derive(Default)]
pub struct MemoryStateStore {
    rows: parking_lot::Mutex<HashMap<(String, &'static str), StreamState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn send_state(&self, peer_pubkey: &str) -> Result<Option<StreamState>, RelayError> {
        Ok(self.rows.lock().get(&(peer_pubkey.to_string(), "send")).cloned())
    }

    async fn set_send_state(
        &self,
        peer_pubkey: &str,
        state: &StreamState,
    ) -> Result<(), RelayError> {
        self.rows
            .lock()
            .insert((peer_pubkey.to_string(), "send"), state.clone());
        Ok(())
    }

    async fn recv_state(&self, peer_pubkey: &str) -> Result<Option<StreamState>, RelayError> {
        Ok(self.rows.lock().get(&(peer_pubkey.to_string(), "recv")).cloned())
    }

    async fn set_recv_state(
        &self,
        peer_pubkey: &str,
        state: &StreamState,
    ) -> Result<(), RelayError> {
        self.rows
            .lock()
            .insert((peer_pubkey.to_string(), "recv"), state.clone());
        Ok(())
    }
}

/// SQLite-backed state store. WAL mode; one upserted row per (peer, side).
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

impl SqliteStateStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RelayError> {
        let conn = Connection::open(path).map_err(sql_err)?;
        Self::init(conn)
    }

    /// In-memory database (for testing).
    pub fn open_memory() -> Result<Self, RelayError> {
        let conn = Connection::open_in_memory().map_err(sql_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, RelayError> {
        conn.execute_batch("PRAGMA journal_mode=WAL;").map_err(sql_err)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS peer_streams (
                peer_pubkey TEXT NOT NULL,
                side        TEXT NOT NULL CHECK(side IN ('send','recv')),
                cursor_json TEXT NOT NULL,
                cursor_id   TEXT NOT NULL,
                event_id    TEXT NOT NULL,
                event_ts    INTEGER NOT NULL,
                PRIMARY KEY (peer_pubkey, side)
            );
            ",
        )
        .map_err(sql_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    async fn get(&self, peer_pubkey: &str, side: &str) -> Result<Option<StreamState>, RelayError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT cursor_json, cursor_id, event_id, event_ts
                 FROM peer_streams WHERE peer_pubkey = ?1 AND side = ?2",
            )
            .map_err(sql_err)?;
        let mut rows = stmt
            .query_map(params![peer_pubkey, side], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })
            .map_err(sql_err)?;
        match rows.next() {
            Some(row) => {
                let (cursor_json, cursor_id, event_id, event_ts) = row.map_err(sql_err)?;
                let cursor: Cursor = serde_json::from_str(&cursor_json)
                    .map_err(|e| RelayError::Store(format!("corrupt cursor row: {e}")))?;
                Ok(Some(StreamState {
                    cursor,
                    cursor_id,
                    event_id,
                    timestamp: event_ts as u64,
                }))
            }
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        peer_pubkey: &str,
        side: &str,
        state: &StreamState,
    ) -> Result<(), RelayError> {
        let cursor_json = serde_json::to_string(&state.cursor)
            .map_err(|e| RelayError::Store(e.to_string()))?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO peer_streams (peer_pubkey, side, cursor_json, cursor_id, event_id, event_ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(peer_pubkey, side) DO UPDATE SET
                cursor_json=excluded.cursor_json,
                cursor_id=excluded.cursor_id,
                event_id=excluded.event_id,
                event_ts=excluded.event_ts",
            params![
                peer_pubkey,
                side,
                cursor_json,
                state.cursor_id,
                state.event_id,
                state.timestamp as i64,
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }
}

fn sql_err(e: rusqlite::Error) -> RelayError {
    RelayError::Store(e.to_string())
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn send_state(&self, peer_pubkey: &str) -> Result<Option<StreamState>, RelayError> {
        self.get(peer_pubkey, "send").await
    }

    async fn set_send_state(
        &self,
        peer_pubkey: &str,
        state: &StreamState,
    ) -> Result<(), RelayError> {
        self.set(peer_pubkey, "send", state).await
    }

    async fn recv_state(&self, peer_pubkey: &str) -> Result<Option<StreamState>, RelayError> {
        self.get(peer_pubkey, "recv").await
    }

    async fn set_recv_state(
        &self,
        peer_pubkey: &str,
        state: &StreamState,
    ) -> Result<(), RelayError> {
        self.set(peer_pubkey, "recv", state).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use osmo_engine::SiteId;

    fn state(version: u64) -> StreamState {
        StreamState {
            cursor: [(SiteId([1; 16]), version)].into_iter().collect(),
            cursor_id: "deadbeef".into(),
            event_id: "abc123".into(),
            timestamp: 1_700_000_000,
        }
    }

    #[tokio::test]
    async fn sqlite_round_trip_and_upsert() {
        let store = SqliteStateStore::open_memory().unwrap();
        assert!(store.send_state("pk").await.unwrap().is_none());

        store.set_send_state("pk", &state(3)).await.unwrap();
        assert_eq!(store.send_state("pk").await.unwrap(), Some(state(3)));

        // Upsert replaces in place.
        store.set_send_state("pk", &state(9)).await.unwrap();
        assert_eq!(store.send_state("pk").await.unwrap(), Some(state(9)));

        // Sides are independent rows.
        assert!(store.recv_state("pk").await.unwrap().is_none());
        store.set_recv_state("pk", &state(1)).await.unwrap();
        assert_eq!(store.recv_state("pk").await.unwrap(), Some(state(1)));
        assert_eq!(store.send_state("pk").await.unwrap(), Some(state(9)));
    }

    #[tokio::test]
    async fn sqlite_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("streams.db");
        {
            let store = SqliteStateStore::open(&path).unwrap();
            store.set_recv_state("pk", &state(7)).await.unwrap();
        }
        let store = SqliteStateStore::open(&path).unwrap();
        assert_eq!(store.recv_state("pk").await.unwrap(), Some(state(7)));
    }

    #[tokio::test]
    async fn peers_do_not_share_rows() {
        let store = MemoryStateStore::new();
        store.set_send_state("pk1", &state(1)).await.unwrap();
        store.set_send_state("pk2", &state(2)).await.unwrap();
        assert_eq!(store.send_state("pk1").await.unwrap(), Some(state(1)));
        assert_eq!(store.send_state("pk2").await.unwrap(), Some(state(2)));
    }

    #[tokio::test]
    async fn sqlite_peer_store_lists_and_removes() {
        let store = SqlitePeerStore::open_memory().unwrap();
        let alice = PeerSpec {
            peer_id: "aa".repeat(16),
            pubkey: "02".to_string() + &"11".repeat(32),
            relays: vec!["wss://relay-1".into(), "wss://relay-2".into()],
        };
        let bob = PeerSpec {
            peer_id: "bb".repeat(16),
            pubkey: "02".to_string() + &"22".repeat(32),
            relays: vec!["wss://relay-1".into()],
        };
        store.upsert_peer(&alice).await.unwrap();
        store.upsert_peer(&bob).await.unwrap();

        let peers = store.list_peers().await.unwrap();
        assert_eq!(peers.len(), 2);
        assert!(peers.contains(&alice));
        assert!(peers.contains(&bob));

        // Upsert replaces relays in place.
        let alice2 = PeerSpec {
            relays: vec!["wss://relay-3".into()],
            ..alice.clone()
        };
        store.upsert_peer(&alice2).await.unwrap();
        let peers = store.list_peers().await.unwrap();
        assert_eq!(peers.len(), 2);
        assert!(peers.contains(&alice2));

        store.remove_peer(&bob.pubkey).await.unwrap();
        let peers = store.list_peers().await.unwrap();
        assert_eq!(peers, vec![alice2]);
    }
}
