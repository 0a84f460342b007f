//! In-memory reference Ledger.
//!
//! Implements the `Ledger` contract with a per-cell column-version
//! last-writer-wins merge (site id breaks ties), a change log ordered by
//! `(site_id, db_version, seq)`, and a version vector maintained from
//! absorbed records only. Used by every integration test in the workspace
//! and suitable for prototyping hosts.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::change::{ChangeRecord, SiteId, Value};
use crate::cursor::Cursor;
use crate::error::Error;
use crate::ledger::Ledger;

#[derive(Debug, Clone)]
struct Cell {
    val: Value,
    col_version: u64,
    site_id: SiteId,
}

#[derive(Default)]
struct Inner {
    /// (table, pk, cid) → winning cell.
    cells: HashMap<(String, Vec<u8>, String), Cell>,
    /// Absorbed records, ordered by (site, db_version, seq).
    log: BTreeMap<(SiteId, u64, u64), ChangeRecord>,
    /// Highest absorbed db_version per site. Records the merge discards do
    /// not advance this; echoing them into a cursor would re-introduce
    /// phantom sites on resync.
    vector: Cursor,
    schema_version: u64,
}

/// In-memory CRDT ledger with column-level last-writer-wins merge.
pub struct MemoryLedger {
    site: SiteId,
    inner: Mutex<Inner>,
}

impl MemoryLedger {
    pub fn new(site: SiteId) -> Self {
        Self::with_schema_version(site, 1)
    }

    pub fn with_schema_version(site: SiteId, schema_version: u64) -> Self {
        Self {
            site,
            inner: Mutex::new(Inner {
                schema_version,
                ..Inner::default()
            }),
        }
    }

    /// Bump the schema version (out-of-band upgrade).
    pub async fn set_schema_version(&self, schema_version: u64) {
        self.inner.lock().await.schema_version = schema_version;
    }

    /// Author one local column edit; returns the absorbed record.
    pub async fn write(
        &self,
        table: &str,
        pk: &[u8],
        cid: &str,
        val: Value,
    ) -> ChangeRecord {
        self.write_tx(vec![(table.to_string(), pk.to_vec(), cid.to_string(), val)])
            .await
            .pop()
            .expect("write_tx returns one record per row")
    }

    /// Author several edits as one logical transaction: all records share
    /// one `db_version`, disambiguated by `seq`.
    pub async fn write_tx(
        &self,
        rows: Vec<(String, Vec<u8>, String, Value)>,
    ) -> Vec<ChangeRecord> {
        let mut inner = self.inner.lock().await;
        let db_version = inner.vector.get(&self.site) + 1;
        let mut out = Vec::with_capacity(rows.len());
        for (seq, (table, pk, cid, val)) in rows.into_iter().enumerate() {
            let key = (table.clone(), pk.clone(), cid.clone());
            let col_version = inner.cells.get(&key).map(|c| c.col_version).unwrap_or(0) + 1;
            let record = ChangeRecord {
                table,
                pk,
                cid,
                val,
                col_version,
                db_version,
                site_id: self.site,
                cl: 1,
                seq: seq as u64,
            };
            Self::absorb(&mut inner, record.clone());
            out.push(record);
        }
        out
    }

    /// Current value of a cell, if any (test observation point).
    pub async fn cell(&self, table: &str, pk: &[u8], cid: &str) -> Option<Value> {
        let inner = self.inner.lock().await;
        inner
            .cells
            .get(&(table.to_string(), pk.to_vec(), cid.to_string()))
            .map(|c| c.val.clone())
    }

    /// All absorbed records in log order (test observation point).
    pub async fn records(&self) -> Vec<ChangeRecord> {
        self.inner.lock().await.log.values().cloned().collect()
    }

    pub async fn record_count(&self) -> usize {
        self.inner.lock().await.log.len()
    }

    fn absorb(inner: &mut Inner, record: ChangeRecord) {
        let log_key = (record.site_id, record.db_version, record.seq);
        if inner.log.contains_key(&log_key) {
            return; // already absorbed; replay is a no-op
        }
        let cell_key = (record.table.clone(), record.pk.clone(), record.cid.clone());
        let wins = match inner.cells.get(&cell_key) {
            None => true,
            Some(cell) => {
                (record.col_version, record.site_id) > (cell.col_version, cell.site_id)
            }
        };
        if !wins {
            return; // lost the merge: absorbed nowhere, vector untouched
        }
        inner.cells.insert(
            cell_key,
            Cell {
                val: record.val.clone(),
                col_version: record.col_version,
                site_id: record.site_id,
            },
        );
        inner.vector.advance(record.site_id, record.db_version);
        inner.log.insert(log_key, record);
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn site_id(&self) -> Result<SiteId, Error> {
        Ok(self.site)
    }

    async fn schema_version(&self) -> Result<u64, Error> {
        Ok(self.inner.lock().await.schema_version)
    }

    async fn changes_since(
        &self,
        floors: &Cursor,
        limit: usize,
    ) -> Result<Vec<ChangeRecord>, Error> {
        let inner = self.inner.lock().await;
        let mut out: Vec<ChangeRecord> = Vec::new();
        for (site, floor) in floors.sorted_pairs() {
            let range = inner
                .log
                .range((site, floor.saturating_add(1), 0)..(site, u64::MAX, u64::MAX));
            for (_, record) in range {
                // Never split a (site, db_version) group across pages.
                if out.len() >= limit {
                    match out.last() {
                        Some(last)
                            if record.site_id == last.site_id
                                && record.db_version == last.db_version => {}
                        _ => return Ok(out),
                    }
                }
                out.push(record.clone());
            }
        }
        Ok(out)
    }

    async fn apply_changes(&self, batch: &[ChangeRecord]) -> Result<(), Error> {
        for record in batch {
            record.validate()?;
        }
        let mut inner = self.inner.lock().await;
        for record in batch {
            Self::absorb(&mut inner, record.clone());
        }
        Ok(())
    }

    async fn version_vector(&self) -> Result<Cursor, Error> {
        Ok(self.inner.lock().await.vector.clone())
    }
}
