//! The Ledger contract: everything the engine needs from storage.
//!
//! The Ledger is the CRDT-aware store below the engine. It owns conflict
//! resolution; the engine only moves change records around. The engine
//! calls these five operations and nothing else.

use async_trait::async_trait;

use crate::change::{ChangeRecord, SiteId};
use crate::cursor::Cursor;
use crate::error::Error;

/// Storage contract for the sync engine.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// This ledger's stable site identity.
    async fn site_id(&self) -> Result<SiteId, Error>;

    /// Current schema version, carried on every outbound changes message.
    async fn schema_version(&self) -> Result<u64, Error>;

    /// Records with `db_version` strictly above the per-site floors in
    /// `floors`, ordered by `(site_id, db_version, seq)`, at most `limit`
    /// rows. Sites absent from `floors` are not returned: callers add
    /// explicit zero floors for sites they want from the beginning.
    ///
    /// Implementations must not split records sharing `(site_id,
    /// db_version)` across pages: a logical transaction is returned whole
    /// even when that overshoots `limit`. Callers page by advancing the
    /// floors past the last returned record per site.
    async fn changes_since(&self, floors: &Cursor, limit: usize)
        -> Result<Vec<ChangeRecord>, Error>;

    /// Apply one batch in a single transaction, all-or-nothing. The ledger
    /// is free to discard individual records that lose its merge; a
    /// discarded record is not an error.
    async fn apply_changes(&self, batch: &[ChangeRecord]) -> Result<(), Error>;

    /// Highest `db_version` absorbed per site. This is the only source of
    /// truth for the coordinator's own cursor: records the merge discarded
    /// must not be reflected here.
    async fn version_vector(&self) -> Result<Cursor, Error>;
}
