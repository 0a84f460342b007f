//! Cursors: per-site high-water marks.
//!
//! A cursor maps each known origin site to the highest `db_version` the
//! holder has absorbed from it. Cursors only ever move forward; two cursors
//! are compared pointwise. The empty cursor is the unit.
//!
//! Wire form: a JSON array of `[site_id_hex, db_version]` pairs, sorted by
//! site id so the encoding is deterministic.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::change::{ChangeRecord, SiteId};

/// Finite map site-id → highest absorbed `db_version`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cursor(HashMap<SiteId, u64>);

impl Cursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// The floor for `site`: 0 when the site is unknown.
    pub fn get(&self, site: &SiteId) -> u64 {
        self.0.get(site).copied().unwrap_or(0)
    }

    pub fn contains(&self, site: &SiteId) -> bool {
        self.0.contains_key(site)
    }

    /// Raise the mark for `site` to at least `version`. Never lowers.
    pub fn advance(&mut self, site: SiteId, version: u64) {
        let entry = self.0.entry(site).or_insert(0);
        if version > *entry {
            *entry = version;
        }
    }

    /// Raise marks to cover every record in `records`.
    pub fn advance_by(&mut self, records: &[ChangeRecord]) {
        for r in records {
            self.advance(r.site_id, r.db_version);
        }
    }

    /// Pointwise merge: the result knows everything either side knows.
    pub fn merge(&mut self, other: &Cursor) {
        for (site, version) in &other.0 {
            self.advance(*site, *version);
        }
    }

    /// True when `other` has a higher mark for some site, or knows a site
    /// missing here. Pointwise-≤ with strictness on at least one entry.
    pub fn is_strictly_older_than(&self, other: &Cursor) -> bool {
        other.0.iter().any(|(site, v)| self.get(site) < *v)
    }

    pub fn sites(&self) -> impl Iterator<Item = &SiteId> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SiteId, &u64)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Pairs sorted by site id (deterministic wire and query order).
    pub fn sorted_pairs(&self) -> Vec<(SiteId, u64)> {
        let mut pairs: Vec<_> = self.0.iter().map(|(s, v)| (*s, *v)).collect();
        pairs.sort_by_key(|(s, _)| *s);
        pairs
    }
}

impl FromIterator<(SiteId, u64)> for Cursor {
    fn from_iter<T: IntoIterator<Item = (SiteId, u64)>>(iter: T) -> Self {
        let mut cursor = Cursor::new();
        for (site, version) in iter {
            cursor.advance(site, version);
        }
        cursor
    }
}

impl Serialize for Cursor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeSeq;
        let pairs = self.sorted_pairs();
        let mut seq = serializer.serialize_seq(Some(pairs.len()))?;
        for (site, version) in pairs {
            seq.serialize_element(&(site.to_string(), version))?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Cursor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let pairs: Vec<(String, u64)> = Vec::deserialize(deserializer)?;
        let mut cursor = Cursor::new();
        for (site, version) in pairs {
            let site: SiteId = site.parse().map_err(serde::de::Error::custom)?;
            cursor.advance(site, version);
        }
        Ok(cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(byte: u8) -> SiteId {
        SiteId([byte; 16])
    }

    #[test]
    fn advance_is_monotonic() {
        let mut c = Cursor::new();
        c.advance(site(1), 5);
        c.advance(site(1), 3);
        assert_eq!(c.get(&site(1)), 5);
        c.advance(site(1), 9);
        assert_eq!(c.get(&site(1)), 9);
    }

    #[test]
    fn unknown_site_floor_is_zero() {
        let c = Cursor::new();
        assert_eq!(c.get(&site(7)), 0);
        assert!(!c.contains(&site(7)));
    }

    #[test]
    fn strict_ordering() {
        let a: Cursor = [(site(1), 3)].into_iter().collect();
        let b: Cursor = [(site(1), 3), (site(2), 1)].into_iter().collect();
        // b knows a site a doesn't
        assert!(a.is_strictly_older_than(&b));
        assert!(!b.is_strictly_older_than(&a));
        // equal cursors are not ordered
        assert!(!a.is_strictly_older_than(&a.clone()));
    }

    #[test]
    fn serde_round_trip_is_identity() {
        let c: Cursor = [(site(2), 10), (site(1), 4)].into_iter().collect();
        let json = serde_json::to_string(&c).unwrap();
        let back: Cursor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
        // sorted, deterministic encoding
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v[0][0], "01".repeat(16));
        assert_eq!(v[1][0], "02".repeat(16));
    }

    #[test]
    fn merge_covers_both() {
        let mut a: Cursor = [(site(1), 3)].into_iter().collect();
        let b: Cursor = [(site(1), 2), (site(2), 8)].into_iter().collect();
        a.merge(&b);
        assert_eq!(a.get(&site(1)), 3);
        assert_eq!(a.get(&site(2)), 8);
    }
}
