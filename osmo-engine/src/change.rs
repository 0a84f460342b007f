//! Change records: the wire-level unit of replication.
//!
//! A change record is one column-level edit from one site, tagged with the
//! CRDT metadata the Ledger needs to merge it. Records are immutable once
//! authored; `(site_id, db_version, seq)` is unique across the network.
//!
//! On the wire, `pk` and `site_id` travel as lowercase hex strings of even
//! length; in memory they are raw bytes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

/// Stable 16-byte identity of a Ledger instance.
///
/// Rendered as 32 lowercase hex characters. Survives restarts; every change
/// record carries the site id of the peer that authored it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SiteId(pub [u8; 16]);

impl SiteId {
    /// A random site id (host convenience for fresh ledgers and tests).
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for SiteId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let bytes = hex::decode(s)
            .map_err(|e| Error::BadIdentifier(format!("site id {s:?}: {e}")))?;
        let arr: [u8; 16] = bytes
            .try_into()
            .map_err(|_| Error::BadIdentifier(format!("site id {s:?}: not 16 bytes")))?;
        Ok(Self(arr))
    }
}

impl Serialize for SiteId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SiteId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A column value. Mirrors the primitive types the Ledger stores.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    /// Rough wire weight, used when sizing outbound batches.
    pub fn weight(&self) -> usize {
        match self {
            Value::Null => 4,
            Value::Integer(_) | Value::Real(_) => 8,
            Value::Text(s) => s.len(),
            Value::Blob(b) => b.len() * 2,
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Integer(i) => serializer.serialize_i64(*i),
            Value::Real(r) => serializer.serialize_f64(*r),
            Value::Text(s) => serializer.serialize_str(s),
            Value::Blob(b) => {
                use serde::ser::SerializeMap;
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("$hex", &hex::encode(b))?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        match raw {
            serde_json::Value::Null => Ok(Value::Null),
            serde_json::Value::Bool(b) => Ok(Value::Integer(b as i64)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::Integer(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(Value::Real(f))
                } else {
                    Err(serde::de::Error::custom("unrepresentable number"))
                }
            }
            serde_json::Value::String(s) => Ok(Value::Text(s)),
            serde_json::Value::Object(map) => {
                let hex_str = map
                    .get("$hex")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| serde::de::Error::custom("expected {\"$hex\": …} blob"))?;
                let bytes = hex::decode(hex_str).map_err(serde::de::Error::custom)?;
                Ok(Value::Blob(bytes))
            }
            serde_json::Value::Array(_) => Err(serde::de::Error::custom("arrays are not column values")),
        }
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

/// One column-level edit with CRDT metadata.
///
/// For a given `site_id`, `db_version` is non-decreasing over the author's
/// change stream; a single logical transaction may produce several records
/// sharing one `db_version`, disambiguated by `seq`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub table: String,
    #[serde(with = "hex_bytes")]
    pub pk: Vec<u8>,
    pub cid: String,
    pub val: Value,
    pub col_version: u64,
    pub db_version: u64,
    pub site_id: SiteId,
    pub cl: u64,
    pub seq: u64,
}

impl ChangeRecord {
    /// Well-formedness check run before a batch is applied. A malformed
    /// record aborts the whole batch with no partial apply.
    pub fn validate(&self) -> Result<(), Error> {
        if self.table.is_empty() {
            return Err(Error::InvalidRecord("empty table name".into()));
        }
        if self.cid.is_empty() {
            return Err(Error::InvalidRecord(format!(
                "record for {:?} has empty column id",
                self.table
            )));
        }
        if self.pk.is_empty() {
            return Err(Error::InvalidRecord(format!(
                "record for {:?}.{:?} has empty primary key",
                self.table, self.cid
            )));
        }
        if self.db_version == 0 {
            return Err(Error::InvalidRecord(format!(
                "record for {:?}.{:?} has db_version 0",
                self.table, self.cid
            )));
        }
        Ok(())
    }

    /// Wire weight of this record, summing field lengths. Used by
    /// transports to size batches against their payload targets.
    pub fn weight(&self) -> usize {
        self.table.len() + self.pk.len() * 2 + self.cid.len() + self.val.weight() + 8 * 4 + 32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ChangeRecord {
        ChangeRecord {
            table: "notes".into(),
            pk: vec![0x01, 0x02],
            cid: "body".into(),
            val: Value::Text("hello".into()),
            col_version: 1,
            db_version: 3,
            site_id: "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".parse().unwrap(),
            cl: 1,
            seq: 0,
        }
    }

    #[test]
    fn site_id_hex_round_trip() {
        let id = SiteId([0xab; 16]);
        let s = id.to_string();
        assert_eq!(s, "ab".repeat(16));
        assert_eq!(s.parse::<SiteId>().unwrap(), id);
    }

    #[test]
    fn site_id_rejects_bad_hex() {
        assert!("zz".repeat(16).parse::<SiteId>().is_err());
        assert!("abcd".parse::<SiteId>().is_err());
    }

    #[test]
    fn record_wire_form_hex_encodes_bytes() {
        let json = serde_json::to_value(record()).unwrap();
        assert_eq!(json["pk"], "0102");
        assert_eq!(json["site_id"], "aa".repeat(16));
        let back: ChangeRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record());
    }

    #[test]
    fn value_variants_round_trip() {
        for val in [
            Value::Null,
            Value::Integer(-7),
            Value::Real(2.5),
            Value::Text("x".into()),
            Value::Blob(vec![1, 2, 3]),
        ] {
            let json = serde_json::to_string(&val).unwrap();
            let back: Value = serde_json::from_str(&json).unwrap();
            assert_eq!(back, val);
        }
    }

    #[test]
    fn validation_rejects_malformed() {
        let mut r = record();
        r.table = String::new();
        assert!(r.validate().is_err());

        let mut r = record();
        r.db_version = 0;
        assert!(r.validate().is_err());

        assert!(record().validate().is_ok());
    }
}
