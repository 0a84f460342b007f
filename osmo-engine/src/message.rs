//! Peer messages: the coordinator ↔ transport envelope.

use serde::{Deserialize, Serialize};

use crate::change::ChangeRecord;

/// A message exchanged between two peers, carried by any transport.
///
/// `changes` pushes a batch of change records together with the sender's
/// schema version; `eose` ("end of stored events") terminates the initial
/// catch-up, after which steady-state pushes follow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PeerMessage {
    #[serde(rename = "changes")]
    Changes {
        data: Vec<ChangeRecord>,
        schema_version: u64,
    },
    #[serde(rename = "eose")]
    Eose {
        #[serde(default)]
        data: Vec<ChangeRecord>,
    },
}

impl PeerMessage {
    pub fn changes(data: Vec<ChangeRecord>, schema_version: u64) -> Self {
        PeerMessage::Changes { data, schema_version }
    }

    pub fn eose() -> Self {
        PeerMessage::Eose { data: Vec::new() }
    }

    /// Wire weight, summing record field lengths (batch sizing).
    pub fn weight(&self) -> usize {
        match self {
            PeerMessage::Changes { data, .. } => data.iter().map(|r| r.weight()).sum(),
            PeerMessage::Eose { .. } => 16,
        }
    }
}
