//! The HTTP transport's JSON envelope.
//!
//! Every frame on the wire (SSE events downstream, POST bodies upstream)
//! is one `TransportMessage`. `ping` is a keepalive; `error` is
//! informational and never fatal.

use serde::{Deserialize, Serialize};

use osmo_engine::cursor::Cursor;
use osmo_engine::message::PeerMessage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TransportMessage {
    #[serde(rename = "connect")]
    Connect {
        #[serde(rename = "peerId")]
        peer_id: String,
    },
    #[serde(rename = "sync")]
    Sync {
        #[serde(rename = "peerId")]
        peer_id: String,
        cursor: Cursor,
    },
    #[serde(rename = "data")]
    Data {
        #[serde(rename = "peerId")]
        peer_id: String,
        data: PeerMessage,
    },
    #[serde(rename = "ping")]
    Ping {
        #[serde(rename = "peerId")]
        peer_id: String,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(rename = "peerId")]
        peer_id: String,
        error: String,
    },
}
