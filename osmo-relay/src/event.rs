//! Signed, encrypted relay events.
//!
//! Two event kinds flow between a directed pair of peers:
//!
//! - **CURSOR**: recipient-specific request, "restart your stream from
//!   this cursor under this stream id." Replaceable: a newer CURSOR from
//!   the same author to the same recipient overrides the previous one.
//! - **CHANGES**: the stream payload. Tag `r` binds the event to a
//!   CURSOR-issued stream id; tag `e` links to the previous CHANGES event
//!   in the chain (empty string on the first); `expiration` lets relays
//!   drop stale history.
//!
//! An event id is the SHA-256 of the canonical JSON array
//! `[0, pubkey, created_at, kind, tags, content]`; the signature is ECDSA
//! over the id. Content is sealed to the recipient: ECDH on the two
//! secp256k1 keys, HKDF-SHA256, then AES-256-GCM with the random nonce
//! prepended to the ciphertext, base64-encoded.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use osmo_engine::cursor::Cursor;
use osmo_engine::message::PeerMessage;

use crate::error::RelayError;

/// Stream-restart request, encrypted to the recipient.
pub const KIND_CURSOR: u32 = 28800;
/// Stream payload, chained by `e` tags under one `r` stream id.
pub const KIND_CHANGES: u32 = 28801;

/// Seconds until a CHANGES event may be expired by relays.
pub const CHANGES_TTL_SECS: u64 = 14 * 24 * 60 * 60;

/// Wall-clock seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Opaque random token binding a CHANGES sequence to a CURSOR request.
pub fn new_stream_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// Compressed SEC1 public key, lowercase hex.
pub fn pubkey_hex(key: &VerifyingKey) -> String {
    hex::encode(key.to_sec1_bytes())
}

/// A signed relay event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEvent {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl RelayEvent {
    /// Build and sign an event.
    pub fn sign(
        kind: u32,
        tags: Vec<Vec<String>>,
        content: String,
        created_at: u64,
        key: &SigningKey,
    ) -> Result<Self, RelayError> {
        let pubkey = pubkey_hex(key.verifying_key());
        let id = Self::compute_id(&pubkey, created_at, kind, &tags, &content)?;
        let id_bytes = hex::decode(&id).map_err(|e| RelayError::Crypto(e.to_string()))?;
        let sig: Signature = key.sign(&id_bytes);
        Ok(Self {
            id,
            pubkey,
            created_at,
            kind,
            tags,
            content,
            sig: hex::encode(sig.to_bytes()),
        })
    }

    fn compute_id(
        pubkey: &str,
        created_at: u64,
        kind: u32,
        tags: &[Vec<String>],
        content: &str,
    ) -> Result<String, RelayError> {
        let canonical = serde_json::to_vec(&(0u8, pubkey, created_at, kind, tags, content))?;
        Ok(hex::encode(Sha256::digest(&canonical)))
    }

    /// Check the id matches the content and the signature matches the id.
    pub fn verify(&self) -> Result<(), RelayError> {
        let expected = Self::compute_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )?;
        if expected != self.id {
            return Err(RelayError::Crypto("event id mismatch".into()));
        }
        let key_bytes = hex::decode(&self.pubkey).map_err(|e| RelayError::Crypto(e.to_string()))?;
        let key = VerifyingKey::from_sec1_bytes(&key_bytes)
            .map_err(|e| RelayError::Crypto(format!("bad pubkey: {e}")))?;
        let id_bytes = hex::decode(&self.id).map_err(|e| RelayError::Crypto(e.to_string()))?;
        let sig_bytes = hex::decode(&self.sig).map_err(|e| RelayError::Crypto(e.to_string()))?;
        let sig = Signature::from_slice(&sig_bytes)
            .map_err(|e| RelayError::Crypto(format!("bad signature: {e}")))?;
        key.verify(&id_bytes, &sig)
            .map_err(|e| RelayError::Crypto(format!("signature check failed: {e}")))
    }

    /// First value of the named tag.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some(name))
            .and_then(|t| t.get(1))
            .map(String::as_str)
    }

    pub fn expiration(&self) -> Option<u64> {
        self.tag_value("expiration").and_then(|v| v.parse().ok())
    }
}

/// Derive the pairwise AEAD key: ECDH → HKDF-SHA256.
fn shared_key(our: &SigningKey, their: &VerifyingKey) -> Result<[u8; 32], RelayError> {
    let shared = k256::ecdh::diffie_hellman(our.as_nonzero_scalar(), their.as_affine());
    let hk = hkdf::Hkdf::<Sha256>::new(None, shared.raw_secret_bytes().as_slice());
    let mut key = [0u8; 32];
    hk.expand(b"osmo-relay-v1", &mut key)
        .map_err(|e| RelayError::Crypto(e.to_string()))?;
    Ok(key)
}

/// Encrypt a payload to the recipient. Output: base64(nonce ‖ ciphertext).
pub fn seal(our: &SigningKey, their: &VerifyingKey, plaintext: &[u8]) -> Result<String, RelayError> {
    use aes_gcm::{Aes256Gcm, KeyInit, Nonce, aead::Aead};
    let key = shared_key(our, their)?;
    let cipher = Aes256Gcm::new(&key.into());
    let nonce_bytes: [u8; 12] = rand::random();
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ct = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| RelayError::Crypto(format!("seal failed: {e}")))?;
    let mut combined = Vec::with_capacity(12 + ct.len());
    combined.extend_from_slice(&nonce_bytes);
    combined.extend_from_slice(&ct);
    Ok(B64.encode(&combined))
}

/// Decrypt a payload from the sender.
pub fn open(our: &SigningKey, their: &VerifyingKey, content: &str) -> Result<Vec<u8>, RelayError> {
    use aes_gcm::{Aes256Gcm, KeyInit, Nonce, aead::Aead};
    let combined = B64
        .decode(content)
        .map_err(|e| RelayError::Crypto(e.to_string()))?;
    if combined.len() <= 12 {
        return Err(RelayError::Crypto("ciphertext too short".into()));
    }
    let key = shared_key(our, their)?;
    let cipher = Aes256Gcm::new(&key.into());
    let nonce = Nonce::from_slice(&combined[..12]);
    cipher
        .decrypt(nonce, &combined[12..])
        .map_err(|e| RelayError::Crypto(format!("open failed: {e}")))
}

/// Decrypted CURSOR content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorPayload {
    pub peer_id: String,
    pub stream_id: String,
    pub cursor: Cursor,
}

/// Decrypted CHANGES content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangesPayload {
    pub peer_id: String,
    pub msg: PeerMessage,
}
