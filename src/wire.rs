//! src/wire.rs
//!
//! The wire and storage model: node identifiers, message payloads, signed
//! envelopes, and the link-local hello frame.
//!
//! Everything on a peer stream is one JSON object per line. Signatures are
//! computed over the *canonical* serialization of the payload: compact JSON,
//! UTF-8, object keys in lexicographic order, optional fields omitted when
//! absent (never `null`). Canonical bytes are produced by round-tripping
//! through `serde_json::Value`, whose object map is BTree-backed and
//! therefore iterates keys in sorted order. Two independent canonicalizations
//! of equal payloads are byte-identical; protocol version "1" names this
//! rule.
//!
//! Fields unknown to this reader are captured in `extra` maps and survive a
//! re-serialization, so envelopes from newer nodes forward opaquely.

use crate::error::{Error, Result};
use chrono::{SecondsFormat, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

/// Version tag advertised over discovery and in hello frames. Bump on any
/// incompatible change to canonicalization or the envelope layout.
pub const PROTOCOL_VERSION: &str = "1";

/// The reserved channel: always public, present on every node, cannot be
/// left. Doubles as the control plane that carries invites.
pub const GENERAL_CHANNEL: &str = "#general";

/// A unique identifier for a node: its Ed25519 verifying key. Hex-encoded on
/// the wire and in the store.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId([u8; 32]);

impl NodeId {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|_| Error::FrameMalformed("bad node id".into()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::FrameMalformed("bad node id length".into()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node::{}", &hex::encode(&self.0[..4]))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        NodeId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// What an envelope carries. Unknown kinds from newer nodes survive as
/// `Other` and are forwarded but not dispatched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    #[serde(rename = "chat_message")]
    ChatMessage,
    #[serde(rename = "invite")]
    Invite,
    #[serde(untagged)]
    Other(String),
}

/// The signed portion of an envelope. `channel_id` lives here deliberately:
/// the signature covers it, so a message cannot be re-targeted to another
/// channel without breaking verification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub channel_id: String,
    pub kind: MessageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub timestamp: String,
    #[serde(default)]
    pub is_encrypted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Invite only: the channel key sealed for the target.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_key: Option<String>,
    /// Invite only: the private channel being invited to. Invites themselves
    /// ride the always-subscribed `#general` control channel.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invite_channel: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Payload {
    /// A plaintext chat message, timestamped now.
    pub fn chat(channel_id: &str, content: &str) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            kind: MessageKind::ChatMessage,
            content: Some(content.to_string()),
            timestamp: now_timestamp(),
            is_encrypted: false,
            nonce: None,
            encrypted_key: None,
            invite_channel: None,
            extra: serde_json::Map::new(),
        }
    }

    /// An encrypted chat message carrying ciphertext and its nonce.
    pub fn encrypted_chat(channel_id: &str, ciphertext_hex: String, nonce_hex: String) -> Self {
        Self {
            content: Some(ciphertext_hex),
            is_encrypted: true,
            nonce: Some(nonce_hex),
            ..Self::chat(channel_id, "")
        }
    }

    /// An invite for `invite_channel`, published on `#general`.
    pub fn invite(invite_channel: &str, encrypted_key: String) -> Self {
        Self {
            channel_id: GENERAL_CHANNEL.to_string(),
            kind: MessageKind::Invite,
            content: None,
            timestamp: now_timestamp(),
            is_encrypted: false,
            nonce: None,
            encrypted_key: Some(encrypted_key),
            invite_channel: Some(invite_channel.to_string()),
            extra: serde_json::Map::new(),
        }
    }

    /// The canonical bytes signatures are computed over.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let value = serde_json::to_value(self)?;
        Ok(value.to_string().into_bytes())
    }
}

/// The unit exchanged on the wire and stored: a payload bundled with its
/// originator, signature, and remaining hop budget.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub msg_id: String,
    pub payload: Payload,
    pub sender_id: NodeId,
    pub signature: String,
    pub ttl: u8,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Envelope {
    /// Verifies that the envelope was authentically produced by `sender_id`:
    /// the signature must check out over the canonical payload, and `msg_id`
    /// must equal its recomputation (it is a pure function of the origin
    /// content, so a mismatch is as inauthentic as a bad signature).
    pub fn verify(&self) -> Result<()> {
        let canonical = self.payload.canonical_bytes()?;
        let verifying_key = VerifyingKey::from_bytes(self.sender_id.as_bytes())
            .map_err(|_| Error::SignatureInvalid)?;
        let sig_bytes = hex::decode(&self.signature).map_err(|_| Error::SignatureInvalid)?;
        let signature =
            Signature::from_slice(&sig_bytes).map_err(|_| Error::SignatureInvalid)?;
        verifying_key
            .verify(&canonical, &signature)
            .map_err(|_| Error::SignatureInvalid)?;
        if self.msg_id != compute_msg_id(&self.sender_id, &canonical) {
            return Err(Error::SignatureInvalid);
        }
        Ok(())
    }

    /// A copy to pass along, with one hop spent. Callers must not forward
    /// when `ttl` is already zero.
    pub fn forwarded(&self) -> Self {
        let mut copy = self.clone();
        copy.ttl = self.ttl.saturating_sub(1);
        copy
    }

    /// One wire frame: the canonical JSON of the whole envelope. JSON string
    /// escaping guarantees the line itself contains no newline byte.
    pub fn to_line(&self) -> Result<String> {
        let value = serde_json::to_value(self)?;
        Ok(value.to_string())
    }
}

/// Derives the deduplication id: the first 16 bytes of
/// `SHA-256(sender_hex || canonical_payload)`, hex-encoded. The timestamp
/// sits inside the payload, so equal ids mean the same logical message
/// re-seen through the mesh.
pub fn compute_msg_id(sender: &NodeId, canonical_payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sender.to_hex().as_bytes());
    hasher.update(canonical_payload);
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

/// RFC 3339 UTC with fixed millisecond precision, so lexicographic order on
/// stored timestamps is chronological order.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// First frame on every outbound stream: identifies the dialer so the
/// acceptor can attribute inbound envelopes to a peer. Link-local: never
/// forwarded, never stored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub node_id: NodeId,
    pub protocol_version: String,
}

impl Hello {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }
}

/// Everything that may appear as one line on a peer stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Frame {
    Envelope(Box<Envelope>),
    Hello { hello: Hello },
}

impl Frame {
    pub fn parse(line: &str) -> Result<Self> {
        serde_json::from_str(line).map_err(|e| Error::FrameMalformed(e.to_string()))
    }

    pub fn hello(node_id: NodeId) -> Self {
        Frame::Hello {
            hello: Hello::new(node_id),
        }
    }

    pub fn to_line(&self) -> Result<String> {
        let value = serde_json::to_value(self)?;
        Ok(value.to_string())
    }
}

// --- Unit Tests ---
