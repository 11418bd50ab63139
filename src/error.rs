//! src/error.rs
//!
//! Defines the library's custom, comprehensive `Error` enum using `thiserror`.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize or deserialize: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Identity profile at {path} is corrupted: {reason}")]
    IdentityCorrupted { path: String, reason: String },

    #[error("Discovery error: {0}")]
    Discovery(#[from] mdns_sd::Error),

    #[error("Invalid signature")]
    SignatureInvalid,

    #[error("Symmetric decryption failed")]
    AuthFail,

    #[error("Sealed envelope could not be opened")]
    OpenFail,

    #[error("Frame exceeds the {max}-byte cap ({len} bytes)")]
    FrameOversize { len: usize, max: usize },

    #[error("Malformed frame: {0}")]
    FrameMalformed(String),

    #[error("Not connected to peer {0}")]
    NotConnected(String),

    #[error("Not the owner of channel {0}")]
    NotOwner(String),

    #[error("No key held for private channel {0}")]
    NoKey(String),

    #[error("Channel {0} already exists")]
    Exists(String),

    #[error("Invalid channel id {0:?}")]
    InvalidId(String),

    #[error("Not subscribed to channel {0}")]
    NotSubscribed(String),

    #[error("Channel {0} is reserved and cannot be left")]
    ReservedChannel(String),

    #[error("Node is not running")]
    NodeStopped,
}
