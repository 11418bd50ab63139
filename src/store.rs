//! src/store.rs
//!
//! The persistent message store: a single embedded SQLite database holding
//! channels, membership rows, and every authenticated message this node has
//! accepted. The store is a plain synchronous struct owned exclusively by
//! the node engine, which serializes all access through that single logical
//! connection.
//!
//! Schema changes are an explicit numbered migration list applied under
//! `PRAGMA user_version`; migrations only ever add, never drop.

use crate::error::Result;
use crate::wire::{now_timestamp, GENERAL_CHANNEL};
use rusqlite::{params, Connection, OptionalExtension};
use std::fmt;
use std::path::Path;

/// Numbered migrations. Index N runs when `user_version == N`.
const MIGRATIONS: &[&str] = &[
    // v1: base schema.
    "CREATE TABLE IF NOT EXISTS channels (
        channel_id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        kind TEXT DEFAULT 'public',
        owner_node_id TEXT,
        created_at TEXT
    );
    CREATE TABLE IF NOT EXISTS channel_members (
        channel_id TEXT,
        node_id TEXT,
        role TEXT DEFAULT 'member',
        joined_at TEXT,
        PRIMARY KEY (channel_id, node_id),
        FOREIGN KEY (channel_id) REFERENCES channels(channel_id)
    );
    CREATE TABLE IF NOT EXISTS messages (
        msg_id TEXT PRIMARY KEY,
        channel_id TEXT NOT NULL,
        sender_id TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        content TEXT NOT NULL,
        signature TEXT NOT NULL,
        is_encrypted INTEGER DEFAULT 0,
        nonce TEXT,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP,
        FOREIGN KEY (channel_id) REFERENCES channels(channel_id)
    );
    CREATE INDEX IF NOT EXISTS idx_messages_channel_time
        ON messages (channel_id, timestamp);",
    // v2: local subscription flag, added after the base schema shipped.
    "ALTER TABLE channels ADD COLUMN subscribed INTEGER DEFAULT 1;",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelKind {
    Public,
    Private,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Public => "public",
            ChannelKind::Private => "private",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "private" => ChannelKind::Private,
            _ => ChannelKind::Public,
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberRole {
    Owner,
    Member,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberRole::Owner => "owner",
            MemberRole::Member => "member",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "owner" => MemberRole::Owner,
            _ => MemberRole::Member,
        }
    }
}

/// Channel metadata as recorded locally.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelMeta {
    pub channel_id: String,
    pub kind: ChannelKind,
    pub owner_id: Option<String>,
    pub created_at: String,
    pub subscribed: bool,
}

/// One stored message. For private channels `content` holds ciphertext.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageRow {
    pub msg_id: String,
    pub channel_id: String,
    pub sender_id: String,
    pub timestamp: String,
    pub content: String,
    pub signature: String,
    pub is_encrypted: bool,
    pub nonce: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub channels: u64,
    pub messages: u64,
    pub members: u64,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Opens (creating if needed) and migrates the database. Failure here is
    /// fatal to the node.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::initialize(conn)
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let mut version: usize =
            conn.query_row("PRAGMA user_version", [], |row| row.get::<_, i64>(0))? as usize;
        while version < MIGRATIONS.len() {
            conn.execute_batch(MIGRATIONS[version])?;
            version += 1;
            conn.pragma_update(None, "user_version", version as i64)?;
            tracing::debug!(version, "Applied store migration");
        }

        let store = Self { conn };
        // The reserved channel exists on every node from the first start.
        store.store_channel(GENERAL_CHANNEL, ChannelKind::Public, None)?;
        Ok(store)
    }

    /// Inserts a message, ignoring duplicates. Returns whether the row was
    /// new; a `msg_id` conflict is not an error.
    pub fn store_message(&self, row: &MessageRow) -> Result<bool> {
        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO messages
                (msg_id, channel_id, sender_id, timestamp, content, signature, is_encrypted, nonce)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                row.msg_id,
                row.channel_id,
                row.sender_id,
                row.timestamp,
                row.content,
                row.signature,
                row.is_encrypted as i64,
                row.nonce,
            ],
        )?;
        Ok(changed > 0)
    }

    /// The most recent `limit` messages of a channel, oldest first.
    pub fn get_messages_for_channel(&self, channel_id: &str, limit: u32) -> Result<Vec<MessageRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT msg_id, channel_id, sender_id, timestamp, content, signature, is_encrypted, nonce
             FROM messages WHERE channel_id = ?1
             ORDER BY timestamp DESC LIMIT ?2",
        )?;
        let mut rows: Vec<MessageRow> = stmt
            .query_map(params![channel_id, limit], |row| {
                Ok(MessageRow {
                    msg_id: row.get(0)?,
                    channel_id: row.get(1)?,
                    sender_id: row.get(2)?,
                    timestamp: row.get(3)?,
                    content: row.get(4)?,
                    signature: row.get(5)?,
                    is_encrypted: row.get::<_, i64>(6)? != 0,
                    nonce: row.get(7)?,
                })
            })?
            .collect::<std::result::Result<_, _>>()?;
        rows.reverse();
        Ok(rows)
    }

    /// Records a channel if it is not already known. Idempotent.
    pub fn store_channel(
        &self,
        channel_id: &str,
        kind: ChannelKind,
        owner_id: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO channels (channel_id, name, kind, owner_node_id, created_at, subscribed)
             VALUES (?1, ?1, ?2, ?3, ?4, 1)",
            params![channel_id, kind.as_str(), owner_id, now_timestamp()],
        )?;
        Ok(())
    }

    pub fn get_channel_info(&self, channel_id: &str) -> Result<Option<ChannelMeta>> {
        self.conn
            .query_row(
                "SELECT channel_id, kind, owner_node_id, created_at, subscribed
                 FROM channels WHERE channel_id = ?1",
                params![channel_id],
                |row| {
                    Ok(ChannelMeta {
                        channel_id: row.get(0)?,
                        kind: ChannelKind::from_str(&row.get::<_, String>(1)?),
                        owner_id: row.get(2)?,
                        created_at: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                        subscribed: row.get::<_, Option<i64>>(4)?.unwrap_or(1) != 0,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
    }

    /// Flips the local subscription flag; rows for unknown channels are
    /// created as public on demand.
    pub fn set_subscribed(&self, channel_id: &str, subscribed: bool) -> Result<()> {
        self.store_channel(channel_id, ChannelKind::Public, None)?;
        self.conn.execute(
            "UPDATE channels SET subscribed = ?2 WHERE channel_id = ?1",
            params![channel_id, subscribed as i64],
        )?;
        Ok(())
    }

    /// Channel ids with the subscription flag set, for reload at start.
    pub fn subscribed_channels(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT channel_id FROM channels WHERE subscribed = 1")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        Ok(ids)
    }

    pub fn add_member(&self, channel_id: &str, node_id: &str, role: MemberRole) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO channel_members (channel_id, node_id, role, joined_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![channel_id, node_id, role.as_str(), now_timestamp()],
        )?;
        Ok(())
    }

    pub fn remove_member(&self, channel_id: &str, node_id: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM channel_members WHERE channel_id = ?1 AND node_id = ?2",
            params![channel_id, node_id],
        )?;
        Ok(())
    }

    pub fn is_member(&self, channel_id: &str, node_id: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM channel_members WHERE channel_id = ?1 AND node_id = ?2",
            params![channel_id, node_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn get_members(&self, channel_id: &str) -> Result<Vec<(String, MemberRole)>> {
        let mut stmt = self.conn.prepare(
            "SELECT node_id, role FROM channel_members WHERE channel_id = ?1 ORDER BY joined_at",
        )?;
        let members = stmt
            .query_map(params![channel_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    MemberRole::from_str(&row.get::<_, String>(1)?),
                ))
            })?
            .collect::<std::result::Result<_, _>>()?;
        Ok(members)
    }

    /// Message count, per channel or global.
    pub fn get_message_count(&self, channel_id: Option<&str>) -> Result<u64> {
        let count: i64 = match channel_id {
            Some(id) => self.conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE channel_id = ?1",
                params![id],
                |row| row.get(0),
            )?,
            None => self
                .conn
                .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?,
        };
        Ok(count as u64)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let channels: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM channels", [], |row| row.get(0))?;
        let members: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM channel_members", [], |row| row.get(0))?;
        Ok(StoreStats {
            channels: channels as u64,
            messages: self.get_message_count(None)?,
            members: members as u64,
        })
    }
}

// --- Unit Tests ---
