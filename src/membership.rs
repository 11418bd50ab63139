//! src/membership.rs
//!
//! Channel and membership logic: channel id validation, creation, the
//! owner-side invite path, and acceptance of invites arriving off the mesh.
//! The in-memory channel key table lives here; keys exist only for the
//! lifetime of the process and are re-acquired by a fresh invite after a
//! restart.

use crate::{
    crypto::ChannelKey,
    error::{Error, Result},
    identity::Identity,
    store::{ChannelKind, MemberRole, Store},
    wire::{Envelope, Payload, GENERAL_CHANNEL},
};
use std::collections::HashMap;

/// Channel ids look like `#name`: leading hash, at least one more
/// character, no whitespace.
pub fn validate_channel_id(id: &str) -> Result<()> {
    let valid = id.len() > 1
        && id.starts_with('#')
        && !id.chars().any(|c| c.is_whitespace());
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidId(id.to_string()))
    }
}

/// Holds channel state the store cannot: the symmetric keys of private
/// channels this node participates in.
#[derive(Default)]
pub struct Membership {
    keys: HashMap<String, ChannelKey>,
}

impl Membership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(&self, channel_id: &str) -> Option<&ChannelKey> {
        self.keys.get(channel_id)
    }

    /// Creates a channel. Private channels get a fresh key with this node
    /// recorded as owner and first member.
    pub fn create_channel(
        &mut self,
        store: &Store,
        identity: &Identity,
        channel_id: &str,
        kind: ChannelKind,
    ) -> Result<()> {
        validate_channel_id(channel_id)?;
        if store.get_channel_info(channel_id)?.is_some() {
            return Err(Error::Exists(channel_id.to_string()));
        }
        match kind {
            ChannelKind::Public => {
                store.store_channel(channel_id, ChannelKind::Public, None)?;
            }
            ChannelKind::Private => {
                let self_hex = identity.node_id.to_hex();
                store.store_channel(channel_id, ChannelKind::Private, Some(&self_hex))?;
                store.add_member(channel_id, &self_hex, MemberRole::Owner)?;
                self.keys
                    .insert(channel_id.to_string(), ChannelKey::generate());
            }
        }
        tracing::info!(channel = %channel_id, kind = %kind, "Created channel");
        Ok(())
    }

    /// Builds the invite payload for `target`, after checking that this
    /// node owns the channel and still holds its key. The channel key is
    /// sealed so only the target can recover it; the invite itself rides
    /// the always-subscribed control channel.
    pub fn build_invite(
        &self,
        store: &Store,
        identity: &Identity,
        channel_id: &str,
        target_node_id: &str,
        target_encryption_pub: &str,
    ) -> Result<Payload> {
        let meta = store
            .get_channel_info(channel_id)?
            .ok_or_else(|| Error::InvalidId(channel_id.to_string()))?;
        if meta.kind != ChannelKind::Private
            || meta.owner_id.as_deref() != Some(identity.node_id.to_hex().as_str())
        {
            return Err(Error::NotOwner(channel_id.to_string()));
        }
        let key = self
            .keys
            .get(channel_id)
            .ok_or_else(|| Error::NoKey(channel_id.to_string()))?;

        let sealed = Identity::seal_for(target_encryption_pub, key.as_bytes())?;
        store.add_member(channel_id, target_node_id, MemberRole::Member)?;
        Ok(Payload::invite(channel_id, sealed))
    }

    /// Processes an invite envelope from the mesh. Returns the channel id
    /// when this node was the intended recipient; `None` when the sealed
    /// key was not for us (the normal case for everyone else, dropped
    /// silently). The caller subscribes the channel and surfaces the event.
    pub fn accept_invite(
        &mut self,
        store: &Store,
        identity: &Identity,
        envelope: &Envelope,
    ) -> Result<Option<String>> {
        let payload = &envelope.payload;
        let (Some(encrypted_key), Some(channel_id)) =
            (&payload.encrypted_key, &payload.invite_channel)
        else {
            tracing::debug!(msg_id = %envelope.msg_id, "Invite without key or channel; ignoring");
            return Ok(None);
        };
        if validate_channel_id(channel_id).is_err() || channel_id == GENERAL_CHANNEL {
            tracing::debug!(channel = %channel_id, "Invite names an invalid channel; ignoring");
            return Ok(None);
        }

        let key_bytes = match identity.open_sealed(encrypted_key) {
            Ok(bytes) => bytes,
            Err(_) => {
                // Sealed for someone else.
                tracing::debug!(msg_id = %envelope.msg_id, "Invite not addressed to us");
                return Ok(None);
            }
        };
        let key = match ChannelKey::from_slice(&key_bytes) {
            Ok(key) => key,
            Err(_) => {
                tracing::debug!(msg_id = %envelope.msg_id, "Invite key has the wrong length; ignoring");
                return Ok(None);
            }
        };

        let owner_hex = envelope.sender_id.to_hex();
        let self_hex = identity.node_id.to_hex();
        store.store_channel(channel_id, ChannelKind::Private, Some(&owner_hex))?;
        store.add_member(channel_id, &owner_hex, MemberRole::Owner)?;
        store.add_member(channel_id, &self_hex, MemberRole::Member)?;
        self.keys.insert(channel_id.clone(), key);

        tracing::info!(channel = %channel_id, owner = %envelope.sender_id, "Accepted channel invite");
        Ok(Some(channel_id.clone()))
    }
}

// --- Unit Tests ---
