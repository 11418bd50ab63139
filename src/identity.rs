//! src/identity.rs
//!
//! The node's cryptographic identity: an Ed25519 signing pair whose public
//! half *is* the node id, and an X25519 encryption pair for receiving sealed
//! envelopes. Both pairs are generated once, persisted to an owner-only
//! profile file, and reconstructed on every later start. Losing the signing
//! key loses the identity.

use crate::crypto;
use crate::error::{Error, Result};
use crate::wire::{compute_msg_id, Envelope, NodeId, Payload};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

const PROFILE_VERSION: &str = "1";

/// On-disk profile layout. Keypair fields are hex of secret ‖ public
/// (64 bytes → 128 chars). Secret material is zeroized when the parsed
/// profile is dropped.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct ProfileFile {
    version: String,
    display_name: String,
    signing_keypair: String,
    encryption_keypair: String,
}

/// Represents the cryptographic identity of a single node.
pub struct Identity {
    signing: SigningKey,
    encryption: StaticSecret,
    pub node_id: NodeId,
    pub display_name: String,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("node_id", &self.node_id)
            .field("display_name", &self.display_name)
            .finish_non_exhaustive()
    }
}

impl Identity {
    /// Generates a new, random identity.
    pub fn generate(display_name: &str) -> Self {
        let mut csprng = OsRng;
        let mut seed = [0u8; 32];
        csprng.fill_bytes(&mut seed);
        let signing = SigningKey::from_bytes(&seed);
        seed.zeroize();
        let encryption = StaticSecret::random_from_rng(csprng);
        let node_id = NodeId::new(signing.verifying_key().to_bytes());
        Self {
            signing,
            encryption,
            node_id,
            display_name: display_name.to_string(),
        }
    }

    /// Loads the identity from the profile file, or creates and persists a
    /// fresh one if the file does not exist yet. A file that exists but
    /// cannot be parsed is fatal: regenerating would silently mint a new
    /// identity.
    pub fn load_or_create<P: AsRef<Path>>(path: P, display_name: &str) -> Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(text) => Self::from_profile_text(&text).map_err(|reason| {
                Error::IdentityCorrupted {
                    path: path.display().to_string(),
                    reason,
                }
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let identity = Self::generate(display_name);
                identity.write_profile(path)?;
                tracing::info!(node_id = %identity.node_id, path = %path.display(), "Created new identity profile");
                Ok(identity)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn from_profile_text(text: &str) -> std::result::Result<Self, String> {
        let profile: ProfileFile =
            serde_json::from_str(text).map_err(|e| format!("parse error: {e}"))?;
        if profile.version != PROFILE_VERSION {
            return Err(format!("unsupported profile version {:?}", profile.version));
        }

        let (signing_secret, signing_public) = split_keypair_hex(&profile.signing_keypair)
            .ok_or("signing keypair is not 128 hex chars")?;
        let signing = SigningKey::from_bytes(&signing_secret);
        if signing.verifying_key().to_bytes() != signing_public {
            return Err("signing public key does not match secret".to_string());
        }

        let (encryption_secret, encryption_public) =
            split_keypair_hex(&profile.encryption_keypair)
                .ok_or("encryption keypair is not 128 hex chars")?;
        let encryption = StaticSecret::from(encryption_secret);
        if X25519Public::from(&encryption).to_bytes() != encryption_public {
            return Err("encryption public key does not match secret".to_string());
        }

        let node_id = NodeId::new(signing_public);
        Ok(Self {
            signing,
            encryption,
            node_id,
            display_name: profile.display_name.clone(),
        })
    }

    /// Writes the profile file with owner-only permissions. Refuses to
    /// clobber an existing file.
    fn write_profile(&self, path: &Path) -> Result<()> {
        let profile = ProfileFile {
            version: PROFILE_VERSION.to_string(),
            display_name: self.display_name.clone(),
            signing_keypair: join_keypair_hex(
                &self.signing.to_bytes(),
                &self.signing.verifying_key().to_bytes(),
            ),
            encryption_keypair: join_keypair_hex(
                &self.encryption.to_bytes(),
                &X25519Public::from(&self.encryption).to_bytes(),
            ),
        };
        let text = serde_json::to_string_pretty(&profile)?;

        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;
        use std::io::Write;
        file.write_all(text.as_bytes())?;
        Ok(())
    }

    /// Signs arbitrary bytes with the node's signing key.
    pub fn sign(&self, bytes: &[u8]) -> Signature {
        self.signing.sign(bytes)
    }

    /// Signs a payload, producing a complete wire envelope: canonical bytes
    /// are signed, and the msg_id is derived from the same bytes.
    pub fn sign_payload(&self, payload: Payload, ttl: u8) -> Result<Envelope> {
        let canonical = payload.canonical_bytes()?;
        let signature = self.signing.sign(&canonical);
        let msg_id = compute_msg_id(&self.node_id, &canonical);
        Ok(Envelope {
            msg_id,
            payload,
            sender_id: self.node_id,
            signature: hex::encode(signature.to_bytes()),
            ttl,
            extra: serde_json::Map::new(),
        })
    }

    /// Verifies a detached signature against a claimed sender. No identity
    /// state is needed; any node can check any envelope.
    pub fn verify(sender: &NodeId, bytes: &[u8], signature: &Signature) -> bool {
        match VerifyingKey::from_bytes(sender.as_bytes()) {
            Ok(key) => key.verify(bytes, signature).is_ok(),
            Err(_) => false,
        }
    }

    /// Seals `plaintext` for the holder of `recipient_pub` (hex X25519
    /// public key). The sender stays anonymous at the crypto layer.
    pub fn seal_for(recipient_pub_hex: &str, plaintext: &[u8]) -> Result<String> {
        let bytes = hex::decode(recipient_pub_hex).map_err(|_| Error::OpenFail)?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| Error::OpenFail)?;
        crypto::seal(&X25519Public::from(bytes), plaintext)
    }

    /// Opens a sealed envelope addressed to this node.
    pub fn open_sealed(&self, envelope_hex: &str) -> Result<Vec<u8>> {
        crypto::open(&self.encryption, envelope_hex)
    }

    /// Hex of the public half of the encryption pair, as shared with peers
    /// who want to invite this node.
    pub fn encryption_public_hex(&self) -> String {
        hex::encode(X25519Public::from(&self.encryption).to_bytes())
    }
}

fn split_keypair_hex(s: &str) -> Option<([u8; 32], [u8; 32])> {
    let bytes = hex::decode(s).ok()?;
    if bytes.len() != 64 {
        return None;
    }
    let secret: [u8; 32] = bytes[..32].try_into().ok()?;
    let public: [u8; 32] = bytes[32..].try_into().ok()?;
    Some((secret, public))
}

fn join_keypair_hex(secret: &[u8; 32], public: &[u8; 32]) -> String {
    let mut bytes = Vec::with_capacity(64);
    bytes.extend_from_slice(secret);
    bytes.extend_from_slice(public);
    hex::encode(bytes)
}

// --- Unit Tests ---
