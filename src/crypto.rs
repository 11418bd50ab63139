//! src/crypto.rs
//!
//! The two cipher schemes the node relies on, kept behind a small interface
//! so the rest of the application never touches raw cipher state:
//!
//!   - Symmetric channel AEAD: ChaCha20-Poly1305 with a 256-bit key and a
//!     fresh random 96-bit nonce per message. Used for private-channel
//!     message bodies.
//!   - Sealed envelopes: anonymous-sender public-key encryption used to hand
//!     a channel key to exactly one recipient. An ephemeral X25519 keypair is
//!     generated per envelope; ECDH against the recipient's static key is
//!     expanded through HKDF-SHA256 into the AEAD key.
//!
//! Sealed envelope wire layout: `VERSION[1] | ephemeral_pk[32] | nonce[12] |
//! ciphertext`, hex-encoded for transport. Every decryption failure collapses
//! to `AuthFail`/`OpenFail`; callers cannot distinguish a wrong key from a
//! flipped bit.

use crate::error::{Error, Result};
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, KeyInit, Nonce};
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use std::fmt;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

const SEALED_VERSION: u8 = 0x01;
/// version + ephemeral pk + nonce + minimum poly1305 tag.
const SEALED_MIN_LEN: usize = 1 + 32 + NONCE_LEN + 16;
const SEALED_INFO: &[u8] = b"meshchat:sealed:v1";

/// A 256-bit symmetric channel key. Wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ChannelKey([u8; KEY_LEN]);

impl ChannelKey {
    /// Generates a fresh random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Reconstructs a key from a decrypted sealed envelope body.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|_| Error::OpenFail)?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Key material must never reach logs.
        write!(f, "ChannelKey(..)")
    }
}

/// Encrypts a message body with a channel key and a fresh random nonce.
/// Returns `(ciphertext_hex, nonce_hex)`.
pub fn encrypt(key: &ChannelKey, plaintext: &str) -> Result<(String, String)> {
    let cipher = ChaCha20Poly1305::new_from_slice(key.as_bytes()).expect("key length is KEY_LEN");
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
        .map_err(|_| Error::AuthFail)?;
    Ok((hex::encode(ciphertext), hex::encode(nonce_bytes)))
}

/// Decrypts a channel message body. Any malformed input, wrong key, or
/// tampered ciphertext/nonce/tag fails with `AuthFail`.
pub fn decrypt(key: &ChannelKey, ciphertext_hex: &str, nonce_hex: &str) -> Result<String> {
    let ciphertext = hex::decode(ciphertext_hex).map_err(|_| Error::AuthFail)?;
    let nonce_bytes = hex::decode(nonce_hex).map_err(|_| Error::AuthFail)?;
    if nonce_bytes.len() != NONCE_LEN {
        return Err(Error::AuthFail);
    }
    let cipher = ChaCha20Poly1305::new_from_slice(key.as_bytes()).expect("key length is KEY_LEN");
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_slice())
        .map_err(|_| Error::AuthFail)?;
    String::from_utf8(plaintext).map_err(|_| Error::AuthFail)
}

/// Seals `plaintext` so that only the holder of the secret half of
/// `recipient_pub` can open it. The sender is anonymous at this layer; the
/// envelope carries no key material identifying who sealed it.
pub fn seal(recipient_pub: &X25519Public, plaintext: &[u8]) -> Result<String> {
    // Ephemeral keypair, never reused.
    let ephemeral_secret = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = X25519Public::from(&ephemeral_secret);

    let shared = ephemeral_secret.diffie_hellman(recipient_pub);
    let aead_key = derive_aead_key(shared.as_bytes(), ephemeral_public.as_bytes());

    let cipher = ChaCha20Poly1305::new_from_slice(&aead_key).expect("key length is KEY_LEN");
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| Error::OpenFail)?;

    let mut out = Vec::with_capacity(1 + 32 + NONCE_LEN + ciphertext.len());
    out.push(SEALED_VERSION);
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(hex::encode(out))
}

/// Opens a sealed envelope with the recipient's static secret. Fails with
/// `OpenFail` when the envelope was sealed for someone else or was modified
/// in any way.
pub fn open(recipient_secret: &StaticSecret, envelope_hex: &str) -> Result<Vec<u8>> {
    let envelope = hex::decode(envelope_hex).map_err(|_| Error::OpenFail)?;
    if envelope.len() < SEALED_MIN_LEN {
        return Err(Error::OpenFail);
    }
    if envelope[0] != SEALED_VERSION {
        return Err(Error::OpenFail);
    }

    let epk_bytes: [u8; 32] = envelope[1..33].try_into().expect("length checked");
    let nonce_bytes: &[u8] = &envelope[33..33 + NONCE_LEN];
    let ciphertext = &envelope[33 + NONCE_LEN..];

    let ephemeral_public = X25519Public::from(epk_bytes);
    let shared = recipient_secret.diffie_hellman(&ephemeral_public);
    let aead_key = derive_aead_key(shared.as_bytes(), &epk_bytes);

    let cipher = ChaCha20Poly1305::new_from_slice(&aead_key).expect("key length is KEY_LEN");
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| Error::OpenFail)
}

/// Derive the envelope AEAD key from the X25519 shared secret. Using the
/// ephemeral public key as salt binds the key to this specific exchange.
fn derive_aead_key(shared: &[u8; 32], ephemeral_pk: &[u8; 32]) -> [u8; KEY_LEN] {
    let hk = Hkdf::<Sha256>::new(Some(ephemeral_pk), shared);
    let mut key = [0u8; KEY_LEN];
    hk.expand(SEALED_INFO, &mut key)
        .expect("HKDF output length is valid");
    key
}

// --- Unit Tests ---
