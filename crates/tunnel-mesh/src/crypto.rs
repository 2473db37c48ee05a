//! Per-peer AEAD capability.
//!
//! Every peer shares a 32-byte symmetric key with us, delivered in its mapping
//! record. Packets are sealed with AES-256-GCM: the 4-byte address field is the
//! additional authenticated data and the nonce travels in the clear in front
//! of the ciphertext.

use crate::error::{MeshError, MeshResult};
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey};
use std::fmt;

/// Symmetric key length.
pub const KEY_LENGTH: usize = 32;

/// Nonce length fixed by AES-256-GCM.
pub const NONCE_LENGTH: usize = 12;

/// Authentication tag length fixed by AES-256-GCM.
pub const TAG_LENGTH: usize = 16;

/// Raw symmetric key material for one peer.
#[derive(Clone, PartialEq, Eq)]
pub struct PeerKey([u8; KEY_LENGTH]);

impl PeerKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Decode a base64-encoded key.
    pub fn from_base64(encoded: &str) -> MeshResult<Self> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| MeshError::Cipher(format!("Invalid base64 key: {}", e)))?;
        let bytes: [u8; KEY_LENGTH] = bytes.try_into().map_err(|v: Vec<u8>| {
            MeshError::Cipher(format!(
                "Invalid key length: {} bytes (expected {})",
                v.len(),
                KEY_LENGTH
            ))
        })?;
        Ok(Self(bytes))
    }

    /// Encode the key as base64.
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }
}

impl fmt::Debug for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PeerKey(<redacted>)")
    }
}

/// AEAD cipher bound to one peer key.
pub struct Cipher {
    key: LessSafeKey,
}

impl Cipher {
    /// Create a cipher for the given key.
    pub fn new(key: &PeerKey) -> MeshResult<Self> {
        let unbound = UnboundKey::new(&aead::AES_256_GCM, key.as_bytes())
            .map_err(|_| MeshError::Cipher("Failed to create AES-256-GCM key".into()))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
        })
    }

    /// Encrypt `in_out` in place and return the detached authentication tag.
    pub fn seal(&self, nonce: &[u8], aad: &[u8], in_out: &mut [u8]) -> MeshResult<[u8; TAG_LENGTH]> {
        let nonce = Nonce::try_assume_unique_for_key(nonce)
            .map_err(|_| MeshError::Cipher("Invalid nonce length".into()))?;
        let tag = self
            .key
            .seal_in_place_separate_tag(nonce, Aad::from(aad), in_out)
            .map_err(|_| MeshError::Cipher("Seal failed".into()))?;

        let mut out = [0u8; TAG_LENGTH];
        out.copy_from_slice(tag.as_ref());
        Ok(out)
    }

    /// Authenticate and decrypt `in_out` (ciphertext followed by the tag) in
    /// place. Returns the plaintext length.
    pub fn open(&self, nonce: &[u8], aad: &[u8], in_out: &mut [u8]) -> MeshResult<usize> {
        let nonce = Nonce::try_assume_unique_for_key(nonce)
            .map_err(|_| MeshError::Cipher("Invalid nonce length".into()))?;
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::from(aad), in_out)
            .map_err(|_| MeshError::Cipher("Authentication failed".into()))?;
        Ok(plaintext.len())
    }
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cipher").field("algorithm", &"AES-256-GCM").finish()
    }
}

/// Fill `nonce` with fresh OS randomness.
pub fn fill_nonce(nonce: &mut [u8]) -> MeshResult<()> {
    OsRng
        .try_fill_bytes(nonce)
        .map_err(|e| MeshError::Cipher(format!("Failed to draw nonce: {}", e)))
}
