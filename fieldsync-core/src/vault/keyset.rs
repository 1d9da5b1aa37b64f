//! Per-install data-encryption keyset.
//!
//! A keyset holds one or more AES-256-GCM keys, each with a 32-bit id. New
//! data is always encrypted under the primary key, and every blob carries the
//! id of the key that produced it:
//!
//! ```text
//! key_id (4, big-endian) || iv (12) || ciphertext || tag (16)
//! ```
//!
//! Rotating adds a fresh primary while keeping older keys, so blobs written
//! before a rotation stay readable.

use crate::crypto::cipher::{self, Ciphertext, SymmetricKey, KEY_LEN};
use crate::crypto::serde_b64;
use crate::vault::{Result, VaultError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

const KEY_ID_LEN: usize = 4;

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct KeysetEntry {
    id: u32,
    #[serde(with = "serde_b64::array")]
    material: [u8; KEY_LEN],
}

impl KeysetEntry {
    fn generate(id: u32) -> Self {
        let key = SymmetricKey::generate();
        Self {
            id,
            material: *key.as_bytes(),
        }
    }

    fn key(&self) -> SymmetricKey {
        SymmetricKey::from_bytes(self.material)
    }
}

/// Versioned bundle of data-encryption keys
#[derive(Serialize, Deserialize)]
pub struct Keyset {
    primary_key_id: u32,
    keys: Vec<KeysetEntry>,
}

impl Keyset {
    /// Generate a keyset with a single random primary key
    pub fn generate() -> Self {
        let id = rand::thread_rng().gen();
        Self {
            primary_key_id: id,
            keys: vec![KeysetEntry::generate(id)],
        }
    }

    /// Id of the key new data is encrypted under
    pub fn primary_key_id(&self) -> u32 {
        self.primary_key_id
    }

    /// Ids of every key in the set, oldest first
    pub fn key_ids(&self) -> Vec<u32> {
        self.keys.iter().map(|k| k.id).collect()
    }

    /// Add a new primary key and return its id
    pub fn rotate(&mut self) -> u32 {
        let mut rng = rand::thread_rng();
        let id = loop {
            let candidate: u32 = rng.gen();
            if self.keys.iter().all(|k| k.id != candidate) {
                break candidate;
            }
        };
        self.keys.push(KeysetEntry::generate(id));
        self.primary_key_id = id;
        id
    }

    /// Encrypt under the primary key, binding `aad`
    pub fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let entry = self.entry(self.primary_key_id)?;
        let ct = cipher::encrypt_with_aad(&entry.key(), plaintext, aad)?;

        let mut out = Vec::with_capacity(KEY_ID_LEN + ct.iv.len() + ct.data.len());
        out.extend_from_slice(&entry.id.to_be_bytes());
        out.extend_from_slice(&ct.to_bytes());
        Ok(out)
    }

    /// Decrypt a blob produced by any key in the set
    pub fn decrypt(&self, blob: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if blob.len() < KEY_ID_LEN {
            return Err(VaultError::CorruptSettings(
                "blob shorter than key id".to_string(),
            ));
        }
        let (id, rest) = blob.split_at(KEY_ID_LEN);
        let id = u32::from_be_bytes([id[0], id[1], id[2], id[3]]);
        let entry = self.entry(id)?;
        let ct = Ciphertext::from_bytes(rest)?;
        Ok(cipher::decrypt_with_aad(&entry.key(), &ct, aad)?)
    }

    /// Serialize for wrapping. The buffer is wiped on drop.
    pub(crate) fn to_plaintext(&self) -> Result<Zeroizing<Vec<u8>>> {
        Ok(Zeroizing::new(serde_json::to_vec(self)?))
    }

    /// Parse an unwrapped keyset
    pub(crate) fn from_plaintext(bytes: &[u8]) -> Result<Self> {
        let keyset: Self = serde_json::from_slice(bytes)
            .map_err(|e| VaultError::CorruptMetadata(format!("keyset: {}", e)))?;
        keyset.entry(keyset.primary_key_id)?;
        Ok(keyset)
    }

    fn entry(&self, id: u32) -> Result<&KeysetEntry> {
        self.keys
            .iter()
            .find(|k| k.id == id)
            .ok_or(VaultError::UnknownKeyId(id))
    }
}

impl fmt::Debug for Keyset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keyset")
            .field("primary_key_id", &self.primary_key_id)
            .field("key_ids", &self.key_ids())
            .finish()
    }
}
