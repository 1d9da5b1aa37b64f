//! AES-256-GCM envelope encryption.
//!
//! Uses AES-256-GCM with:
//! - 256-bit key
//! - 96-bit (12 byte) IV, freshly random for every call
//! - 128-bit authentication tag, carried at the end of `data`
//!
//! Decryption fails closed: a tag mismatch never yields partial plaintext.

use crate::crypto::{serde_b64, CryptoError, Result};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::ZeroizeOnDrop;

/// Symmetric key length in bytes
pub const KEY_LEN: usize = 32;

/// GCM IV length in bytes
pub const IV_LEN: usize = 12;

/// GCM authentication tag length in bytes
pub const TAG_LEN: usize = 16;

/// Largest plaintext accepted by [`encrypt`].
///
/// Persisted lengths are accounted as signed 32-bit values, so the IV and tag
/// must still fit after the plaintext.
pub const MAX_PLAINTEXT_LEN: usize = i32::MAX as usize - IV_LEN - TAG_LEN;

/// A 256-bit AES key.
///
/// Key material is zeroized on drop and never printed.
#[derive(ZeroizeOnDrop)]
pub struct SymmetricKey {
    key: [u8; KEY_LEN],
}

impl SymmetricKey {
    /// Generate a new random key
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        Self { key: key.into() }
    }

    /// Create a key from raw bytes
    pub fn from_bytes(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    /// Create a key from a slice, checking its length
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: KEY_LEN,
            got: bytes.len(),
        })?;
        Ok(Self { key })
    }

    /// Raw key bytes. Only key stores and keyset serialization need this.
    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.key
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(<redacted>)")
    }
}

/// Output of [`encrypt`]: ciphertext with the tag appended, plus the IV.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ciphertext {
    /// `ciphertext || tag(16)`
    #[serde(with = "serde_b64")]
    pub data: Vec<u8>,

    /// Random IV used for this message (12 bytes)
    #[serde(with = "serde_b64::array")]
    pub iv: [u8; IV_LEN],
}

impl Ciphertext {
    /// Concatenate as `iv || data`, the layout used for file blobs.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(IV_LEN + self.data.len());
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.data);
        out
    }

    /// Parse the `iv || data` layout produced by [`Ciphertext::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < IV_LEN + TAG_LEN {
            return Err(CryptoError::MalformedCiphertext(format!(
                "{} bytes is shorter than iv + tag",
                bytes.len()
            )));
        }
        let (iv, data) = bytes.split_at(IV_LEN);
        let iv: [u8; IV_LEN] = iv
            .try_into()
            .map_err(|_| CryptoError::MalformedCiphertext("bad iv".to_string()))?;
        Ok(Self {
            data: data.to_vec(),
            iv,
        })
    }
}

fn check_plaintext_len(len: usize) -> Result<()> {
    if len > MAX_PLAINTEXT_LEN {
        return Err(CryptoError::PlaintextTooLarge {
            len,
            max: MAX_PLAINTEXT_LEN,
        });
    }
    Ok(())
}

/// Encrypt `plaintext` under `key`.
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<Ciphertext> {
    encrypt_with_aad(key, plaintext, &[])
}

/// Decrypt a [`Ciphertext`] produced by [`encrypt`] under the same key.
pub fn decrypt(key: &SymmetricKey, ciphertext: &Ciphertext) -> Result<Vec<u8>> {
    decrypt_with_aad(key, ciphertext, &[])
}

/// Encrypt with associated data bound into the tag.
pub fn encrypt_with_aad(key: &SymmetricKey, plaintext: &[u8], aad: &[u8]) -> Result<Ciphertext> {
    check_plaintext_len(plaintext.len())?;

    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let data = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|e| CryptoError::EncryptionFailed(format!("{}", e)))?;

    Ok(Ciphertext {
        data,
        iv: nonce.into(),
    })
}

/// Decrypt with associated data; the same `aad` used at encryption is required.
pub fn decrypt_with_aad(key: &SymmetricKey, ciphertext: &Ciphertext, aad: &[u8]) -> Result<Vec<u8>> {
    // Anything shorter than a tag cannot have been produced by encrypt()
    if ciphertext.data.len() < TAG_LEN {
        return Err(CryptoError::MalformedCiphertext(
            "Ciphertext too short - missing auth tag".to_string(),
        ));
    }

    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let nonce = Nonce::from(ciphertext.iv);

    cipher
        .decrypt(
            &nonce,
            Payload {
                msg: &ciphertext.data,
                aad,
            },
        )
        .map_err(|_| CryptoError::AuthenticationFailed)
}
