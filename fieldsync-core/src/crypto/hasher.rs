//! Argon2id credential hashing for passwords and usernames.
//!
//! Secrets are NFKD-normalized before hashing so that visually identical
//! input typed on different keyboards hashes the same. Hashes are stored in
//! the self-describing PHC form:
//!
//! ```text
//! $argon2id$v=19$m=19456,t=2,p=1$<salt>$<digest>
//! ```

use crate::crypto::{CryptoError, Result};
use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use unicode_normalization::UnicodeNormalization;
use zeroize::Zeroizing;

/// What a secret is being hashed for. Each context has its own cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashContext {
    Password,
    Username,
}

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashParams {
    /// Memory cost in KiB
    pub memory_kib: u32,
    /// Number of passes
    pub iterations: u32,
    /// Lanes
    pub parallelism: u32,
}

impl HashParams {
    /// Defaults for the password context (19 MiB, 2 passes)
    pub const fn password() -> Self {
        Self {
            memory_kib: 19_456,
            iterations: 2,
            parallelism: 1,
        }
    }

    /// Defaults for the username context (7 MiB, 5 passes)
    pub const fn username() -> Self {
        Self {
            memory_kib: 7_168,
            iterations: 5,
            parallelism: 1,
        }
    }

    fn to_argon2(self) -> Result<Params> {
        Params::new(self.memory_kib, self.iterations, self.parallelism, None)
            .map_err(|e| CryptoError::HashFailed(format!("Invalid parameters: {}", e)))
    }
}

/// A salted hash in PHC string form.
///
/// Deliberately has no `PartialEq`: compare through [`CredentialHasher::verify`].
#[derive(Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialHash {
    encoded: String,
}

impl CredentialHash {
    /// Wrap an encoded hash read back from storage
    pub fn from_encoded(encoded: impl Into<String>) -> Self {
        Self {
            encoded: encoded.into(),
        }
    }

    /// Full PHC encoding
    pub fn as_str(&self) -> &str {
        &self.encoded
    }

    /// Pack the digest and salt as `digest$salt`.
    ///
    /// Returns `None` unless the encoding is the expected five `$` segments.
    /// The algorithm parameters are dropped, so [`CredentialHash::from_condensed`]
    /// must be given the same parameters the hash was made with.
    pub fn condensed(&self) -> Option<String> {
        let segments: Vec<&str> = self.encoded.split('$').collect();
        match segments.as_slice() {
            ["", _alg, _version, _params, salt, digest]
                if !salt.is_empty() && !digest.is_empty() =>
            {
                Some(format!("{}${}", digest, salt))
            }
            _ => None,
        }
    }

    /// Rebuild a full encoding from a [`CredentialHash::condensed`] string.
    pub fn from_condensed(condensed: &str, params: HashParams) -> Option<Self> {
        let (digest, salt) = condensed.split_once('$')?;
        if digest.is_empty() || salt.is_empty() || salt.contains('$') {
            return None;
        }
        Some(Self {
            encoded: format!(
                "$argon2id$v=19$m={},t={},p={}${}${}",
                params.memory_kib, params.iterations, params.parallelism, salt, digest
            ),
        })
    }
}

impl fmt::Debug for CredentialHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CredentialHash(<redacted>)")
    }
}

/// Hashes and verifies secrets with per-context Argon2id parameters
#[derive(Debug, Clone)]
pub struct CredentialHasher {
    password: HashParams,
    username: HashParams,
}

impl Default for CredentialHasher {
    fn default() -> Self {
        Self::new(HashParams::password(), HashParams::username())
    }
}

impl CredentialHasher {
    pub fn new(password: HashParams, username: HashParams) -> Self {
        Self { password, username }
    }

    /// Parameters used for new hashes in `context`
    pub fn params(&self, context: HashContext) -> HashParams {
        match context {
            HashContext::Password => self.password,
            HashContext::Username => self.username,
        }
    }

    /// Hash `secret` with a fresh random salt
    pub fn hash(&self, secret: &str, context: HashContext) -> Result<CredentialHash> {
        let argon2 = Argon2::new(
            Algorithm::Argon2id,
            Version::V0x13,
            self.params(context).to_argon2()?,
        );
        let salt = SaltString::generate(&mut OsRng);
        let normalized = normalize(secret);

        let hash = argon2
            .hash_password(normalized.as_bytes(), &salt)
            .map_err(|e| CryptoError::HashFailed(format!("Hashing failed: {}", e)))?;

        Ok(CredentialHash {
            encoded: hash.to_string(),
        })
    }

    /// Check `secret` against a stored hash.
    ///
    /// Re-derives with the parameters embedded in the encoding. Any parse
    /// failure counts as a mismatch.
    pub fn verify(&self, secret: &str, hash: &CredentialHash) -> bool {
        let parsed = match PasswordHash::new(&hash.encoded) {
            Ok(parsed) => parsed,
            Err(_) => return false,
        };
        let normalized = normalize(secret);
        Argon2::default()
            .verify_password(normalized.as_bytes(), &parsed)
            .is_ok()
    }
}

fn normalize(secret: &str) -> Zeroizing<String> {
    Zeroizing::new(secret.nfkd().collect())
}
