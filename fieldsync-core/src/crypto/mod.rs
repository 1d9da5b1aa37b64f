//! Cryptographic primitives for the field client.
//!
//! This module provides:
//! - AES-256-GCM envelope encryption over a symmetric key
//! - Argon2id salted hashing for passwords and usernames
//! - Base64 serde helpers for binary fields in persisted JSON

pub mod cipher;
pub mod hasher;
pub(crate) mod serde_b64;

pub use cipher::{decrypt, encrypt, Ciphertext, SymmetricKey};
pub use hasher::{CredentialHash, CredentialHasher, HashContext, HashParams};

use thiserror::Error;

/// Errors that can occur in cryptographic operations
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Authentication failed - data may have been tampered with")]
    AuthenticationFailed,

    #[error("Plaintext too large: {len} bytes (maximum {max})")]
    PlaintextTooLarge { len: usize, max: usize },

    #[error("Malformed ciphertext: {0}")]
    MalformedCiphertext(String),

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Credential hashing failed: {0}")]
    HashFailed(String),
}

/// Result type for crypto operations
pub type Result<T> = std::result::Result<T, CryptoError>;
