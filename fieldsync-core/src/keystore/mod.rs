//! Master key management.
//!
//! A single long-lived AES-256 key lives in a platform key provider under a
//! fixed alias. The [`MasterKeyGuardian`] creates it on first use (OS key
//! store first, software file store as a silent fallback), caches the
//! provider handle and applies the two retry policies around the flaky
//! provider:
//!
//! - lookup retry: missing/unreadable entry, fixed delay, handle reloaded
//! - operation retry: provider failure during encrypt/decrypt, jittered
//!   delay, no reload
//!
//! Each policy retries at most once before the error propagates.

pub mod guardian;
pub mod provider;
pub mod retry;

pub use guardian::MasterKeyGuardian;
pub use provider::{FileKeyProvider, KeyProvider, MemoryKeyProvider, OsKeyringProvider, ProviderKind};
pub use retry::{RetryDelay, RetryPolicy};

use crate::crypto::CryptoError;
use thiserror::Error;

/// Default alias of the master key
pub const DEFAULT_KEY_ALIAS: &str = "fieldsync.master";

/// Errors reported by a [`KeyProvider`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyProviderError {
    #[error("Secure key hardware unavailable: {0}")]
    HardwareUnavailable(String),

    #[error("Key entry missing: {0}")]
    EntryMissing(String),

    #[error("Key entry unreadable: {0}")]
    EntryUnreadable(String),

    #[error("Key provider failure: {0}")]
    Provider(String),

    #[error("Invalid key alias: {0}")]
    InvalidAlias(String),
}

impl KeyProviderError {
    /// Errors handled by the lookup retry (entry missing or unreadable)
    pub fn is_lookup_failure(&self) -> bool {
        matches!(self, Self::EntryMissing(_) | Self::EntryUnreadable(_))
    }

    /// Errors handled by the operation retry (provider/security failures)
    pub fn is_operation_failure(&self) -> bool {
        matches!(self, Self::Provider(_))
    }
}

/// Errors from the master key guardian
#[derive(Error, Debug)]
pub enum GuardianError {
    #[error(transparent)]
    Provider(#[from] KeyProviderError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("Key cache lock poisoned")]
    LockPoisoned,
}

/// Result type for key store operations
pub type Result<T> = std::result::Result<T, GuardianError>;
