//! FieldSync Core Library
//!
//! Offline-first core of the field data-collection client: an encrypted
//! settings vault guarded by a platform master key, a local record store
//! with an upload state machine, and the staged sync engine that pushes
//! captured records to the server.

pub mod auth;
pub mod config;
pub mod crypto;
pub mod keystore;
pub mod platform;
pub mod records;
pub mod sync;
pub mod vault;

pub use auth::{AuthError, LoginCoordinator, LoginOutcome, LoginRequest, LoginService, LoginSubmit};
pub use config::{ConfigError, FieldSyncConfig};
pub use crypto::{Ciphertext, CredentialHash, CredentialHasher, CryptoError, HashContext, HashParams, SymmetricKey};
pub use keystore::{
    FileKeyProvider, GuardianError, KeyProvider, KeyProviderError, MasterKeyGuardian,
    MemoryKeyProvider, OsKeyringProvider, ProviderKind,
};
pub use platform::{ensure_dir, get_config_dir, get_data_dir, get_default_config_path};
pub use records::{
    RecordError, RecordKind, RecordState, RecordStore, ServerInfo, SqliteRecordStore,
    SyncableRecord,
};
pub use sync::{
    CancelFlag, ProgressReporter, SyncError, SyncOrchestrator, SyncProgress, SyncReport,
    SyncScheduler, SyncStage, SyncTransport, TransportError,
};
pub use vault::{SessionToken, SettingsRecord, SettingsVault, VaultError, VaultLayout, VaultStatus};

use thiserror::Error;

/// Result type for field client operations
pub type Result<T> = std::result::Result<T, FieldSyncError>;

/// General error type for field client operations
#[derive(Error, Debug)]
pub enum FieldSyncError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Keystore error: {0}")]
    Keystore(#[from] GuardianError),

    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("Record error: {0}")]
    Records(#[from] RecordError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Login error: {0}")]
    Auth(#[from] AuthError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
