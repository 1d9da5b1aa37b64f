//! Encrypted settings vault - coordinates the master key and the keyset
//!
//! Two tiers of protection:
//!
//! ```text
//! master key (key provider) --wraps--> keyset --encrypts--> settings blob
//! ```
//!
//! The wrapped keyset lives in the metadata file next to a few plaintext
//! flags; the settings record lives in its own file, encrypted under the
//! keyset with the file name bound as associated data. Losing the master key
//! makes both files permanently unreadable.

pub mod keyset;
pub mod settings;

pub use keyset::Keyset;
pub use settings::{SessionToken, SettingsRecord};

use crate::crypto::{Ciphertext, CredentialHash, CryptoError};
use crate::keystore::{GuardianError, MasterKeyGuardian};
use crate::platform::write_private_file;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Metadata file format written by this version
pub const VAULT_FORMAT_VERSION: u32 = 1;

/// Default metadata file name
pub const META_FILE: &str = "vault_meta.json";

/// Default encrypted settings file name
pub const SETTINGS_FILE: &str = "settings.enc";

/// Errors from the settings vault
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Vault has not been initialized")]
    NotInitialized,

    #[error("Vault keyset cannot be unwrapped; stored settings are unrecoverable")]
    KeysetUnrecoverable,

    #[error("Unsupported vault format version {0}")]
    UnsupportedFormat(u32),

    #[error("Unknown keyset key id {0}")]
    UnknownKeyId(u32),

    #[error("Corrupt vault metadata: {0}")]
    CorruptMetadata(String),

    #[error("Corrupt settings blob: {0}")]
    CorruptSettings(String),

    #[error("Key store error: {0}")]
    Keystore(#[from] GuardianError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for vault operations
pub type Result<T> = std::result::Result<T, VaultError>;

/// Where the two vault files live
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultLayout {
    pub meta_path: PathBuf,
    pub settings_path: PathBuf,
}

impl VaultLayout {
    /// Default file names inside `dir`
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::with_names(dir, META_FILE, SETTINGS_FILE)
    }

    pub fn with_names(dir: impl AsRef<Path>, meta_file: &str, settings_file: &str) -> Self {
        let dir = dir.as_ref();
        Self {
            meta_path: dir.join(meta_file),
            settings_path: dir.join(settings_file),
        }
    }

    fn settings_aad(&self) -> Vec<u8> {
        self.settings_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned().into_bytes())
            .unwrap_or_default()
    }
}

/// Contents of the metadata file
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VaultMeta {
    format_version: u32,
    install_id: Uuid,
    wrapped_keyset: Ciphertext,
    has_token: bool,
    has_last_auth: bool,
    created_at: DateTime<Utc>,
}

impl VaultMeta {
    fn load(path: &Path) -> Result<Option<Self>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let meta: Self = serde_json::from_slice(&bytes)
            .map_err(|e| VaultError::CorruptMetadata(e.to_string()))?;
        if meta.format_version != VAULT_FORMAT_VERSION {
            return Err(VaultError::UnsupportedFormat(meta.format_version));
        }
        Ok(Some(meta))
    }

    fn store(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        write_private_file(path, &json)?;
        Ok(())
    }
}

/// Non-secret view of the vault metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultStatus {
    pub install_id: Uuid,
    pub has_token: bool,
    pub has_last_auth: bool,
    pub created_at: DateTime<Utc>,
    pub primary_key_id: u32,
}

struct OpenVault {
    keyset: Keyset,
    meta: VaultMeta,
}

/// Encrypted settings vault
pub struct SettingsVault {
    guardian: Arc<MasterKeyGuardian>,
    layout: VaultLayout,
    // Serializes read-modify-write transactions and keyset rotation
    state: Mutex<OpenVault>,
}

impl SettingsVault {
    /// Whether a wrapped keyset has been persisted at `layout`
    pub fn is_initialized(layout: &VaultLayout) -> bool {
        layout.meta_path.is_file()
    }

    /// Create and wrap a keyset unless one already exists.
    ///
    /// Returns `true` when a new keyset was written. Safe to call on every
    /// start; an existing wrapped keyset is never touched.
    pub async fn bootstrap(guardian: &MasterKeyGuardian, layout: &VaultLayout) -> Result<bool> {
        if let Some(meta) = VaultMeta::load(&layout.meta_path)? {
            debug!(install_id = %meta.install_id, "Vault already initialized");
            return Ok(false);
        }

        let keyset = Keyset::generate();
        let wrapped_keyset = guardian.encrypt(&keyset.to_plaintext()?).await?;
        let meta = VaultMeta {
            format_version: VAULT_FORMAT_VERSION,
            install_id: Uuid::new_v4(),
            wrapped_keyset,
            has_token: false,
            has_last_auth: false,
            created_at: Utc::now(),
        };
        meta.store(&layout.meta_path)?;

        info!(
            install_id = %meta.install_id,
            primary_key_id = keyset.primary_key_id(),
            "Vault initialized"
        );
        Ok(true)
    }

    /// Unwrap the keyset and open the vault
    pub async fn open(guardian: Arc<MasterKeyGuardian>, layout: VaultLayout) -> Result<Self> {
        let meta = VaultMeta::load(&layout.meta_path)?.ok_or(VaultError::NotInitialized)?;
        let keyset = unwrap_keyset(&guardian, &meta.wrapped_keyset).await?;
        debug!(
            install_id = %meta.install_id,
            primary_key_id = keyset.primary_key_id(),
            "Vault opened"
        );

        Ok(Self {
            guardian,
            layout,
            state: Mutex::new(OpenVault { keyset, meta }),
        })
    }

    /// Bootstrap if needed, then open
    pub async fn bootstrap_and_open(
        guardian: Arc<MasterKeyGuardian>,
        layout: VaultLayout,
    ) -> Result<Self> {
        Self::bootstrap(&guardian, &layout).await?;
        Self::open(guardian, layout).await
    }

    pub fn layout(&self) -> &VaultLayout {
        &self.layout
    }

    pub async fn status(&self) -> VaultStatus {
        let state = self.state.lock().await;
        VaultStatus {
            install_id: state.meta.install_id,
            has_token: state.meta.has_token,
            has_last_auth: state.meta.has_last_auth,
            created_at: state.meta.created_at,
            primary_key_id: state.keyset.primary_key_id(),
        }
    }

    /// Current settings. An install that never wrote any gets the default.
    pub async fn read(&self) -> Result<SettingsRecord> {
        let state = self.state.lock().await;
        self.read_record(&state.keyset)
    }

    /// Read-modify-write transaction.
    ///
    /// `f` is applied to the current record and the whole blob is replaced.
    /// Nothing is written if `f` is never reached because the read failed.
    ///
    /// Changed metadata flags are written before the blob. If the blob write
    /// then fails the previous flags are put back, so the flags never claim
    /// a session the blob does not hold.
    pub async fn update<F>(&self, f: F) -> Result<SettingsRecord>
    where
        F: FnOnce(&mut SettingsRecord),
    {
        let mut state = self.state.lock().await;
        let mut record = self.read_record(&state.keyset)?;
        f(&mut record);

        let has_token = record.token.is_some();
        let has_last_auth = record.last_auth_at.is_some();
        let flags_changed =
            state.meta.has_token != has_token || state.meta.has_last_auth != has_last_auth;

        if !flags_changed {
            self.write_record(&state.keyset, &record)?;
            return Ok(record);
        }

        let mut meta = state.meta.clone();
        meta.has_token = has_token;
        meta.has_last_auth = has_last_auth;
        meta.store(&self.layout.meta_path)?;

        if let Err(e) = self.write_record(&state.keyset, &record) {
            if let Err(restore) = state.meta.store(&self.layout.meta_path) {
                warn!(error = %restore, "Failed to restore vault metadata after settings write error");
            }
            return Err(e);
        }
        state.meta = meta;
        Ok(record)
    }

    /// Store the result of an online login
    pub async fn record_login(
        &self,
        token: SessionToken,
        password_hash: CredentialHash,
        username_hash: CredentialHash,
        now: DateTime<Utc>,
    ) -> Result<SettingsRecord> {
        self.update(|r| r.apply_login(token, password_hash, username_hash, now))
            .await
    }

    pub async fn record_reauth(&self, now: DateTime<Utc>) -> Result<SettingsRecord> {
        self.update(|r| r.apply_reauth(now)).await
    }

    pub async fn record_sync(&self, now: DateTime<Utc>) -> Result<SettingsRecord> {
        self.update(|r| r.apply_sync(now)).await
    }

    pub async fn logout(&self) -> Result<SettingsRecord> {
        let record = self.update(SettingsRecord::apply_logout).await?;
        info!("Session cleared");
        Ok(record)
    }

    /// Add a new primary key to the keyset.
    ///
    /// The re-wrapped keyset (old keys included) is persisted before the
    /// settings blob is re-encrypted, so an interruption between the two
    /// writes leaves a readable vault.
    pub async fn rotate_keyset(&self) -> Result<u32> {
        let mut state = self.state.lock().await;
        let record = self.read_record(&state.keyset)?;

        // Work on a fresh copy so a failed wrap leaves the open state intact
        let mut keyset = Keyset::from_plaintext(&state.keyset.to_plaintext()?)?;
        let new_id = keyset.rotate();

        let wrapped = self.guardian.encrypt(&keyset.to_plaintext()?).await?;
        let mut meta = state.meta.clone();
        meta.wrapped_keyset = wrapped;
        meta.store(&self.layout.meta_path)?;
        state.meta = meta;
        state.keyset = keyset;

        if self.layout.settings_path.exists() {
            self.write_record(&state.keyset, &record)?;
        }

        info!(primary_key_id = new_id, "Vault keyset rotated");
        Ok(new_id)
    }

    fn read_record(&self, keyset: &Keyset) -> Result<SettingsRecord> {
        let blob = match fs::read(&self.layout.settings_path) {
            Ok(blob) => blob,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(SettingsRecord::default()),
            Err(e) => return Err(e.into()),
        };
        let plaintext = zeroize::Zeroizing::new(keyset.decrypt(&blob, &self.layout.settings_aad())?);
        serde_json::from_slice(&plaintext).map_err(|e| VaultError::CorruptSettings(e.to_string()))
    }

    fn write_record(&self, keyset: &Keyset, record: &SettingsRecord) -> Result<()> {
        let plaintext = zeroize::Zeroizing::new(serde_json::to_vec(record)?);
        let blob = keyset.encrypt(&plaintext, &self.layout.settings_aad())?;
        write_private_file(&self.layout.settings_path, &blob)?;
        Ok(())
    }
}

async fn unwrap_keyset(guardian: &MasterKeyGuardian, wrapped: &Ciphertext) -> Result<Keyset> {
    match guardian.decrypt(wrapped).await {
        Ok(plaintext) => {
            let plaintext = zeroize::Zeroizing::new(plaintext);
            Keyset::from_plaintext(&plaintext)
        }
        Err(GuardianError::Crypto(CryptoError::AuthenticationFailed)) => {
            warn!("Wrapped keyset failed authentication; master key was replaced or data corrupted");
            Err(VaultError::KeysetUnrecoverable)
        }
        Err(e) => Err(e.into()),
    }
}
