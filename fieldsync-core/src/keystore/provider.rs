//! Key provider backends.
//!
//! ```text
//! KeyProvider
//! ├── OsKeyringProvider   platform credential store (Keychain, Credential
//! │                       Manager, Secret Service), treated as hardware-backed
//! ├── FileKeyProvider     software fallback, owner-only key file
//! └── MemoryKeyProvider   process-local, for development and tests
//! ```

use crate::crypto::cipher::{SymmetricKey, KEY_LEN};
use crate::keystore::KeyProviderError;
use crate::platform::write_private_file;
use base64::{engine::general_purpose::STANDARD, Engine};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::RwLock;
use zeroize::Zeroizing;

type Result<T> = std::result::Result<T, KeyProviderError>;

/// Where a provider keeps its keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Hardware,
    Software,
}

/// Capability set of a secure key store.
///
/// Implementations may block; they are only called from the guardian.
pub trait KeyProvider: Send + Sync {
    /// Backing of the keys this provider generates
    fn kind(&self) -> ProviderKind;

    /// Whether a key exists under `alias`
    fn has_alias(&self, alias: &str) -> Result<bool>;

    /// Create and persist a new 256-bit key under `alias`
    fn generate(&self, alias: &str) -> Result<SymmetricKey>;

    /// Load the key stored under `alias`
    fn load(&self, alias: &str) -> Result<SymmetricKey>;
}

fn check_alias(alias: &str) -> Result<()> {
    let valid = !alias.is_empty()
        && alias
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        && !alias.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(KeyProviderError::InvalidAlias(alias.to_string()))
    }
}

/// Platform credential store via the `keyring` crate
pub struct OsKeyringProvider {
    service: String,
}

impl OsKeyringProvider {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, alias: &str) -> Result<keyring::Entry> {
        check_alias(alias)?;
        keyring::Entry::new(&self.service, alias).map_err(|e| map_keyring_error(alias, e))
    }
}

fn map_keyring_error(alias: &str, error: keyring::Error) -> KeyProviderError {
    match error {
        keyring::Error::NoEntry => KeyProviderError::EntryMissing(alias.to_string()),
        keyring::Error::NoStorageAccess(e) => KeyProviderError::HardwareUnavailable(e.to_string()),
        keyring::Error::BadEncoding(_) | keyring::Error::Ambiguous(_) => {
            KeyProviderError::EntryUnreadable(alias.to_string())
        }
        other => KeyProviderError::Provider(other.to_string()),
    }
}

impl KeyProvider for OsKeyringProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Hardware
    }

    fn has_alias(&self, alias: &str) -> Result<bool> {
        match self.entry(alias)?.get_password() {
            Ok(mut secret) => {
                zeroize::Zeroize::zeroize(&mut secret);
                Ok(true)
            }
            Err(keyring::Error::NoEntry) => Ok(false),
            Err(e) => Err(map_keyring_error(alias, e)),
        }
    }

    fn generate(&self, alias: &str) -> Result<SymmetricKey> {
        let entry = self.entry(alias)?;
        let key = SymmetricKey::generate();
        let encoded = Zeroizing::new(STANDARD.encode(key.as_bytes()));
        entry.set_password(&encoded).map_err(|e| match e {
            // A store that refuses writes is as good as absent
            keyring::Error::PlatformFailure(inner) | keyring::Error::NoStorageAccess(inner) => {
                KeyProviderError::HardwareUnavailable(inner.to_string())
            }
            other => map_keyring_error(alias, other),
        })?;
        Ok(key)
    }

    fn load(&self, alias: &str) -> Result<SymmetricKey> {
        let encoded = Zeroizing::new(
            self.entry(alias)?
                .get_password()
                .map_err(|e| map_keyring_error(alias, e))?,
        );
        let bytes = Zeroizing::new(
            STANDARD
                .decode(encoded.as_bytes())
                .map_err(|_| KeyProviderError::EntryUnreadable(alias.to_string()))?,
        );
        SymmetricKey::from_slice(&bytes)
            .map_err(|_| KeyProviderError::EntryUnreadable(alias.to_string()))
    }
}

/// Software key store: one raw key file per alias
pub struct FileKeyProvider {
    dir: PathBuf,
}

impl FileKeyProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn key_path(&self, alias: &str) -> Result<PathBuf> {
        check_alias(alias)?;
        Ok(self.dir.join(format!("{}.key", alias)))
    }
}

impl KeyProvider for FileKeyProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Software
    }

    fn has_alias(&self, alias: &str) -> Result<bool> {
        Ok(self.key_path(alias)?.is_file())
    }

    fn generate(&self, alias: &str) -> Result<SymmetricKey> {
        let path = self.key_path(alias)?;
        fs::create_dir_all(&self.dir)
            .map_err(|e| KeyProviderError::Provider(format!("create key dir: {}", e)))?;
        let key = SymmetricKey::generate();
        write_private_file(&path, key.as_bytes())
            .map_err(|e| KeyProviderError::Provider(format!("write key file: {}", e)))?;
        Ok(key)
    }

    fn load(&self, alias: &str) -> Result<SymmetricKey> {
        let path = self.key_path(alias)?;
        let bytes = Zeroizing::new(fs::read(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => KeyProviderError::EntryMissing(alias.to_string()),
            _ => KeyProviderError::EntryUnreadable(format!("{}: {}", alias, e)),
        })?);
        if bytes.len() != KEY_LEN {
            return Err(KeyProviderError::EntryUnreadable(format!(
                "{}: key file is {} bytes",
                alias,
                bytes.len()
            )));
        }
        SymmetricKey::from_slice(&bytes)
            .map_err(|_| KeyProviderError::EntryUnreadable(alias.to_string()))
    }
}

/// In-memory key store. Keys vanish with the process.
pub struct MemoryKeyProvider {
    kind: ProviderKind,
    available: bool,
    keys: RwLock<HashMap<String, Zeroizing<[u8; KEY_LEN]>>>,
}

impl MemoryKeyProvider {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            available: true,
            keys: RwLock::new(HashMap::new()),
        }
    }

    /// A provider whose hardware is missing: it holds nothing and refuses to generate
    pub fn unavailable(kind: ProviderKind) -> Self {
        Self {
            available: false,
            ..Self::new(kind)
        }
    }

    /// Drop a key, as a provider wipe would
    pub fn remove(&self, alias: &str) -> bool {
        self.keys
            .write()
            .map(|mut keys| keys.remove(alias).is_some())
            .unwrap_or(false)
    }
}

impl KeyProvider for MemoryKeyProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn has_alias(&self, alias: &str) -> Result<bool> {
        check_alias(alias)?;
        let keys = self
            .keys
            .read()
            .map_err(|_| KeyProviderError::Provider("memory store poisoned".to_string()))?;
        Ok(keys.contains_key(alias))
    }

    fn generate(&self, alias: &str) -> Result<SymmetricKey> {
        check_alias(alias)?;
        if !self.available {
            return Err(KeyProviderError::HardwareUnavailable(
                "memory provider disabled".to_string(),
            ));
        }
        let key = SymmetricKey::generate();
        self.keys
            .write()
            .map_err(|_| KeyProviderError::Provider("memory store poisoned".to_string()))?
            .insert(alias.to_string(), Zeroizing::new(*key.as_bytes()));
        Ok(key)
    }

    fn load(&self, alias: &str) -> Result<SymmetricKey> {
        check_alias(alias)?;
        let keys = self
            .keys
            .read()
            .map_err(|_| KeyProviderError::Provider("memory store poisoned".to_string()))?;
        keys.get(alias)
            .map(|bytes| SymmetricKey::from_bytes(**bytes))
            .ok_or_else(|| KeyProviderError::EntryMissing(alias.to_string()))
    }
}
