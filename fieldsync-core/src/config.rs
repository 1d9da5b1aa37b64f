//! Client configuration loaded from `fieldsync.toml`.
//!
//! Every section and field has a default, so an absent file or a partial
//! file is fine. A path given explicitly must exist.

use crate::crypto::{CredentialHasher, HashParams};
use crate::keystore::{RetryPolicy, DEFAULT_KEY_ALIAS};
use crate::platform::{get_data_dir, get_default_config_path};
use crate::sync::{SchedulerSettings, SYNC_WORK_NAME};
use crate::vault::{VaultLayout, META_FILE, SETTINGS_FILE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors from loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml_dep::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            base_url: "https://localhost:8443".to_string(),
            timeout_secs: 30,
        }
    }
}

impl ServerSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Overrides the platform data directory
    pub data_dir: Option<PathBuf>,
    pub meta_file: String,
    pub settings_file: String,
    pub records_file: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: None,
            meta_file: META_FILE.to_string(),
            settings_file: SETTINGS_FILE.to_string(),
            records_file: "records.db".to_string(),
        }
    }
}

impl StorageSettings {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(get_data_dir)
    }

    pub fn vault_layout(&self) -> VaultLayout {
        VaultLayout::with_names(self.data_dir(), &self.meta_file, &self.settings_file)
    }

    pub fn records_path(&self) -> PathBuf {
        self.data_dir().join(&self.records_file)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeystoreSettings {
    /// Key alias, also the keyring service name
    pub alias: String,
    pub lookup_retry_delay_ms: u64,
    pub operation_retry_max_delay_ms: u64,
    /// Try the OS keyring before the file provider
    pub prefer_hardware: bool,
}

impl Default for KeystoreSettings {
    fn default() -> Self {
        Self {
            alias: DEFAULT_KEY_ALIAS.to_string(),
            lookup_retry_delay_ms: 100,
            operation_retry_max_delay_ms: 500,
            prefer_hardware: true,
        }
    }
}

impl KeystoreSettings {
    pub fn lookup_retry(&self) -> RetryPolicy {
        RetryPolicy::lookup(Duration::from_millis(self.lookup_retry_delay_ms))
    }

    pub fn operation_retry(&self) -> RetryPolicy {
        RetryPolicy::operation(Duration::from_millis(self.operation_retry_max_delay_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HashingSettings {
    pub password: HashParams,
    pub username: HashParams,
}

impl Default for HashingSettings {
    fn default() -> Self {
        Self {
            password: HashParams::password(),
            username: HashParams::username(),
        }
    }
}

impl HashingSettings {
    pub fn hasher(&self) -> CredentialHasher {
        CredentialHasher::new(self.password, self.username)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub work_name: String,
    pub periodic_interval_secs: u64,
    pub backoff_base_secs: u64,
    pub max_attempts: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            work_name: SYNC_WORK_NAME.to_string(),
            periodic_interval_secs: 15 * 60,
            backoff_base_secs: 30,
            max_attempts: 5,
        }
    }
}

impl SyncSettings {
    pub fn periodic_interval(&self) -> Duration {
        Duration::from_secs(self.periodic_interval_secs)
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            backoff_base: Duration::from_secs(self.backoff_base_secs),
            max_attempts: self.max_attempts,
            guarded_work: self.work_name.clone(),
            ..SchedulerSettings::default()
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.work_name.trim().is_empty() {
            return Err(ConfigError::Invalid("sync.work_name is empty".into()));
        }
        if self.periodic_interval_secs == 0 {
            return Err(ConfigError::Invalid("sync.periodic_interval_secs must be > 0".into()));
        }
        if self.backoff_base_secs == 0 {
            return Err(ConfigError::Invalid("sync.backoff_base_secs must be > 0".into()));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("sync.max_attempts must be > 0".into()));
        }
        Ok(())
    }
}

/// Top-level client configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldSyncConfig {
    pub server: ServerSettings,
    pub storage: StorageSettings,
    pub keystore: KeystoreSettings,
    pub hashing: HashingSettings,
    pub sync: SyncSettings,
}

impl FieldSyncConfig {
    /// Load from `path`, or from the default location when `None`.
    ///
    /// A missing default file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (get_default_config_path(), false),
        };

        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if explicit {
                    return Err(ConfigError::NotFound(path));
                }
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };

        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml_dep::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("server.base_url is empty".into()));
        }
        if self.server.timeout_secs == 0 {
            return Err(ConfigError::Invalid("server.timeout_secs must be > 0".into()));
        }
        if self.keystore.alias.trim().is_empty() {
            return Err(ConfigError::Invalid("keystore.alias is empty".into()));
        }
        if self.storage.meta_file == self.storage.settings_file {
            return Err(ConfigError::Invalid(
                "storage.meta_file and storage.settings_file must differ".into(),
            ));
        }
        self.sync.validate()
    }
}
