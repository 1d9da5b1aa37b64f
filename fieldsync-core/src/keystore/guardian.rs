//! Master key guardian.
//!
//! Owns the install-lifetime master key. The key itself never leaves the
//! provider for longer than one operation; what is cached is the handle to
//! the provider that holds it. Handle resolution and reload run under the
//! cache mutex, crypto operations run outside it.

use crate::crypto::cipher::{self, Ciphertext, SymmetricKey};
use crate::keystore::provider::{KeyProvider, ProviderKind};
use crate::keystore::retry::RetryPolicy;
use crate::keystore::{GuardianError, KeyProviderError, Result};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default delay before the lookup retry
pub const LOOKUP_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Default ceiling of the operation retry's random delay
pub const OPERATION_RETRY_MAX_DELAY: Duration = Duration::from_millis(500);

#[derive(Clone)]
struct ProviderHandle {
    provider: Arc<dyn KeyProvider>,
}

/// Guards the master key and encrypts/decrypts with it
pub struct MasterKeyGuardian {
    alias: String,
    hardware: Option<Arc<dyn KeyProvider>>,
    software: Arc<dyn KeyProvider>,
    // None until the first successful resolution, and again after a reload
    handle: Mutex<Option<ProviderHandle>>,
    lookup_retry: RetryPolicy,
    operation_retry: RetryPolicy,
}

impl MasterKeyGuardian {
    /// Create a guardian that prefers `hardware` and falls back to `software`
    pub fn new(
        alias: impl Into<String>,
        hardware: Option<Arc<dyn KeyProvider>>,
        software: Arc<dyn KeyProvider>,
    ) -> Self {
        Self {
            alias: alias.into(),
            hardware,
            software,
            handle: Mutex::new(None),
            lookup_retry: RetryPolicy::lookup(LOOKUP_RETRY_DELAY),
            operation_retry: RetryPolicy::operation(OPERATION_RETRY_MAX_DELAY),
        }
    }

    /// Override the retry policies
    pub fn with_retry_policies(mut self, lookup: RetryPolicy, operation: RetryPolicy) -> Self {
        self.lookup_retry = lookup;
        self.operation_retry = operation;
        self
    }

    /// Alias the master key is stored under
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Whether a master key exists in either provider. Never creates one.
    pub fn has_key(&self) -> bool {
        if let Ok(guard) = self.handle.lock() {
            if let Some(handle) = guard.as_ref() {
                return handle.provider.has_alias(&self.alias).unwrap_or(false);
            }
        }
        self.find_existing().ok().flatten().is_some()
    }

    /// Backing of the provider currently holding the key, if resolved
    pub fn provider_kind(&self) -> Option<ProviderKind> {
        self.handle
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|h| h.provider.kind()))
    }

    /// Load the master key, creating it on first use.
    ///
    /// Lookup failures are retried once after a fixed delay with the
    /// provider handle reloaded.
    pub async fn get_key(&self) -> Result<SymmetricKey> {
        let mut retries = 0;
        let mut reload = false;
        loop {
            match self.load_key(reload) {
                Ok(key) => return Ok(key),
                Err(e) if e.is_lookup_failure() && self.lookup_retry.allows(retries) => {
                    retries += 1;
                    let delay = self.lookup_retry.next_delay();
                    warn!(
                        alias = %self.alias,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Master key lookup failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    reload = self.lookup_retry.reload_handle;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Encrypt with the master key
    pub async fn encrypt(&self, plaintext: &[u8]) -> Result<Ciphertext> {
        self.with_operation_retry("encrypt", move || async move {
            let key = self.get_key().await?;
            Ok(cipher::encrypt(&key, plaintext)?)
        })
        .await
    }

    /// Decrypt with the master key. Tag mismatches are never retried.
    pub async fn decrypt(&self, ciphertext: &Ciphertext) -> Result<Vec<u8>> {
        self.with_operation_retry("decrypt", move || async move {
            let key = self.get_key().await?;
            Ok(cipher::decrypt(&key, ciphertext)?)
        })
        .await
    }

    async fn with_operation_retry<T, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retries = 0;
        loop {
            match op().await {
                Err(GuardianError::Provider(e))
                    if e.is_operation_failure() && self.operation_retry.allows(retries) =>
                {
                    retries += 1;
                    let delay = self.operation_retry.next_delay();
                    warn!(
                        operation,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Key provider operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    if self.operation_retry.reload_handle {
                        self.clear_handle()?;
                    }
                }
                other => return other,
            }
        }
    }

    fn clear_handle(&self) -> Result<()> {
        self.handle
            .lock()
            .map_err(|_| GuardianError::LockPoisoned)?
            .take();
        Ok(())
    }

    fn load_key(&self, reload: bool) -> std::result::Result<SymmetricKey, KeyProviderError> {
        let handle = self.resolve_handle(reload)?;
        handle.provider.load(&self.alias)
    }

    /// Return the cached handle, resolving (and creating the key) if needed.
    ///
    /// Runs entirely under the cache mutex so only one caller resolves.
    fn resolve_handle(&self, reload: bool) -> std::result::Result<ProviderHandle, KeyProviderError> {
        let mut guard = self
            .handle
            .lock()
            .map_err(|_| KeyProviderError::Provider("key cache lock poisoned".to_string()))?;

        if reload {
            debug!(alias = %self.alias, "Reloading key provider handle");
            guard.take();
        }
        if let Some(handle) = guard.as_ref() {
            return Ok(handle.clone());
        }

        let provider = match self.find_existing()? {
            Some(provider) => provider,
            None => self.create_key()?,
        };
        let handle = ProviderHandle { provider };
        *guard = Some(handle.clone());
        Ok(handle)
    }

    fn find_existing(&self) -> std::result::Result<Option<Arc<dyn KeyProvider>>, KeyProviderError> {
        if let Some(hardware) = &self.hardware {
            match hardware.has_alias(&self.alias) {
                Ok(true) => return Ok(Some(hardware.clone())),
                Ok(false) | Err(KeyProviderError::HardwareUnavailable(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if self.software.has_alias(&self.alias)? {
            return Ok(Some(self.software.clone()));
        }
        Ok(None)
    }

    fn create_key(&self) -> std::result::Result<Arc<dyn KeyProvider>, KeyProviderError> {
        if let Some(hardware) = &self.hardware {
            match hardware.generate(&self.alias) {
                Ok(_) => {
                    info!(alias = %self.alias, backing = ?hardware.kind(), "Master key created");
                    return Ok(hardware.clone());
                }
                Err(KeyProviderError::HardwareUnavailable(reason)) => {
                    warn!(alias = %self.alias, %reason, "Secure hardware unavailable, using software key store");
                }
                Err(e) => return Err(e),
            }
        }
        self.software.generate(&self.alias)?;
        info!(alias = %self.alias, backing = ?self.software.kind(), "Master key created");
        Ok(self.software.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CryptoError;
    use crate::keystore::provider::MemoryKeyProvider;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Wraps a provider and fails scripted `load` calls
    struct FlakyProvider {
        inner: MemoryKeyProvider,
        load_failures: Mutex<VecDeque<KeyProviderError>>,
        loads: AtomicUsize,
        alias_checks: AtomicUsize,
    }

    impl FlakyProvider {
        fn new(failures: Vec<KeyProviderError>) -> Self {
            Self {
                inner: MemoryKeyProvider::new(ProviderKind::Hardware),
                load_failures: Mutex::new(failures.into()),
                loads: AtomicUsize::new(0),
                alias_checks: AtomicUsize::new(0),
            }
        }
    }

    impl KeyProvider for FlakyProvider {
        fn kind(&self) -> ProviderKind {
            self.inner.kind()
        }

        fn has_alias(&self, alias: &str) -> std::result::Result<bool, KeyProviderError> {
            self.alias_checks.fetch_add(1, Ordering::SeqCst);
            self.inner.has_alias(alias)
        }

        fn generate(&self, alias: &str) -> std::result::Result<SymmetricKey, KeyProviderError> {
            self.inner.generate(alias)
        }

        fn load(&self, alias: &str) -> std::result::Result<SymmetricKey, KeyProviderError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.load_failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            self.inner.load(alias)
        }
    }

    fn software() -> Arc<dyn KeyProvider> {
        Arc::new(MemoryKeyProvider::new(ProviderKind::Software))
    }

    #[tokio::test(start_paused = true)]
    async fn test_creates_hardware_key_first() {
        let hardware: Arc<dyn KeyProvider> = Arc::new(MemoryKeyProvider::new(ProviderKind::Hardware));
        let guardian = MasterKeyGuardian::new("master", Some(hardware.clone()), software());

        assert!(!guardian.has_key());
        let ct = guardian.encrypt(b"keyset").await.unwrap();
        assert!(guardian.has_key());
        assert_eq!(guardian.provider_kind(), Some(ProviderKind::Hardware));
        assert!(hardware.has_alias("master").unwrap());
        assert_eq!(guardian.decrypt(&ct).await.unwrap(), b"keyset");
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_back_to_software_silently() {
        let hardware: Arc<dyn KeyProvider> =
            Arc::new(MemoryKeyProvider::unavailable(ProviderKind::Hardware));
        let soft = software();
        let guardian = MasterKeyGuardian::new("master", Some(hardware), soft.clone());

        let ct = guardian.encrypt(b"keyset").await.unwrap();
        assert_eq!(guardian.provider_kind(), Some(ProviderKind::Software));
        assert!(soft.has_alias("master").unwrap());
        assert_eq!(guardian.decrypt(&ct).await.unwrap(), b"keyset");
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_survives_new_guardian() {
        let hardware: Arc<dyn KeyProvider> = Arc::new(MemoryKeyProvider::new(ProviderKind::Hardware));
        let soft = software();

        let first = MasterKeyGuardian::new("master", Some(hardware.clone()), soft.clone());
        let ct = first.encrypt(b"wrapped").await.unwrap();
        drop(first);

        let second = MasterKeyGuardian::new("master", Some(hardware), soft);
        assert!(second.has_key());
        assert_eq!(second.decrypt(&ct).await.unwrap(), b"wrapped");
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_retry_reloads_once() {
        let flaky = Arc::new(FlakyProvider::new(vec![KeyProviderError::EntryUnreadable(
            "busy".to_string(),
        )]));
        flaky.inner.generate("master").unwrap();
        let guardian = MasterKeyGuardian::new("master", Some(flaky.clone()), software());

        guardian.get_key().await.unwrap();
        assert_eq!(flaky.loads.load(Ordering::SeqCst), 2);
        // one resolution before the failure, one after the forced reload
        assert_eq!(flaky.alias_checks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_retry_exhausted_propagates() {
        let flaky = Arc::new(FlakyProvider::new(vec![
            KeyProviderError::EntryUnreadable("busy".to_string()),
            KeyProviderError::EntryUnreadable("still busy".to_string()),
        ]));
        flaky.inner.generate("master").unwrap();
        let guardian = MasterKeyGuardian::new("master", Some(flaky.clone()), software());

        let err = guardian.get_key().await.unwrap_err();
        assert!(matches!(
            err,
            GuardianError::Provider(KeyProviderError::EntryUnreadable(_))
        ));
        assert_eq!(flaky.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_retry_without_reload() {
        let flaky = Arc::new(FlakyProvider::new(vec![KeyProviderError::Provider(
            "keystore crashed".to_string(),
        )]));
        let guardian = MasterKeyGuardian::new("master", Some(flaky.clone()), software());

        let ct = guardian.encrypt(b"data").await.unwrap();
        assert_eq!(flaky.loads.load(Ordering::SeqCst), 2);
        // handle resolved once (generate path), never reloaded
        assert_eq!(flaky.alias_checks.load(Ordering::SeqCst), 1);
        assert_eq!(guardian.decrypt(&ct).await.unwrap(), b"data");
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_retry_exhausted_propagates() {
        let flaky = Arc::new(FlakyProvider::new(vec![
            KeyProviderError::Provider("one".to_string()),
            KeyProviderError::Provider("two".to_string()),
        ]));
        let guardian = MasterKeyGuardian::new("master", Some(flaky.clone()), software());

        let err = guardian.encrypt(b"data").await.unwrap_err();
        assert!(matches!(err, GuardianError::Provider(KeyProviderError::Provider(_))));
        assert_eq!(flaky.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tag_mismatch_not_retried() {
        let flaky = Arc::new(FlakyProvider::new(vec![]));
        let guardian = MasterKeyGuardian::new("master", Some(flaky.clone()), software());

        let mut ct = guardian.encrypt(b"data").await.unwrap();
        ct.data[0] ^= 0x80;
        let loads_before = flaky.loads.load(Ordering::SeqCst);

        let err = guardian.decrypt(&ct).await.unwrap_err();
        assert!(matches!(err, GuardianError::Crypto(CryptoError::AuthenticationFailed)));
        assert_eq!(flaky.loads.load(Ordering::SeqCst), loads_before + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_alias_after_wipe_regenerates() {
        let hardware = Arc::new(MemoryKeyProvider::new(ProviderKind::Hardware));
        let guardian = MasterKeyGuardian::new("master", Some(hardware.clone()), software());

        let ct = guardian.encrypt(b"old").await.unwrap();
        hardware.remove("master");

        // The reload path finds no alias and creates a fresh key; old data is gone
        let err = guardian.decrypt(&ct).await.unwrap_err();
        assert!(matches!(err, GuardianError::Crypto(CryptoError::AuthenticationFailed)));
        assert!(hardware.has_alias("master").unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_operations_share_handle() {
        let flaky = Arc::new(FlakyProvider::new(vec![]));
        let guardian = Arc::new(MasterKeyGuardian::new("master", Some(flaky.clone()), software()));
        guardian.get_key().await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..8u8 {
            let guardian = guardian.clone();
            tasks.push(tokio::spawn(async move {
                let ct = guardian.encrypt(&[i; 4]).await.unwrap();
                guardian.decrypt(&ct).await.unwrap()
            }));
        }
        for (i, task) in tasks.into_iter().enumerate() {
            assert_eq!(task.await.unwrap(), vec![i as u8; 4]);
        }
        assert_eq!(flaky.alias_checks.load(Ordering::SeqCst), 1);
    }
}
