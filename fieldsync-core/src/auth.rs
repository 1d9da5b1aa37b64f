//! Login flow: online login, offline re-authentication and logout.
//!
//! Requests go through a single-slot queue in front of one worker. While a
//! request is queued or running, further submissions are coalesced (dropped)
//! rather than piling up behind it. Outcomes are published on a watch
//! channel.

use crate::crypto::{CredentialHash, CredentialHasher, CryptoError, HashContext};
use crate::sync::transport::{SyncTransport, TransportError};
use crate::vault::{SessionToken, SettingsRecord, SettingsVault, VaultError};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use zeroize::Zeroizing;

/// Errors from the login flow
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("No stored credentials for offline login")]
    NoOfflineCredentials,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Hashing task failed: {0}")]
    Task(String),

    #[error("Login worker stopped")]
    WorkerStopped,
}

/// Result type for login operations
pub type Result<T> = std::result::Result<T, AuthError>;

/// Performs logins against the server and the vault
pub struct LoginService {
    transport: Arc<dyn SyncTransport>,
    vault: Arc<SettingsVault>,
    hasher: CredentialHasher,
}

impl LoginService {
    pub fn new(
        transport: Arc<dyn SyncTransport>,
        vault: Arc<SettingsVault>,
        hasher: CredentialHasher,
    ) -> Self {
        Self {
            transport,
            vault,
            hasher,
        }
    }

    /// Authenticate with the server and store the session and credential hashes
    pub async fn login(&self, username: &str, password: &str) -> Result<SettingsRecord> {
        let grant = self.transport.authenticate(username, password).await.map_err(|e| match e {
            TransportError::Unauthorized(_) | TransportError::Rejected { .. } => {
                AuthError::InvalidCredentials
            }
            other => AuthError::Transport(other),
        })?;

        let (password_hash, username_hash) = self.hash_credentials(username, password).await?;

        let now = Utc::now();
        let mut token = SessionToken::new(grant.token, now);
        if let Some(expires_at) = grant.expires_at {
            token = token.with_expiry(expires_at);
        }
        let record = self
            .vault
            .record_login(token, password_hash, username_hash, now)
            .await?;
        info!("Online login succeeded");
        Ok(record)
    }

    /// Verify against the stored hashes without contacting the server
    pub async fn reauthenticate_offline(&self, username: &str, password: &str) -> Result<DateTime<Utc>> {
        let record = self.vault.read().await?;
        let (Some(password_hash), Some(username_hash)) = (record.password_hash, record.username_hash)
        else {
            return Err(AuthError::NoOfflineCredentials);
        };

        let hasher = self.hasher.clone();
        let username = Zeroizing::new(username.to_string());
        let password = Zeroizing::new(password.to_string());
        let valid = tokio::task::spawn_blocking(move || {
            // Both checks run so timing does not reveal which one failed
            let user_ok = hasher.verify(&username, &username_hash);
            let pass_ok = hasher.verify(&password, &password_hash);
            user_ok & pass_ok
        })
        .await
        .map_err(|e| AuthError::Task(e.to_string()))?;

        if !valid {
            warn!("Offline re-authentication rejected");
            return Err(AuthError::InvalidCredentials);
        }

        let now = Utc::now();
        self.vault.record_reauth(now).await?;
        info!("Offline re-authentication succeeded");
        Ok(now)
    }

    pub async fn logout(&self) -> Result<()> {
        self.vault.logout().await?;
        Ok(())
    }

    async fn hash_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<(CredentialHash, CredentialHash)> {
        let hasher = self.hasher.clone();
        let username = Zeroizing::new(username.to_string());
        let password = Zeroizing::new(password.to_string());
        tokio::task::spawn_blocking(move || {
            let password_hash = hasher.hash(&password, HashContext::Password)?;
            let username_hash = hasher.hash(&username, HashContext::Username)?;
            Ok::<_, CryptoError>((password_hash, username_hash))
        })
        .await
        .map_err(|e| AuthError::Task(e.to_string()))?
        .map_err(AuthError::from)
    }
}

/// A queued login attempt
pub enum LoginRequest {
    Online {
        username: Zeroizing<String>,
        password: Zeroizing<String>,
    },
    Offline {
        username: Zeroizing<String>,
        password: Zeroizing<String>,
    },
    Logout,
}

impl LoginRequest {
    pub fn online(username: &str, password: &str) -> Self {
        Self::Online {
            username: Zeroizing::new(username.to_string()),
            password: Zeroizing::new(password.to_string()),
        }
    }

    pub fn offline(username: &str, password: &str) -> Self {
        Self::Offline {
            username: Zeroizing::new(username.to_string()),
            password: Zeroizing::new(password.to_string()),
        }
    }
}

/// Whether a submission was taken or folded into one already pending
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginSubmit {
    Accepted,
    Coalesced,
}

/// Latest login outcome, for observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    Idle,
    InProgress,
    LoggedIn { at: DateTime<Utc> },
    Reauthenticated { at: DateTime<Utc> },
    LoggedOut,
    Failed(String),
}

/// Single-slot front door to the [`LoginService`]
pub struct LoginCoordinator {
    tx: mpsc::Sender<LoginRequest>,
    busy: Arc<AtomicBool>,
    outcome: watch::Receiver<LoginOutcome>,
}

impl LoginCoordinator {
    /// Start the worker on the current tokio runtime
    pub fn spawn(service: Arc<LoginService>) -> Self {
        let (tx, mut rx) = mpsc::channel::<LoginRequest>(1);
        let (outcome_tx, outcome_rx) = watch::channel(LoginOutcome::Idle);
        let busy = Arc::new(AtomicBool::new(false));

        let worker_busy = busy.clone();
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                outcome_tx.send_replace(LoginOutcome::InProgress);
                let outcome = handle(&service, request).await;
                // Free the slot first so observers of the outcome can resubmit
                worker_busy.store(false, Ordering::SeqCst);
                outcome_tx.send_replace(outcome);
            }
        });

        Self {
            tx,
            busy,
            outcome: outcome_rx,
        }
    }

    /// Queue `request` unless another one is pending or running
    pub fn submit(&self, request: LoginRequest) -> Result<LoginSubmit> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(LoginSubmit::Coalesced);
        }
        match self.tx.try_send(request) {
            Ok(()) => Ok(LoginSubmit::Accepted),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(LoginSubmit::Coalesced),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.busy.store(false, Ordering::SeqCst);
                Err(AuthError::WorkerStopped)
            }
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<LoginOutcome> {
        self.outcome.clone()
    }

    pub fn current(&self) -> LoginOutcome {
        self.outcome.borrow().clone()
    }
}

async fn handle(service: &LoginService, request: LoginRequest) -> LoginOutcome {
    let result = match request {
        LoginRequest::Online { username, password } => service
            .login(&username, &password)
            .await
            .map(|r| LoginOutcome::LoggedIn {
                at: r.last_auth_at.unwrap_or_else(Utc::now),
            }),
        LoginRequest::Offline { username, password } => service
            .reauthenticate_offline(&username, &password)
            .await
            .map(|at| LoginOutcome::Reauthenticated { at }),
        LoginRequest::Logout => service.logout().await.map(|_| LoginOutcome::LoggedOut),
    };
    result.unwrap_or_else(|e| LoginOutcome::Failed(e.to_string()))
}
