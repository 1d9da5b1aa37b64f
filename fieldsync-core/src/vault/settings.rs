//! Settings record kept in the vault and its login/sync transitions.

use crate::crypto::CredentialHash;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Server session token with its issue metadata
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionToken {
    pub value: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl SessionToken {
    pub fn new(value: impl Into<String>, issued_at: DateTime<Utc>) -> Self {
        Self {
            value: value.into(),
            issued_at,
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Tokens without an expiry never expire locally; the server decides.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionToken")
            .field("value", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// At-rest settings protected by the vault. One per install.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsRecord {
    pub token: Option<SessionToken>,
    pub last_auth_at: Option<DateTime<Utc>>,
    pub password_hash: Option<CredentialHash>,
    pub username_hash: Option<CredentialHash>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl SettingsRecord {
    /// Successful online login
    pub fn apply_login(
        &mut self,
        token: SessionToken,
        password_hash: CredentialHash,
        username_hash: CredentialHash,
        now: DateTime<Utc>,
    ) {
        self.token = Some(token);
        self.password_hash = Some(password_hash);
        self.username_hash = Some(username_hash);
        self.last_auth_at = Some(now);
    }

    /// Successful offline re-authentication
    pub fn apply_reauth(&mut self, now: DateTime<Utc>) {
        self.last_auth_at = Some(now);
    }

    /// Completed sync run
    pub fn apply_sync(&mut self, now: DateTime<Utc>) {
        self.last_synced_at = Some(now);
    }

    /// Forget the session and credentials. Sync history survives.
    pub fn apply_logout(&mut self) {
        self.token = None;
        self.password_hash = None;
        self.username_hash = None;
        self.last_auth_at = None;
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    /// Whether offline re-authentication is possible
    pub fn can_reauth_offline(&self) -> bool {
        self.password_hash.is_some() && self.username_hash.is_some()
    }
}
