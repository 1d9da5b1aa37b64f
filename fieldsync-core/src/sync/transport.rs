//! Remote API contract consumed by the sync engine.

use crate::records::{RecordKind, ServerInfo};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Transport failures, split by how the sync engine reacts to them
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The server refused this one record; the batch continues
    #[error("{message}")]
    Rejected { message: String },

    #[error("Session rejected by server: {0}")]
    Unauthorized(String),

    #[error("Server unreachable: {0}")]
    Unreachable(String),

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Unexpected server response: {0}")]
    InvalidResponse(String),
}

impl TransportError {
    /// Whether the error ends the whole run rather than one record.
    ///
    /// A plain 500 is the server failing on this payload; gateway and
    /// availability statuses mean nothing else will get through either.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::Rejected { .. } | Self::Server { status: 500, .. }
        )
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }
}

/// Session issued by a successful authentication
#[derive(Clone, Serialize, Deserialize)]
pub struct AuthGrant {
    pub token: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for AuthGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGrant")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Server response to an accepted upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    #[serde(default)]
    pub node_id: Option<i64>,
    pub object_id: String,
    #[serde(default)]
    pub created_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub update_time: Option<DateTime<Utc>>,
}

impl From<UploadReceipt> for ServerInfo {
    fn from(receipt: UploadReceipt) -> Self {
        ServerInfo {
            node_id: receipt.node_id,
            object_id: Some(receipt.object_id),
            created_time: receipt.created_time,
            update_time: receipt.update_time,
        }
    }
}

/// Metadata fetched back for a partial record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    #[serde(default)]
    pub created_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub update_time: Option<DateTime<Utc>>,
}

/// Calls the sync engine makes against the server
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn authenticate(&self, username: &str, password: &str) -> Result<AuthGrant, TransportError>;

    async fn upload_record(
        &self,
        token: &str,
        kind: RecordKind,
        payload: &serde_json::Value,
    ) -> Result<UploadReceipt, TransportError>;

    async fn fetch_record_metadata(
        &self,
        token: &str,
        kind: RecordKind,
        object_id: &str,
    ) -> Result<RecordMetadata, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_record_and_fatal_errors() {
        assert!(!TransportError::rejected("facility required").is_fatal());
        assert!(!TransportError::Server {
            status: 500,
            message: "NullPointerException".into()
        }
        .is_fatal());
        for status in [502, 503, 504] {
            assert!(TransportError::Server {
                status,
                message: "gateway".into()
            }
            .is_fatal());
        }
        assert!(TransportError::Unauthorized("expired".into()).is_fatal());
        assert!(TransportError::Unreachable("dns".into()).is_fatal());
        assert!(TransportError::Server {
            status: 503,
            message: "down".into()
        }
        .is_fatal());
        assert!(TransportError::InvalidResponse("html".into()).is_fatal());
    }

    #[test]
    fn test_receipt_without_created_time_is_partial() {
        let receipt: UploadReceipt = serde_json::from_str(r#"{"object_id":"obj-9"}"#).unwrap();
        let info = ServerInfo::from(receipt);
        assert!(info.is_partial());
    }

    #[test]
    fn test_rejected_display_is_server_text() {
        assert_eq!(
            TransportError::rejected("facility required").to_string(),
            "facility required"
        );
    }
}
