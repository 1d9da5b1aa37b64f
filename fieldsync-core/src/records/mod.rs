//! Locally captured records and their upload lifecycle.
//!
//! ```text
//!            create(draft)        set_draft(false)
//!   new ──────────────────> Draft ───────────────> ReadyForUpload
//!    └─────────────────────────────────────────────────┘ create(ready)
//!
//!   ReadyForUpload ── upload ok, full info ──> Uploaded
//!   ReadyForUpload ── upload ok, no created ─> Partial ── reconcile ──> Uploaded
//!   ReadyForUpload ── upload rejected ───────> ReadyForUpload (+ server error)
//! ```
//!
//! Once a record carries server info it can no longer be edited or deleted
//! locally; only the server error annotation stays writable.

pub mod lifecycle;
pub mod model;
pub mod store;

pub use lifecycle::RecordState;
pub use model::{RecordKind, ServerInfo, SyncableRecord};
pub use store::{RecordStore, SqliteRecordStore};

use thiserror::Error;

/// Errors from the record store
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("Record not found: {0}")]
    NotFound(i64),

    #[error("Record {0} is linked to the server and can no longer be changed")]
    Locked(i64),

    #[error("Unknown record kind: {0}")]
    UnknownKind(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Record store lock poisoned")]
    LockPoisoned,
}

/// Result type for record operations
pub type Result<T> = std::result::Result<T, RecordError>;
