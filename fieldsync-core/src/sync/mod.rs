//! Offline-first synchronization of locally captured records.
//!
//! - Staged upload of pending records with continue-on-error per record
//! - Reconciliation of records the server accepted without full metadata
//! - Reference data refresh
//! - In-process job scheduler with unique work, network constraint and backoff

pub mod cancel;
#[cfg(feature = "http-transport")]
pub mod http;
pub mod info_sync;
pub mod orchestrator;
pub mod progress;
pub mod scheduler;
pub mod transport;

pub use cancel::CancelFlag;
#[cfg(feature = "http-transport")]
pub use http::HttpTransport;
pub use info_sync::{
    run_info_sync, InfoSubStage, InfoSyncJob, InfoSyncReport, ReferenceDataSink,
    ReferenceDataSource,
};
pub use orchestrator::{StageReport, SyncOrchestrator, SyncReport};
pub use progress::{ProgressReporter, StageCounts, SyncProgress, SyncStage};
pub use scheduler::{
    AlwaysOnline, Connectivity, Constraints, ExistingWorkPolicy, Job, JobHandle, JobState,
    SchedulerSettings, SyncScheduler,
};
pub use transport::{AuthGrant, RecordMetadata, SyncTransport, TransportError, UploadReceipt};

use crate::records::RecordError;
use crate::vault::VaultError;
use thiserror::Error;

/// Unique work name of the record sync job
pub const SYNC_WORK_NAME: &str = "fieldsync.sync";

/// Unique work name of the reference data refresh job
pub const INFO_SYNC_WORK_NAME: &str = "fieldsync.info_sync";

/// Errors that end a sync run
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Not logged in")]
    NotLoggedIn,

    #[error("Session expired; log in again")]
    SessionExpired,

    #[error("Sync run cancelled")]
    Cancelled,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Record store error: {0}")]
    Records(#[from] RecordError),

    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

impl SyncError {
    /// Whether running the same job again later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Transport(
                TransportError::Unreachable(_)
                    | TransportError::Server { .. }
                    | TransportError::InvalidResponse(_)
            )
        )
    }
}

/// Result type for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;
