//! Reference data refresh (districts, facilities, enumerations).
//!
//! Read-only: each sub-stage downloads its full list and replaces the local
//! copy. Progress is stage-only.

use crate::records::RecordError;
use crate::sync::cancel::CancelFlag;
use crate::sync::progress::{ProgressReporter, SyncProgress};
use crate::sync::scheduler::Job;
use crate::sync::transport::TransportError;
use crate::sync::{Result, SyncError};
use crate::vault::SettingsVault;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Reference data sets, in refresh order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfoSubStage {
    Districts,
    Facilities,
    Enumerations,
}

impl InfoSubStage {
    pub const ALL: [InfoSubStage; 3] = [
        InfoSubStage::Districts,
        InfoSubStage::Facilities,
        InfoSubStage::Enumerations,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InfoSubStage::Districts => "districts",
            InfoSubStage::Facilities => "facilities",
            InfoSubStage::Enumerations => "enumerations",
        }
    }
}

impl fmt::Display for InfoSubStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where reference data comes from
#[async_trait]
pub trait ReferenceDataSource: Send + Sync {
    async fn fetch_reference(
        &self,
        token: &str,
        sub_stage: InfoSubStage,
    ) -> std::result::Result<Vec<serde_json::Value>, TransportError>;
}

/// Where refreshed reference data goes
pub trait ReferenceDataSink: Send + Sync {
    /// Replace the whole set for `sub_stage`
    fn replace_reference(
        &self,
        sub_stage: InfoSubStage,
        items: &[serde_json::Value],
    ) -> std::result::Result<(), RecordError>;
}

/// Outcome of one info sync run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InfoSyncReport {
    pub refreshed: Vec<(InfoSubStage, usize)>,
    pub failed: Vec<(InfoSubStage, String)>,
}

/// Refresh every sub-stage in order.
///
/// A rejected sub-stage is logged and skipped; fatal transport errors and
/// cancellation end the run.
pub async fn run_info_sync(
    source: &dyn ReferenceDataSource,
    sink: &dyn ReferenceDataSink,
    token: &str,
    progress: &ProgressReporter,
    cancel: &CancelFlag,
) -> Result<InfoSyncReport> {
    let mut report = InfoSyncReport::default();

    for sub_stage in InfoSubStage::ALL {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        progress.report(SyncProgress::info(sub_stage));

        match source.fetch_reference(token, sub_stage).await {
            Ok(items) => {
                sink.replace_reference(sub_stage, &items)?;
                info!(%sub_stage, count = items.len(), "Reference data refreshed");
                report.refreshed.push((sub_stage, items.len()));
            }
            Err(e) if !e.is_fatal() => {
                warn!(%sub_stage, error = %e, "Reference data refresh rejected");
                report.failed.push((sub_stage, e.to_string()));
            }
            Err(e) => return Err(e.into()),
        }
    }

    progress.report(SyncProgress::done());
    Ok(report)
}

/// Schedulable info sync using the session token from the vault
pub struct InfoSyncJob {
    source: Arc<dyn ReferenceDataSource>,
    sink: Arc<dyn ReferenceDataSink>,
    vault: Arc<SettingsVault>,
}

impl InfoSyncJob {
    pub fn new(
        source: Arc<dyn ReferenceDataSource>,
        sink: Arc<dyn ReferenceDataSink>,
        vault: Arc<SettingsVault>,
    ) -> Self {
        Self {
            source,
            sink,
            vault,
        }
    }

    pub async fn run_once(
        &self,
        progress: &ProgressReporter,
        cancel: &CancelFlag,
    ) -> Result<InfoSyncReport> {
        let token = self
            .vault
            .read()
            .await?
            .token
            .ok_or(SyncError::NotLoggedIn)?;
        if token.is_expired(Utc::now()) {
            return Err(SyncError::SessionExpired);
        }
        run_info_sync(
            self.source.as_ref(),
            self.sink.as_ref(),
            &token.value,
            progress,
            cancel,
        )
        .await
    }
}

#[async_trait]
impl Job for InfoSyncJob {
    async fn run(&self, progress: &ProgressReporter, cancel: &CancelFlag) -> Result<()> {
        self.run_once(progress, cancel).await.map(|_| ())
    }
}
