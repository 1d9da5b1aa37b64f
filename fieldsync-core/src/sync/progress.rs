//! Sync stages and progress reporting.

use crate::records::RecordKind;
use crate::sync::info_sync::InfoSubStage;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Progress data key: current stage name
pub const KEY_STAGE: &str = "stage";
/// Progress data key: records handled so far in the stage
pub const KEY_NUM_COMPLETED: &str = "numCompleted";
/// Progress data key: records in the stage snapshot
pub const KEY_NUM_TOTAL: &str = "numTotal";
/// Progress data key: failed records so far in the stage
pub const KEY_NUM_FAILED: &str = "numFailed";
/// Progress data key: info sync sub-stage
pub const KEY_INFO_STAGE: &str = "infoStage";

/// Stages of a sync run, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncStage {
    Starting,
    UploadPrimaryRecords,
    UploadSecondaryRecordKinds,
    UploadAncillaryTelemetry,
    ReconcilePartialRecords,
    InfoSync,
    Done,
}

impl SyncStage {
    /// Record-upload stages and the kind each one uploads
    pub const UPLOADS: [(SyncStage, RecordKind); 3] = [
        (SyncStage::UploadPrimaryRecords, RecordKind::TrainingForm),
        (SyncStage::UploadSecondaryRecordKinds, RecordKind::FacilityBpInfo),
        (SyncStage::UploadAncillaryTelemetry, RecordKind::UsageTelemetry),
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStage::Starting => "starting",
            SyncStage::UploadPrimaryRecords => "upload_primary_records",
            SyncStage::UploadSecondaryRecordKinds => "upload_secondary_record_kinds",
            SyncStage::UploadAncillaryTelemetry => "upload_ancillary_telemetry",
            SyncStage::ReconcilePartialRecords => "reconcile_partial_records",
            SyncStage::InfoSync => "info_sync",
            SyncStage::Done => "done",
        }
    }
}

impl fmt::Display for SyncStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Determinate counters of a record-upload stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageCounts {
    pub done: usize,
    pub total: usize,
    pub failed: usize,
}

/// One progress signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncProgress {
    pub stage: SyncStage,
    /// `None` for indeterminate stages
    pub counts: Option<StageCounts>,
    pub info_stage: Option<InfoSubStage>,
}

impl SyncProgress {
    /// Stage-only signal
    pub fn stage(stage: SyncStage) -> Self {
        Self {
            stage,
            counts: None,
            info_stage: None,
        }
    }

    pub fn counts(stage: SyncStage, counts: StageCounts) -> Self {
        Self {
            stage,
            counts: Some(counts),
            info_stage: None,
        }
    }

    pub fn info(sub_stage: InfoSubStage) -> Self {
        Self {
            stage: SyncStage::InfoSync,
            counts: None,
            info_stage: Some(sub_stage),
        }
    }

    pub fn done() -> Self {
        Self::stage(SyncStage::Done)
    }

    /// Flatten into the key/value form handed to progress observers
    pub fn to_data(&self) -> BTreeMap<&'static str, Value> {
        let mut data = BTreeMap::new();
        data.insert(KEY_STAGE, Value::from(self.stage.as_str()));
        if let Some(counts) = self.counts {
            data.insert(KEY_NUM_COMPLETED, Value::from(counts.done));
            data.insert(KEY_NUM_TOTAL, Value::from(counts.total));
            data.insert(KEY_NUM_FAILED, Value::from(counts.failed));
        }
        if let Some(sub_stage) = self.info_stage {
            data.insert(KEY_INFO_STAGE, Value::from(sub_stage.as_str()));
        }
        data
    }
}

impl Default for SyncProgress {
    fn default() -> Self {
        Self::stage(SyncStage::Starting)
    }
}

/// Publishes progress to any number of observers
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: Arc<watch::Sender<SyncProgress>>,
}

impl ProgressReporter {
    pub fn channel() -> (Self, watch::Receiver<SyncProgress>) {
        let (tx, rx) = watch::channel(SyncProgress::default());
        (Self { tx: Arc::new(tx) }, rx)
    }

    /// Reporter nobody is listening to yet
    pub fn detached() -> Self {
        Self::channel().0
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncProgress> {
        self.tx.subscribe()
    }

    pub fn report(&self, progress: SyncProgress) {
        self.tx.send_replace(progress);
    }

    pub fn current(&self) -> SyncProgress {
        self.tx.borrow().clone()
    }
}
