//! Sync orchestrator: staged upload and reconciliation of local records.
//!
//! ```text
//! Starting
//!   -> UploadPrimaryRecords        (training forms)
//!   -> UploadSecondaryRecordKinds  (facility BP info)
//!   -> UploadAncillaryTelemetry    (usage telemetry)
//!   -> ReconcilePartialRecords     (all kinds, advisory)
//!   -> Done
//! ```
//!
//! A rejected record, or one the server failed on with a 500, gets the
//! server's message and the batch moves on. Any other transport failure ends
//! the run; the scheduler owns retrying it.

use crate::records::{RecordKind, RecordStore, ServerInfo, SyncableRecord};
use crate::sync::cancel::CancelFlag;
use crate::sync::progress::{ProgressReporter, StageCounts, SyncProgress, SyncStage};
use crate::sync::scheduler::Job;
use crate::sync::transport::SyncTransport;
use crate::sync::{Result, SyncError};
use crate::vault::SettingsVault;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Outcome of one record-upload or reconciliation stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub stage: SyncStage,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Accepted uploads still waiting for their metadata
    pub partial: usize,
}

impl StageReport {
    fn new(stage: SyncStage, total: usize) -> Self {
        Self {
            stage,
            total,
            succeeded: 0,
            failed: 0,
            partial: 0,
        }
    }

    fn counts(&self) -> StageCounts {
        StageCounts {
            done: self.succeeded + self.failed,
            total: self.total,
            failed: self.failed,
        }
    }
}

/// Outcome of a completed run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub stages: Vec<StageReport>,
    pub last_synced_at: DateTime<Utc>,
}

impl SyncReport {
    pub fn total_failed(&self) -> usize {
        self.stages.iter().map(|s| s.failed).sum()
    }

    pub fn stage(&self, stage: SyncStage) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == stage)
    }
}

/// Drives one sync run over the record store and transport
pub struct SyncOrchestrator {
    store: Arc<dyn RecordStore>,
    transport: Arc<dyn SyncTransport>,
    vault: Arc<SettingsVault>,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        transport: Arc<dyn SyncTransport>,
        vault: Arc<SettingsVault>,
    ) -> Self {
        Self {
            store,
            transport,
            vault,
        }
    }

    /// Execute every stage in order.
    ///
    /// Returns an error when the run was aborted; records handled before the
    /// abort keep their new state.
    pub async fn run(&self, progress: &ProgressReporter, cancel: &CancelFlag) -> Result<SyncReport> {
        progress.report(SyncProgress::stage(SyncStage::Starting));
        let token = self.session_token().await?;
        info!("Sync run started");

        let mut stages = Vec::with_capacity(SyncStage::UPLOADS.len() + 1);
        for (stage, kind) in SyncStage::UPLOADS {
            let report = self
                .upload_stage(stage, kind, &token, progress, cancel)
                .await
                .map_err(|e| log_abort(stage, e))?;
            stages.push(report);
        }

        let now = Utc::now();
        self.vault.record_sync(now).await?;

        let report = self
            .reconcile_stage(&token, progress, cancel)
            .await
            .map_err(|e| log_abort(SyncStage::ReconcilePartialRecords, e))?;
        stages.push(report);

        progress.report(SyncProgress::done());
        let report = SyncReport {
            stages,
            last_synced_at: now,
        };
        info!(failed = report.total_failed(), "Sync run finished");
        Ok(report)
    }

    async fn session_token(&self) -> Result<String> {
        let settings = self.vault.read().await?;
        let token = settings.token.ok_or(SyncError::NotLoggedIn)?;
        if token.is_expired(Utc::now()) {
            return Err(SyncError::SessionExpired);
        }
        Ok(token.value)
    }

    async fn upload_stage(
        &self,
        stage: SyncStage,
        kind: RecordKind,
        token: &str,
        progress: &ProgressReporter,
        cancel: &CancelFlag,
    ) -> Result<StageReport> {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        // Snapshot: records captured during the stage wait for the next run
        let records = self.store.query_eligible_for_upload(kind)?;
        let mut report = StageReport::new(stage, records.len());
        progress.report(SyncProgress::counts(stage, report.counts()));
        debug!(%stage, %kind, total = report.total, "Upload stage started");

        for record in records {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            self.upload_one(&record, token, &mut report).await?;
            progress.report(SyncProgress::counts(stage, report.counts()));
        }

        info!(
            %stage,
            total = report.total,
            failed = report.failed,
            partial = report.partial,
            "Upload stage finished"
        );
        Ok(report)
    }

    async fn upload_one(
        &self,
        record: &SyncableRecord,
        token: &str,
        report: &mut StageReport,
    ) -> Result<()> {
        self.store.update_server_error(record.id, None)?;

        match self
            .transport
            .upload_record(token, record.kind, &record.payload)
            .await
        {
            Ok(receipt) => {
                let info = ServerInfo::from(receipt);
                if info.is_partial() {
                    report.partial += 1;
                }
                if !self.store.update_server_info(record.id, &info)? {
                    warn!(id = record.id, "Uploaded record vanished before linkage was saved");
                }
                report.succeeded += 1;
                Ok(())
            }
            Err(e) if !e.is_fatal() => {
                warn!(id = record.id, kind = %record.kind, error = %e, "Record upload failed");
                self.store
                    .update_server_error(record.id, Some(&e.to_string()))?;
                report.failed += 1;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn reconcile_stage(
        &self,
        token: &str,
        progress: &ProgressReporter,
        cancel: &CancelFlag,
    ) -> Result<StageReport> {
        let stage = SyncStage::ReconcilePartialRecords;
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        progress.report(SyncProgress::stage(stage));

        let mut partials = Vec::new();
        for kind in RecordKind::ALL {
            partials.extend(self.store.query_partial_records(kind)?);
        }
        partials.sort_by_key(|r| r.id);
        let mut report = StageReport::new(stage, partials.len());

        for record in partials {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let Some(info) = record.server_info.clone() else {
                continue;
            };
            let Some(object_id) = info.object_id.clone() else {
                continue;
            };

            match self
                .transport
                .fetch_record_metadata(token, record.kind, &object_id)
                .await
            {
                Ok(meta) => {
                    let merged = info.with_times(meta.created_time, meta.update_time);
                    if merged.is_partial() {
                        report.partial += 1;
                    }
                    self.store.update_server_info(record.id, &merged)?;
                    report.succeeded += 1;
                }
                Err(e) if !e.is_fatal() => {
                    debug!(id = record.id, error = %e, "Reconciliation skipped");
                    report.failed += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        if report.total > 0 {
            info!(
                total = report.total,
                reconciled = report.succeeded - report.partial,
                "Partial records reconciled"
            );
        }
        Ok(report)
    }
}

#[async_trait]
impl Job for SyncOrchestrator {
    async fn run(&self, progress: &ProgressReporter, cancel: &CancelFlag) -> Result<()> {
        SyncOrchestrator::run(self, progress, cancel).await.map(|_| ())
    }
}

fn log_abort(stage: SyncStage, e: SyncError) -> SyncError {
    match &e {
        SyncError::Cancelled => info!(%stage, "Sync run cancelled"),
        _ => error!(%stage, error = %e, "Sync run aborted"),
    }
    e
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::{KeyProvider, MasterKeyGuardian, MemoryKeyProvider, ProviderKind};
    use crate::records::SqliteRecordStore;
    use crate::sync::scheduler::{
        AlwaysOnline, Constraints, ExistingWorkPolicy, JobState, SchedulerSettings, SyncScheduler,
    };
    use crate::sync::SYNC_WORK_NAME;
    use crate::sync::transport::{AuthGrant, RecordMetadata, TransportError, UploadReceipt};
    use crate::vault::{SessionToken, VaultLayout};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Transport answering uploads by the payload's "tag" field
    #[derive(Default)]
    struct ScriptedTransport {
        upload_errors: HashMap<String, TransportError>,
        partial_tags: Vec<String>,
        metadata: Option<RecordMetadata>,
        uploads: Mutex<Vec<(RecordKind, String)>>,
        fetches: Mutex<Vec<String>>,
        cancel_after_first: Option<CancelFlag>,
        /// Holds every upload open until cancelled
        gate: Option<CancelFlag>,
    }

    #[async_trait]
    impl SyncTransport for ScriptedTransport {
        async fn authenticate(&self, _: &str, _: &str) -> std::result::Result<AuthGrant, TransportError> {
            Ok(AuthGrant {
                token: "tok".into(),
                expires_at: None,
            })
        }

        async fn upload_record(
            &self,
            token: &str,
            kind: RecordKind,
            payload: &serde_json::Value,
        ) -> std::result::Result<UploadReceipt, TransportError> {
            assert_eq!(token, "abc");
            let tag = payload["tag"].as_str().unwrap_or_default().to_string();
            self.uploads.lock().unwrap().push((kind, tag.clone()));
            if let Some(flag) = &self.cancel_after_first {
                flag.cancel();
            }
            if let Some(gate) = &self.gate {
                gate.cancelled().await;
            }
            if let Some(err) = self.upload_errors.get(&tag) {
                return Err(err.clone());
            }
            let created = if self.partial_tags.contains(&tag) {
                None
            } else {
                Some(Utc::now())
            };
            Ok(UploadReceipt {
                node_id: Some(1),
                object_id: format!("obj-{}", tag),
                created_time: created,
                update_time: created,
            })
        }

        async fn fetch_record_metadata(
            &self,
            _: &str,
            _: RecordKind,
            object_id: &str,
        ) -> std::result::Result<RecordMetadata, TransportError> {
            self.fetches.lock().unwrap().push(object_id.to_string());
            self.metadata
                .clone()
                .ok_or_else(|| TransportError::rejected("not yet indexed"))
        }
    }

    struct Harness {
        _dir: TempDir,
        store: Arc<SqliteRecordStore>,
        vault: Arc<SettingsVault>,
    }

    impl Harness {
        async fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let software: Arc<dyn KeyProvider> = Arc::new(MemoryKeyProvider::new(ProviderKind::Software));
            let guardian = Arc::new(MasterKeyGuardian::new("sync-test", None, software));
            let vault = SettingsVault::bootstrap_and_open(guardian, VaultLayout::in_dir(dir.path()))
                .await
                .unwrap();
            vault
                .update(|r| r.token = Some(SessionToken::new("abc", Utc::now())))
                .await
                .unwrap();
            Self {
                _dir: dir,
                store: Arc::new(SqliteRecordStore::in_memory().unwrap()),
                vault: Arc::new(vault),
            }
        }

        fn add(&self, kind: RecordKind, tag: &str) -> i64 {
            self.store
                .create(kind, &json!({ "tag": tag }), false)
                .unwrap()
                .id
        }

        fn orchestrator(&self, transport: Arc<ScriptedTransport>) -> SyncOrchestrator {
            SyncOrchestrator::new(self.store.clone(), transport, self.vault.clone())
        }
    }

    #[tokio::test]
    async fn test_rejected_record_does_not_block_batch() {
        let h = Harness::new().await;
        let ids: Vec<i64> = ["1", "2", "3"]
            .iter()
            .map(|t| h.add(RecordKind::TrainingForm, t))
            .collect();
        let transport = Arc::new(ScriptedTransport {
            upload_errors: HashMap::from([(
                "2".to_string(),
                TransportError::rejected("facility required"),
            )]),
            ..Default::default()
        });
        let (progress, rx) = ProgressReporter::channel();

        let report = h
            .orchestrator(transport.clone())
            .run(&progress, &CancelFlag::new())
            .await
            .unwrap();

        let primary = report.stage(SyncStage::UploadPrimaryRecords).unwrap();
        assert_eq!(primary.total, 3);
        assert_eq!(primary.failed, 1);
        assert_eq!(report.total_failed(), 1);
        assert_eq!(transport.uploads.lock().unwrap().len(), 3);

        let r1 = h.store.get(ids[0]).unwrap();
        let r2 = h.store.get(ids[1]).unwrap();
        let r3 = h.store.get(ids[2]).unwrap();
        assert!(r1.server_info.is_some());
        assert!(r3.server_info.is_some());
        assert!(r2.server_info.is_none());
        assert_eq!(r2.server_error_message.as_deref(), Some("facility required"));
        assert_eq!(rx.borrow().stage, SyncStage::Done);

        let settings = h.vault.read().await.unwrap();
        assert_eq!(settings.last_synced_at, Some(report.last_synced_at));
    }

    #[tokio::test]
    async fn test_server_failure_on_one_record_does_not_block_batch() {
        let h = Harness::new().await;
        let ids: Vec<i64> = ["r1", "r2", "r3"]
            .iter()
            .map(|t| h.add(RecordKind::TrainingForm, t))
            .collect();
        let transport = Arc::new(ScriptedTransport {
            upload_errors: HashMap::from([(
                "r1".to_string(),
                TransportError::Server {
                    status: 500,
                    message: "NullPointerException".into(),
                },
            )]),
            ..Default::default()
        });

        let report = h
            .orchestrator(transport.clone())
            .run(&ProgressReporter::detached(), &CancelFlag::new())
            .await
            .unwrap();

        assert_eq!(report.total_failed(), 1);
        let tags: Vec<String> = transport
            .uploads
            .lock()
            .unwrap()
            .iter()
            .map(|(_, t)| t.clone())
            .collect();
        assert_eq!(tags, vec!["r1", "r2", "r3"]);

        let r1 = h.store.get(ids[0]).unwrap();
        assert!(r1.server_info.is_none());
        assert_eq!(
            r1.server_error_message.as_deref(),
            Some("Server error 500: NullPointerException")
        );
        assert!(h.store.get(ids[1]).unwrap().server_info.is_some());
        assert!(h.store.get(ids[2]).unwrap().server_info.is_some());
    }

    #[tokio::test]
    async fn test_gateway_error_still_aborts() {
        let h = Harness::new().await;
        h.add(RecordKind::TrainingForm, "r1");
        h.add(RecordKind::TrainingForm, "r2");
        let transport = Arc::new(ScriptedTransport {
            upload_errors: HashMap::from([(
                "r1".to_string(),
                TransportError::Server {
                    status: 503,
                    message: "maintenance".into(),
                },
            )]),
            ..Default::default()
        });

        let err = h
            .orchestrator(transport.clone())
            .run(&ProgressReporter::detached(), &CancelFlag::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(transport.uploads.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stages_run_in_order_ascending_ids() {
        let h = Harness::new().await;
        h.add(RecordKind::UsageTelemetry, "t1");
        h.add(RecordKind::FacilityBpInfo, "f1");
        h.add(RecordKind::TrainingForm, "p1");
        h.add(RecordKind::TrainingForm, "p2");
        h.store
            .create(RecordKind::TrainingForm, &json!({"tag": "draft"}), true)
            .unwrap();
        let transport = Arc::new(ScriptedTransport::default());

        h.orchestrator(transport.clone())
            .run(&ProgressReporter::detached(), &CancelFlag::new())
            .await
            .unwrap();

        let tags: Vec<String> = transport
            .uploads
            .lock()
            .unwrap()
            .iter()
            .map(|(_, t)| t.clone())
            .collect();
        assert_eq!(tags, vec!["p1", "p2", "f1", "t1"]);
    }

    #[tokio::test]
    async fn test_fatal_error_aborts_remaining_stages() {
        let h = Harness::new().await;
        h.add(RecordKind::TrainingForm, "p1");
        h.add(RecordKind::TrainingForm, "p2");
        h.add(RecordKind::FacilityBpInfo, "f1");
        let transport = Arc::new(ScriptedTransport {
            upload_errors: HashMap::from([(
                "p1".to_string(),
                TransportError::Unauthorized("token revoked".into()),
            )]),
            ..Default::default()
        });

        let err = h
            .orchestrator(transport.clone())
            .run(&ProgressReporter::detached(), &CancelFlag::new())
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Transport(TransportError::Unauthorized(_))));
        assert_eq!(transport.uploads.lock().unwrap().len(), 1);
        assert!(h.vault.read().await.unwrap().last_synced_at.is_none());
    }

    #[tokio::test]
    async fn test_error_cleared_on_retry() {
        let h = Harness::new().await;
        let id = h.add(RecordKind::TrainingForm, "p1");
        h.store.update_server_error(id, Some("old failure")).unwrap();

        h.orchestrator(Arc::new(ScriptedTransport::default()))
            .run(&ProgressReporter::detached(), &CancelFlag::new())
            .await
            .unwrap();

        let record = h.store.get(id).unwrap();
        assert!(record.server_error_message.is_none());
        assert!(record.server_info.is_some());
    }

    #[tokio::test]
    async fn test_partial_upload_reconciled() {
        let h = Harness::new().await;
        let id = h.add(RecordKind::TrainingForm, "p1");
        let created = Utc::now();
        let transport = Arc::new(ScriptedTransport {
            partial_tags: vec!["p1".to_string()],
            metadata: Some(RecordMetadata {
                created_time: Some(created),
                update_time: Some(created),
            }),
            ..Default::default()
        });

        let report = h
            .orchestrator(transport)
            .run(&ProgressReporter::detached(), &CancelFlag::new())
            .await
            .unwrap();

        assert_eq!(report.stage(SyncStage::UploadPrimaryRecords).unwrap().partial, 1);
        let reconcile = report.stage(SyncStage::ReconcilePartialRecords).unwrap();
        assert_eq!(reconcile.total, 1);
        assert_eq!(reconcile.succeeded, 1);
        assert_eq!(reconcile.partial, 0);

        let record = h.store.get(id).unwrap();
        assert_eq!(record.server_info.unwrap().object_id.as_deref(), Some("obj-p1"));
        assert!(h
            .store
            .query_partial_records(RecordKind::TrainingForm)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_in_ascending_id_order_across_kinds() {
        let h = Harness::new().await;
        let older = h.add(RecordKind::FacilityBpInfo, "f1");
        let newer = h.add(RecordKind::TrainingForm, "p1");
        assert!(older < newer);
        let now = Utc::now();
        let transport = Arc::new(ScriptedTransport {
            partial_tags: vec!["f1".to_string(), "p1".to_string()],
            metadata: Some(RecordMetadata {
                created_time: Some(now),
                update_time: Some(now),
            }),
            ..Default::default()
        });

        h.orchestrator(transport.clone())
            .run(&ProgressReporter::detached(), &CancelFlag::new())
            .await
            .unwrap();

        // Uploads go primary kind first; reconciliation is by id alone
        assert_eq!(*transport.fetches.lock().unwrap(), vec!["obj-f1", "obj-p1"]);
    }

    #[tokio::test]
    async fn test_reconciliation_failure_is_advisory() {
        let h = Harness::new().await;
        h.add(RecordKind::TrainingForm, "p1");
        let transport = Arc::new(ScriptedTransport {
            partial_tags: vec!["p1".to_string()],
            metadata: None,
            ..Default::default()
        });

        let report = h
            .orchestrator(transport)
            .run(&ProgressReporter::detached(), &CancelFlag::new())
            .await
            .unwrap();

        let reconcile = report.stage(SyncStage::ReconcilePartialRecords).unwrap();
        assert_eq!(reconcile.failed, 1);
        assert_eq!(
            h.store
                .query_partial_records(RecordKind::TrainingForm)
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_cancel_checked_between_records() {
        let h = Harness::new().await;
        h.add(RecordKind::TrainingForm, "p1");
        h.add(RecordKind::TrainingForm, "p2");
        let cancel = CancelFlag::new();
        let transport = Arc::new(ScriptedTransport {
            cancel_after_first: Some(cancel.clone()),
            ..Default::default()
        });

        let err = h
            .orchestrator(transport.clone())
            .run(&ProgressReporter::detached(), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Cancelled));
        // The in-flight upload completed; the next record was never started
        assert_eq!(transport.uploads.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_replace_during_upload_sends_record_once() {
        let h = Harness::new().await;
        let id = h.add(RecordKind::TrainingForm, "only");
        let gate = CancelFlag::new();
        let transport = Arc::new(ScriptedTransport {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let scheduler = SyncScheduler::new(Arc::new(AlwaysOnline), SchedulerSettings::default());

        let mut first = scheduler
            .enqueue_unique(
                SYNC_WORK_NAME,
                ExistingWorkPolicy::Keep,
                Constraints::default(),
                Arc::new(h.orchestrator(transport.clone())),
            )
            .unwrap();
        while transport.uploads.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }

        let mut second = scheduler
            .enqueue_unique(
                SYNC_WORK_NAME,
                ExistingWorkPolicy::Replace,
                Constraints::default(),
                Arc::new(h.orchestrator(transport.clone())),
            )
            .unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(transport.uploads.lock().unwrap().len(), 1);

        // Server answers the in-flight upload
        gate.cancel();
        assert_eq!(first.wait().await, JobState::Cancelled);
        assert_eq!(second.wait().await, JobState::Succeeded);

        let tags: Vec<String> = transport
            .uploads
            .lock()
            .unwrap()
            .iter()
            .map(|(_, t)| t.clone())
            .collect();
        assert_eq!(tags, vec!["only"]);
        assert!(h.store.get(id).unwrap().server_info.is_some());
    }

    #[tokio::test]
    async fn test_requires_session() {
        let h = Harness::new().await;
        h.vault.logout().await.unwrap();

        let err = h
            .orchestrator(Arc::new(ScriptedTransport::default()))
            .run(&ProgressReporter::detached(), &CancelFlag::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotLoggedIn));
    }

    #[tokio::test]
    async fn test_progress_counts_after_each_record() {
        let h = Harness::new().await;
        h.add(RecordKind::TrainingForm, "p1");
        h.add(RecordKind::TrainingForm, "p2");
        let transport = Arc::new(ScriptedTransport {
            upload_errors: HashMap::from([("p2".to_string(), TransportError::rejected("bad"))]),
            ..Default::default()
        });
        let (progress, mut rx) = ProgressReporter::channel();

        let observer = tokio::spawn(async move {
            let mut seen = Vec::new();
            while rx.changed().await.is_ok() {
                let p = rx.borrow_and_update().clone();
                if let Some(c) = p.counts {
                    if p.stage == SyncStage::UploadPrimaryRecords {
                        seen.push((c.done, c.total, c.failed));
                    }
                }
                if p.stage == SyncStage::Done {
                    break;
                }
            }
            seen
        });
        tokio::task::yield_now().await;

        h.orchestrator(transport)
            .run(&progress, &CancelFlag::new())
            .await
            .unwrap();

        let seen = observer.await.unwrap();
        // watch keeps only the latest value, so intermediate signals may be skipped
        assert!(seen.iter().all(|(_, total, _)| *total == 2));
        assert!(seen.windows(2).all(|w| w[0].0 <= w[1].0));
    }
}
