//! Upload state derived from a record's fields

use crate::records::{RecordError, Result, SyncableRecord};
use std::fmt;

/// Where a record is in its upload lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Draft,
    ReadyForUpload,
    Uploaded,
    Partial,
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecordState::Draft => "draft",
            RecordState::ReadyForUpload => "ready",
            RecordState::Uploaded => "uploaded",
            RecordState::Partial => "partial",
        };
        f.write_str(s)
    }
}

impl SyncableRecord {
    pub fn state(&self) -> RecordState {
        match &self.server_info {
            Some(info) if info.is_partial() => RecordState::Partial,
            Some(_) => RecordState::Uploaded,
            None if self.is_draft => RecordState::Draft,
            None => RecordState::ReadyForUpload,
        }
    }

    /// Never linked to the server and not a draft
    pub fn is_eligible_for_upload(&self) -> bool {
        self.server_info.is_none() && !self.is_draft
    }

    /// Needs its server metadata fetched back
    pub fn needs_reconciliation(&self) -> bool {
        self.server_info
            .as_ref()
            .map(|info| info.is_partial())
            .unwrap_or(false)
    }

    /// Local edits and deletes are allowed only before server linkage
    pub fn is_locally_editable(&self) -> bool {
        self.server_info.is_none()
    }

    pub fn ensure_editable(&self) -> Result<()> {
        if self.is_locally_editable() {
            Ok(())
        } else {
            Err(RecordError::Locked(self.id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{RecordKind, ServerInfo};
    use chrono::Utc;

    fn record(is_draft: bool, server_info: Option<ServerInfo>) -> SyncableRecord {
        SyncableRecord {
            id: 1,
            kind: RecordKind::TrainingForm,
            payload: serde_json::json!({}),
            is_draft,
            server_info,
            server_error_message: None,
            created_at: Utc::now(),
            modified_at: Utc::now(),
        }
    }

    #[test]
    fn test_states() {
        assert_eq!(record(true, None).state(), RecordState::Draft);
        assert_eq!(record(false, None).state(), RecordState::ReadyForUpload);

        let partial = ServerInfo {
            object_id: Some("o".to_string()),
            ..Default::default()
        };
        assert_eq!(record(false, Some(partial.clone())).state(), RecordState::Partial);

        let full = partial.with_times(Some(Utc::now()), Some(Utc::now()));
        assert_eq!(record(false, Some(full)).state(), RecordState::Uploaded);
    }

    #[test]
    fn test_eligibility_excludes_drafts_and_linked() {
        assert!(record(false, None).is_eligible_for_upload());
        assert!(!record(true, None).is_eligible_for_upload());
        assert!(!record(false, Some(ServerInfo::default())).is_eligible_for_upload());
    }

    #[test]
    fn test_linked_records_locked() {
        assert!(record(true, None).ensure_editable().is_ok());
        assert!(matches!(
            record(false, Some(ServerInfo::default())).ensure_editable(),
            Err(RecordError::Locked(1))
        ));
    }

    #[test]
    fn test_server_error_does_not_change_state() {
        let mut r = record(false, None);
        r.server_error_message = Some("facility required".to_string());
        assert_eq!(r.state(), RecordState::ReadyForUpload);
        assert!(r.is_eligible_for_upload());
    }
}
