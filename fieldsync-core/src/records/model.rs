//! Record data model

use crate::records::RecordError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Uploadable record kinds, in upload order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Primary record: a training form
    TrainingForm,
    /// Secondary record: facility blood-pressure information
    FacilityBpInfo,
    /// Ancillary usage telemetry
    UsageTelemetry,
}

impl RecordKind {
    pub const ALL: [RecordKind; 3] = [
        RecordKind::TrainingForm,
        RecordKind::FacilityBpInfo,
        RecordKind::UsageTelemetry,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::TrainingForm => "training_form",
            RecordKind::FacilityBpInfo => "facility_bp_info",
            RecordKind::UsageTelemetry => "usage_telemetry",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecordKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| RecordError::UnknownKind(s.to_string()))
    }
}

/// Server linkage assigned once the server has accepted a record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub node_id: Option<i64>,
    pub object_id: Option<String>,
    pub created_time: Option<DateTime<Utc>>,
    pub update_time: Option<DateTime<Utc>>,
}

impl ServerInfo {
    /// Accepted by the server but metadata not yet fetched back
    pub fn is_partial(&self) -> bool {
        self.object_id.is_some() && self.created_time.is_none()
    }

    /// Merge fetched metadata into this linkage
    pub fn with_times(
        mut self,
        created_time: Option<DateTime<Utc>>,
        update_time: Option<DateTime<Utc>>,
    ) -> Self {
        if created_time.is_some() {
            self.created_time = created_time;
        }
        if update_time.is_some() {
            self.update_time = update_time;
        }
        self
    }
}

/// A locally captured record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncableRecord {
    /// Local id, assigned in insertion order and never reused
    pub id: i64,
    pub kind: RecordKind,
    pub payload: serde_json::Value,
    pub is_draft: bool,
    pub server_info: Option<ServerInfo>,
    pub server_error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}
