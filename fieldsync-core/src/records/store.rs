//! Record store contract and its SQLite implementation.

use crate::records::{RecordError, RecordKind, Result, ServerInfo, SyncableRecord};
use crate::sync::info_sync::{InfoSubStage, ReferenceDataSink};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// What the sync engine needs from the local record store
pub trait RecordStore: Send + Sync {
    /// Non-draft records never linked to the server, ascending id
    fn query_eligible_for_upload(&self, kind: RecordKind) -> Result<Vec<SyncableRecord>>;

    /// Records with an object id but no created time, ascending id
    fn query_partial_records(&self, kind: RecordKind) -> Result<Vec<SyncableRecord>>;

    /// Replace a record's server linkage. Returns false if no such record.
    fn update_server_info(&self, id: i64, info: &ServerInfo) -> Result<bool>;

    /// Set or clear the server error annotation. Returns false if no such record.
    fn update_server_error(&self, id: i64, message: Option<&str>) -> Result<bool>;
}

const COLUMNS: &str = "id, kind, payload, is_draft, has_server_info, server_node_id, \
     server_object_id, server_created_ms, server_updated_ms, server_error, \
     created_ms, modified_ms";

/// SQLite-backed record store
pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
}

impl SqliteRecordStore {
    /// Open (and if needed create) a store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Create a new in-memory store for testing
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                is_draft INTEGER NOT NULL,
                has_server_info INTEGER NOT NULL DEFAULT 0,
                server_node_id INTEGER,
                server_object_id TEXT,
                server_created_ms INTEGER,
                server_updated_ms INTEGER,
                server_error TEXT,
                created_ms INTEGER NOT NULL,
                modified_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_records_kind_id ON records(kind, id);
            CREATE TABLE IF NOT EXISTS reference_data (
                sub_stage TEXT NOT NULL,
                position INTEGER NOT NULL,
                item TEXT NOT NULL,
                PRIMARY KEY (sub_stage, position)
            );",
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| RecordError::LockPoisoned)
    }

    /// Capture a new record. Draft status is always an explicit choice.
    pub fn create(
        &self,
        kind: RecordKind,
        payload: &serde_json::Value,
        is_draft: bool,
    ) -> Result<SyncableRecord> {
        let now = Utc::now().timestamp_millis();
        let payload_json = serde_json::to_string(payload)?;

        let id = {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO records (kind, payload, is_draft, created_ms, modified_ms)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![kind.as_str(), payload_json, is_draft, now],
            )?;
            conn.last_insert_rowid()
        };

        debug!(id, %kind, is_draft, "Record created");
        self.get(id)
    }

    pub fn get(&self, id: i64) -> Result<SyncableRecord> {
        let conn = self.lock()?;
        Self::fetch(&conn, id)?.ok_or(RecordError::NotFound(id))
    }

    /// All records, optionally of one kind, ascending id
    pub fn list(&self, kind: Option<RecordKind>) -> Result<Vec<SyncableRecord>> {
        match kind {
            Some(kind) => self.query("kind = ?1", &kind.as_str()),
            None => self.query("1 = ?1", &1),
        }
    }

    /// Replace the payload of a record not yet linked to the server
    pub fn edit_payload(&self, id: i64, payload: &serde_json::Value) -> Result<SyncableRecord> {
        let payload_json = serde_json::to_string(payload)?;
        self.mutate_editable(id, |conn, now| {
            conn.execute(
                "UPDATE records SET payload = ?1, modified_ms = ?2 WHERE id = ?3",
                params![payload_json, now, id],
            )
        })?;
        self.get(id)
    }

    pub fn set_draft(&self, id: i64, is_draft: bool) -> Result<SyncableRecord> {
        self.mutate_editable(id, |conn, now| {
            conn.execute(
                "UPDATE records SET is_draft = ?1, modified_ms = ?2 WHERE id = ?3",
                params![is_draft, now, id],
            )
        })?;
        self.get(id)
    }

    pub fn delete(&self, id: i64) -> Result<()> {
        self.mutate_editable(id, |conn, _| {
            conn.execute("DELETE FROM records WHERE id = ?1", params![id])
        })?;
        debug!(id, "Record deleted");
        Ok(())
    }

    /// Number of records waiting for upload, all kinds
    pub fn count_eligible(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM records WHERE has_server_info = 0 AND is_draft = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn mutate_editable<F>(&self, id: i64, f: F) -> Result<()>
    where
        F: FnOnce(&Connection, i64) -> rusqlite::Result<usize>,
    {
        let conn = self.lock()?;
        let record = Self::fetch(&conn, id)?.ok_or(RecordError::NotFound(id))?;
        record.ensure_editable()?;
        f(&conn, Utc::now().timestamp_millis())?;
        Ok(())
    }

    fn fetch(conn: &Connection, id: i64) -> Result<Option<SyncableRecord>> {
        let sql = format!("SELECT {} FROM records WHERE id = ?1", COLUMNS);
        let raw = conn
            .query_row(&sql, params![id], RawRecord::from_row)
            .optional()?;
        raw.map(RawRecord::into_record).transpose()
    }

    fn query(&self, filter: &str, arg: &dyn rusqlite::ToSql) -> Result<Vec<SyncableRecord>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM records WHERE {} ORDER BY id ASC", COLUMNS, filter);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([arg], RawRecord::from_row)?;

        let mut records = Vec::new();
        for raw in rows {
            records.push(raw?.into_record()?);
        }
        Ok(records)
    }
}

impl RecordStore for SqliteRecordStore {
    fn query_eligible_for_upload(&self, kind: RecordKind) -> Result<Vec<SyncableRecord>> {
        self.query(
            "kind = ?1 AND has_server_info = 0 AND is_draft = 0",
            &kind.as_str(),
        )
    }

    fn query_partial_records(&self, kind: RecordKind) -> Result<Vec<SyncableRecord>> {
        self.query(
            "kind = ?1 AND has_server_info = 1 AND server_object_id IS NOT NULL \
             AND server_created_ms IS NULL",
            &kind.as_str(),
        )
    }

    fn update_server_info(&self, id: i64, info: &ServerInfo) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE records SET has_server_info = 1, server_node_id = ?1, server_object_id = ?2,
                 server_created_ms = ?3, server_updated_ms = ?4
             WHERE id = ?5",
            params![
                info.node_id,
                info.object_id,
                info.created_time.map(|t| t.timestamp_millis()),
                info.update_time.map(|t| t.timestamp_millis()),
                id
            ],
        )?;
        Ok(changed > 0)
    }

    fn update_server_error(&self, id: i64, message: Option<&str>) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE records SET server_error = ?1 WHERE id = ?2",
            params![message, id],
        )?;
        Ok(changed > 0)
    }
}

impl SqliteRecordStore {
    /// Cached reference items of one set, in server order
    pub fn reference_items(&self, sub_stage: InfoSubStage) -> Result<Vec<serde_json::Value>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT item FROM reference_data WHERE sub_stage = ?1 ORDER BY position ASC",
        )?;
        let rows = stmt.query_map(params![sub_stage.as_str()], |row| row.get::<_, String>(0))?;

        let mut items = Vec::new();
        for item in rows {
            items.push(serde_json::from_str(&item?)?);
        }
        Ok(items)
    }
}

impl ReferenceDataSink for SqliteRecordStore {
    fn replace_reference(&self, sub_stage: InfoSubStage, items: &[serde_json::Value]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM reference_data WHERE sub_stage = ?1",
            params![sub_stage.as_str()],
        )?;
        for (position, item) in items.iter().enumerate() {
            tx.execute(
                "INSERT INTO reference_data (sub_stage, position, item) VALUES (?1, ?2, ?3)",
                params![sub_stage.as_str(), position as i64, serde_json::to_string(item)?],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

/// Row as stored, before kind and payload are parsed
struct RawRecord {
    id: i64,
    kind: String,
    payload: String,
    is_draft: bool,
    has_server_info: bool,
    node_id: Option<i64>,
    object_id: Option<String>,
    created_ms: Option<i64>,
    updated_ms: Option<i64>,
    server_error: Option<String>,
    local_created_ms: i64,
    local_modified_ms: i64,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            payload: row.get(2)?,
            is_draft: row.get(3)?,
            has_server_info: row.get(4)?,
            node_id: row.get(5)?,
            object_id: row.get(6)?,
            created_ms: row.get(7)?,
            updated_ms: row.get(8)?,
            server_error: row.get(9)?,
            local_created_ms: row.get(10)?,
            local_modified_ms: row.get(11)?,
        })
    }

    fn into_record(self) -> Result<SyncableRecord> {
        let server_info = self.has_server_info.then(|| ServerInfo {
            node_id: self.node_id,
            object_id: self.object_id,
            created_time: self.created_ms.and_then(from_millis),
            update_time: self.updated_ms.and_then(from_millis),
        });

        Ok(SyncableRecord {
            id: self.id,
            kind: self.kind.parse()?,
            payload: serde_json::from_str(&self.payload)?,
            is_draft: self.is_draft,
            server_info,
            server_error_message: self.server_error,
            created_at: from_millis(self.local_created_ms).unwrap_or_default(),
            modified_at: from_millis(self.local_modified_ms).unwrap_or_default(),
        })
    }
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::RecordState;
    use serde_json::json;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn full_info(object_id: &str) -> ServerInfo {
        ServerInfo {
            node_id: Some(7),
            object_id: Some(object_id.to_string()),
            created_time: Some(ts(1_700_000_000)),
            update_time: Some(ts(1_700_000_100)),
        }
    }

    #[test]
    fn test_create_and_get() {
        let store = SqliteRecordStore::in_memory().unwrap();
        let record = store
            .create(RecordKind::TrainingForm, &json!({"trainees": 12}), false)
            .unwrap();

        assert!(record.id > 0);
        assert_eq!(record.payload["trainees"], 12);
        assert_eq!(record.state(), RecordState::ReadyForUpload);
        assert_eq!(store.get(record.id).unwrap(), record);
        assert!(matches!(store.get(999), Err(RecordError::NotFound(999))));
    }

    #[test]
    fn test_eligible_query_order_and_filters() {
        let store = SqliteRecordStore::in_memory().unwrap();
        let a = store.create(RecordKind::TrainingForm, &json!({"n": 1}), false).unwrap();
        let draft = store.create(RecordKind::TrainingForm, &json!({"n": 2}), true).unwrap();
        let other = store.create(RecordKind::FacilityBpInfo, &json!({}), false).unwrap();
        let b = store.create(RecordKind::TrainingForm, &json!({"n": 3}), false).unwrap();

        let ids: Vec<i64> = store
            .query_eligible_for_upload(RecordKind::TrainingForm)
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![a.id, b.id]);
        assert!(!ids.contains(&draft.id));
        assert!(!ids.contains(&other.id));

        store.set_draft(draft.id, false).unwrap();
        let ids: Vec<i64> = store
            .query_eligible_for_upload(RecordKind::TrainingForm)
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![a.id, draft.id, b.id]);
    }

    #[test]
    fn test_server_info_moves_record_between_queries() {
        let store = SqliteRecordStore::in_memory().unwrap();
        let r = store.create(RecordKind::TrainingForm, &json!({}), false).unwrap();
        let kind = RecordKind::TrainingForm;

        let partial = ServerInfo {
            object_id: Some("obj-1".to_string()),
            ..Default::default()
        };
        assert!(store.update_server_info(r.id, &partial).unwrap());
        assert!(store.query_eligible_for_upload(kind).unwrap().is_empty());
        let partials = store.query_partial_records(kind).unwrap();
        assert_eq!(partials.len(), 1);
        assert_eq!(partials[0].state(), RecordState::Partial);

        assert!(store.update_server_info(r.id, &full_info("obj-1")).unwrap());
        assert!(store.query_eligible_for_upload(kind).unwrap().is_empty());
        assert!(store.query_partial_records(kind).unwrap().is_empty());

        let stored = store.get(r.id).unwrap();
        assert_eq!(stored.server_info, Some(full_info("obj-1")));
        assert_eq!(stored.state(), RecordState::Uploaded);
    }

    #[test]
    fn test_update_missing_record_returns_false() {
        let store = SqliteRecordStore::in_memory().unwrap();
        assert!(!store.update_server_info(42, &full_info("x")).unwrap());
        assert!(!store.update_server_error(42, Some("nope")).unwrap());
    }

    #[test]
    fn test_linked_record_rejects_local_changes() {
        let store = SqliteRecordStore::in_memory().unwrap();
        let r = store.create(RecordKind::TrainingForm, &json!({"a": 1}), false).unwrap();
        store.update_server_info(r.id, &full_info("obj")).unwrap();

        assert!(matches!(
            store.edit_payload(r.id, &json!({"a": 2})),
            Err(RecordError::Locked(_))
        ));
        assert!(matches!(store.set_draft(r.id, true), Err(RecordError::Locked(_))));
        assert!(matches!(store.delete(r.id), Err(RecordError::Locked(_))));

        // The error annotation stays writable
        assert!(store.update_server_error(r.id, Some("late warning")).unwrap());
        assert!(store.update_server_error(r.id, None).unwrap());
        assert_eq!(store.get(r.id).unwrap().payload["a"], 1);
    }

    #[test]
    fn test_edit_and_delete_unlinked() {
        let store = SqliteRecordStore::in_memory().unwrap();
        let r = store.create(RecordKind::UsageTelemetry, &json!({"screen": "home"}), true).unwrap();

        let edited = store.edit_payload(r.id, &json!({"screen": "sync"})).unwrap();
        assert_eq!(edited.payload["screen"], "sync");
        assert!(edited.modified_at >= r.modified_at);

        store.delete(r.id).unwrap();
        assert!(matches!(store.get(r.id), Err(RecordError::NotFound(_))));
        assert!(matches!(store.delete(r.id), Err(RecordError::NotFound(_))));
    }

    #[test]
    fn test_ids_not_reused_after_delete() {
        let store = SqliteRecordStore::in_memory().unwrap();
        let a = store.create(RecordKind::TrainingForm, &json!({}), false).unwrap();
        store.delete(a.id).unwrap();
        let b = store.create(RecordKind::TrainingForm, &json!({}), false).unwrap();
        assert!(b.id > a.id);
    }

    #[test]
    fn test_server_error_roundtrip_keeps_eligibility() {
        let store = SqliteRecordStore::in_memory().unwrap();
        let r = store.create(RecordKind::TrainingForm, &json!({}), false).unwrap();
        store.update_server_error(r.id, Some("facility required")).unwrap();

        let eligible = store.query_eligible_for_upload(RecordKind::TrainingForm).unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(
            eligible[0].server_error_message.as_deref(),
            Some("facility required")
        );
        assert_eq!(store.count_eligible().unwrap(), 1);
    }

    #[test]
    fn test_list_by_kind() {
        let store = SqliteRecordStore::in_memory().unwrap();
        store.create(RecordKind::TrainingForm, &json!({}), false).unwrap();
        store.create(RecordKind::FacilityBpInfo, &json!({}), true).unwrap();

        assert_eq!(store.list(None).unwrap().len(), 2);
        assert_eq!(store.list(Some(RecordKind::FacilityBpInfo)).unwrap().len(), 1);
    }

    #[test]
    fn test_reference_data_replaced_whole() {
        let store = SqliteRecordStore::in_memory().unwrap();
        store
            .replace_reference(InfoSubStage::Districts, &[json!({"id": 1}), json!({"id": 2})])
            .unwrap();
        store
            .replace_reference(InfoSubStage::Districts, &[json!({"id": 3})])
            .unwrap();

        assert_eq!(
            store.reference_items(InfoSubStage::Districts).unwrap(),
            vec![json!({"id": 3})]
        );
        assert!(store.reference_items(InfoSubStage::Facilities).unwrap().is_empty());
    }

    #[test]
    fn test_open_file_persists() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("records.db");
        let id = {
            let store = SqliteRecordStore::open(&path).unwrap();
            store.create(RecordKind::TrainingForm, &json!({"k": "v"}), false).unwrap().id
        };
        let store = SqliteRecordStore::open(&path).unwrap();
        assert_eq!(store.get(id).unwrap().payload["k"], "v");
    }
}
