//! Footage blob store over an OpenDAL operator.
//!
//! Layout inside the operator root:
//!
//! ```text
//! objects/{id}        sealed container or single-frame blob
//! meta/{id}.json      StoredObject record
//! ```
//!
//! The record is written after the bytes, so an object is visible to readers
//! only once both halves exist.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use evcam_core::types::ObjectMetadata;
use opendal::{ErrorKind, FuturesBytesStream, Operator};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

const OBJECTS_PREFIX: &str = "objects/";
const META_PREFIX: &str = "meta/";

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found")]
    NotFound,

    #[error("storage backend: {0}")]
    Backend(#[from] opendal::Error),

    #[error("object record: {0}")]
    Record(#[from] serde_json::Error),
}

/// Persisted description of one stored object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredObject {
    pub id: String,
    pub filename: String,
    pub length: u64,
    pub content_type: String,
    #[serde(rename = "uploadDate")]
    pub upload_date: DateTime<Utc>,
    #[serde(default)]
    pub metadata: ObjectMetadata,
}

/// Metadata filter for [`BlobStore::query`]. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectQuery {
    /// Matches when any stored plate equals or contains this string
    pub plate: Option<String>,
    pub camera_id: Option<String>,
    /// Inclusive lower bound on upload time
    pub uploaded_from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on upload time
    pub uploaded_until: Option<DateTime<Utc>>,
}

impl ObjectQuery {
    pub fn matches(&self, obj: &StoredObject) -> bool {
        if let Some(plate) = &self.plate {
            let plate = plate.to_uppercase();
            if !obj
                .metadata
                .plate_numbers
                .iter()
                .any(|p| p.to_uppercase().contains(&plate))
            {
                return false;
            }
        }
        if let Some(cam) = &self.camera_id {
            if obj.metadata.camera_id.as_deref() != Some(cam.as_str()) {
                return false;
            }
        }
        if self.uploaded_from.is_some_and(|from| obj.upload_date < from) {
            return false;
        }
        if self.uploaded_until.is_some_and(|until| obj.upload_date >= until) {
            return false;
        }
        true
    }
}

/// Object store for sealed footage.
///
/// Cloning is cheap; clones share the operator and the metadata update lock.
#[derive(Clone)]
pub struct BlobStore {
    op: Operator,
    meta_lock: Arc<Mutex<()>>,
}

impl BlobStore {
    pub fn new(op: Operator) -> Self {
        Self {
            op,
            meta_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }

    /// Store `bytes` with `metadata` and return the new object id.
    pub async fn put(
        &self,
        filename: &str,
        content_type: &str,
        bytes: impl Into<Bytes>,
        metadata: ObjectMetadata,
    ) -> StoreResult<StoredObject> {
        let bytes: Bytes = bytes.into();
        let record = StoredObject {
            id: Uuid::new_v4().to_string(),
            filename: filename.to_string(),
            length: bytes.len() as u64,
            content_type: content_type.to_string(),
            upload_date: Utc::now(),
            metadata,
        };
        self.op.write(&object_path(&record.id), bytes).await?;
        self.write_record(&record).await?;
        debug!(id = %record.id, filename, length = record.length, "object stored");
        Ok(record)
    }

    /// Look up an object's record. Malformed ids are reported as not found.
    pub async fn record(&self, id: &str) -> StoreResult<StoredObject> {
        let id = normalize_id(id)?;
        let raw = self.op.read(&meta_path(&id)).await.map_err(not_found)?;
        Ok(serde_json::from_slice(&raw.to_vec())?)
    }

    /// Fetch an object's record and full contents.
    pub async fn get(&self, id: &str) -> StoreResult<(StoredObject, Bytes)> {
        let record = self.record(id).await?;
        let bytes = self.contents(&record).await?;
        Ok((record, bytes))
    }

    /// Read the bytes behind an already fetched record.
    pub async fn contents(&self, record: &StoredObject) -> StoreResult<Bytes> {
        let buf = self
            .op
            .read(&object_path(&record.id))
            .await
            .map_err(not_found)?;
        Ok(buf.to_bytes())
    }

    /// Stream the bytes behind a record, reading at most `piece_size` bytes
    /// from the backend per request.
    pub async fn contents_stream(
        &self,
        record: &StoredObject,
        piece_size: usize,
    ) -> StoreResult<FuturesBytesStream> {
        let reader = self
            .op
            .reader_with(&object_path(&record.id))
            .chunk(piece_size)
            .await
            .map_err(not_found)?;
        reader.into_bytes_stream(..).await.map_err(not_found)
    }

    /// All records matching `query`, oldest upload first.
    pub async fn query(&self, query: &ObjectQuery) -> StoreResult<Vec<StoredObject>> {
        let entries = match self.op.list(META_PREFIX).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut found = Vec::new();
        for entry in entries {
            if !entry.name().ends_with(".json") {
                continue;
            }
            let raw = match self.op.read(entry.path()).await {
                Ok(raw) => raw,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            match serde_json::from_slice::<StoredObject>(&raw.to_vec()) {
                Ok(record) if query.matches(&record) => found.push(record),
                Ok(_) => {}
                Err(e) => warn!(path = entry.path(), error = %e, "skipping unreadable object record"),
            }
        }
        found.sort_by(|a, b| a.upload_date.cmp(&b.upload_date).then_with(|| a.id.cmp(&b.id)));
        Ok(found)
    }

    /// Append `plate` to an object's plate list. Returns false when no object
    /// has that id.
    pub async fn push_plate(&self, id: &str, plate: &str) -> StoreResult<bool> {
        let _guard = self.meta_lock.lock().await;
        let mut record = match self.record(id).await {
            Ok(record) => record,
            Err(StoreError::NotFound) => return Ok(false),
            Err(e) => return Err(e),
        };
        record.metadata.plate_numbers.push(plate.to_string());
        self.write_record(&record).await?;
        debug!(id = %record.id, plate, "plate appended");
        Ok(true)
    }

    async fn write_record(&self, record: &StoredObject) -> StoreResult<()> {
        let body = serde_json::to_vec(record)?;
        self.op.write(&meta_path(&record.id), body).await?;
        Ok(())
    }
}

fn normalize_id(id: &str) -> StoreResult<String> {
    Uuid::parse_str(id)
        .map(|u| u.to_string())
        .map_err(|_| StoreError::NotFound)
}

fn object_path(id: &str) -> String {
    format!("{OBJECTS_PREFIX}{id}")
}

fn meta_path(id: &str) -> String {
    format!("{META_PREFIX}{id}.json")
}

fn not_found(e: opendal::Error) -> StoreError {
    if e.kind() == ErrorKind::NotFound {
        StoreError::NotFound
    } else {
        StoreError::Backend(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn memory_store() -> BlobStore {
        let op = Operator::new(opendal::services::Memory::default())
            .expect("memory operator")
            .finish();
        BlobStore::new(op)
    }

    fn meta(cam: &str, plates: &[&str]) -> ObjectMetadata {
        ObjectMetadata {
            camera_id: Some(cam.into()),
            plate_numbers: plates.iter().map(|p| p.to_string()).collect(),
            is_encrypted: true,
            container_format: Some("WattLagGyi".into()),
        }
    }

    #[tokio::test]
    async fn test_contents_stream_reads_in_bounded_pieces() {
        use futures::TryStreamExt;

        let store = memory_store();
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let stored = store
            .put("long.WattLagGyi", "application/octet-stream", data.clone(), meta("CAM_01", &[]))
            .await
            .unwrap();

        let pieces: Vec<Bytes> = store
            .contents_stream(&stored, 16 * 1024)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert!(pieces.len() > 1);
        assert!(pieces.iter().all(|p| p.len() <= 16 * 1024));
        assert_eq!(pieces.concat(), data);
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let store = memory_store();
        let stored = store
            .put("cam.WattLagGyi", "application/octet-stream", b"ciphertext".to_vec(), meta("CAM_01", &["KA01"]))
            .await
            .unwrap();

        let (record, bytes) = store.get(&stored.id).await.unwrap();
        assert_eq!(record, stored);
        assert_eq!(bytes.as_ref(), b"ciphertext");
        assert_eq!(record.length, 10);
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_ids_not_found() {
        let store = memory_store();
        assert!(matches!(store.get(&Uuid::new_v4().to_string()).await, Err(StoreError::NotFound)));
        assert!(matches!(store.get("../../etc/passwd").await, Err(StoreError::NotFound)));
        assert!(matches!(store.record("").await, Err(StoreError::NotFound)));
    }

    #[tokio::test]
    async fn test_query_filters_by_plate_and_camera() {
        let store = memory_store();
        store.put("a", "x", b"a".to_vec(), meta("CAM_01", &["KA01AB1234"])).await.unwrap();
        store.put("b", "x", b"b".to_vec(), meta("CAM_02", &["MH12XY9999"])).await.unwrap();
        store.put("c", "x", b"c".to_vec(), meta("CAM_01", &[])).await.unwrap();

        let by_plate = ObjectQuery {
            plate: Some("ab1234".into()),
            ..Default::default()
        };
        let hits = store.query(&by_plate).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].filename, "a");

        let by_cam = ObjectQuery {
            camera_id: Some("CAM_01".into()),
            ..Default::default()
        };
        let mut names: Vec<_> = store
            .query(&by_cam)
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.filename)
            .collect();
        names.sort();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_query_empty_store() {
        let store = memory_store();
        assert!(store.query(&ObjectQuery::default()).await.unwrap().is_empty());
    }

    #[test]
    fn test_time_window_bounds() {
        let at = Utc::now();
        let obj = StoredObject {
            id: Uuid::new_v4().to_string(),
            filename: "f".into(),
            length: 0,
            content_type: "x".into(),
            upload_date: at,
            metadata: ObjectMetadata::default(),
        };
        let window = |from: DateTime<Utc>, until: DateTime<Utc>| ObjectQuery {
            uploaded_from: Some(from),
            uploaded_until: Some(until),
            ..Default::default()
        };
        assert!(window(at, at + Duration::seconds(1)).matches(&obj), "lower bound inclusive");
        assert!(!window(at - Duration::seconds(1), at).matches(&obj), "upper bound exclusive");
    }

    #[tokio::test]
    async fn test_push_plate_appends() {
        let store = memory_store();
        let stored = store.put("a", "x", b"a".to_vec(), meta("CAM_01", &["ONE"])).await.unwrap();

        assert!(store.push_plate(&stored.id, "TWO").await.unwrap());
        let record = store.record(&stored.id).await.unwrap();
        assert_eq!(record.metadata.plate_numbers, vec!["ONE", "TWO"]);
    }

    #[tokio::test]
    async fn test_push_plate_unknown_id() {
        let store = memory_store();
        assert!(!store.push_plate(&Uuid::new_v4().to_string(), "X").await.unwrap());
        assert!(!store.push_plate("not-a-uuid", "X").await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_plate_pushes_all_land() {
        let store = memory_store();
        let stored = store.put("a", "x", b"a".to_vec(), meta("CAM_01", &[])).await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let id = stored.id.clone();
            tasks.push(tokio::spawn(async move { store.push_plate(&id, &format!("P{i}")).await }));
        }
        for t in tasks {
            assert!(t.await.unwrap().unwrap());
        }
        assert_eq!(store.record(&stored.id).await.unwrap().metadata.plate_numbers.len(), 8);
    }

    #[test]
    fn test_record_uses_upload_date_field_name() {
        let obj = StoredObject {
            id: "id".into(),
            filename: "f".into(),
            length: 1,
            content_type: "x".into(),
            upload_date: Utc::now(),
            metadata: ObjectMetadata::default(),
        };
        let json = serde_json::to_value(&obj).unwrap();
        assert!(json.get("uploadDate").is_some());
    }
}
