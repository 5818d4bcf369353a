//! Access-controlled footage retrieval.
//!
//! Every operation takes the caller's [`Identity`] explicitly; the camera check
//! is the pure decision in [`ObjectMetadata::authorize`].

use bytes::Bytes;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use evcam_core::types::{Access, Identity, ObjectMetadata, ObjectSummary};
use evcam_crypto::{decrypt_blob, BlobFormat, Key, VideoBackend};
use evcam_storage::{BlobStore, ObjectQuery, StoredObject};
use futures::stream::{BoxStream, StreamExt};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::error::ServiceError;
use crate::metrics::ServiceMetrics;

/// Size of each streamed piece.
pub const STREAM_CHUNK: usize = 64 * 1024;

pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

const FORBIDDEN_CAMERA: &str = "Not authorized to view this camera's video";
const FORBIDDEN_UPDATE: &str = "No permission to update metadata";
const BAD_SEARCH: &str = "Invalid format. Use Date: YYYY-MM-DD, Time: HH:MM:SS";

/// Query-string filters accepted by search.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchParams {
    pub plate: Option<String>,
    /// `YYYY-MM-DD` in the viewers' local zone
    pub date: Option<String>,
    pub camera_id: Option<String>,
    /// `HH:MM:SS`; only used together with `end_time`
    pub start_time: Option<String>,
    pub end_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchOutcome {
    Found(Vec<ObjectSummary>),
    NoResults,
}

pub struct StreamService {
    store: BlobStore,
    key: Arc<Key>,
    backend: Arc<dyn VideoBackend>,
    scratch_dir: PathBuf,
    local_offset: FixedOffset,
    metrics: ServiceMetrics,
}

impl StreamService {
    pub fn new(
        store: BlobStore,
        key: Arc<Key>,
        backend: Arc<dyn VideoBackend>,
        scratch_dir: PathBuf,
        local_offset: FixedOffset,
        metrics: ServiceMetrics,
    ) -> Self {
        Self {
            store,
            key,
            backend,
            scratch_dir,
            local_offset,
            metrics,
        }
    }

    pub fn store(&self) -> &BlobStore {
        &self.store
    }

    /// Look up an object and apply the camera check.
    async fn authorized_record(&self, id: &str, identity: &Identity) -> Result<StoredObject, ServiceError> {
        let record = self.store.record(id).await?;
        if record.metadata.authorize(identity) == Access::Forbidden {
            debug!(user = %identity.username, id, camera = ?record.metadata.camera_id, "camera access denied");
            return Err(ServiceError::Forbidden(FORBIDDEN_CAMERA));
        }
        Ok(record)
    }

    /// Stream the stored (still encrypted) bytes.
    pub async fn stream_raw(&self, id: &str, identity: &Identity) -> Result<ByteStream, ServiceError> {
        let result = self.raw(id, identity).await;
        self.metrics.stream("raw", outcome_label(&result));
        result
    }

    async fn raw(&self, id: &str, identity: &Identity) -> Result<ByteStream, ServiceError> {
        let record = self.authorized_record(id, identity).await?;
        let body = self.store.contents_stream(&record, STREAM_CHUNK).await?;
        Ok(body.boxed())
    }

    /// Decrypt an object to a scratch file and stream it.
    ///
    /// The scratch file is removed when the returned stream is dropped, whether
    /// it ran to completion, failed, or the client went away.
    pub async fn stream_decrypted(&self, id: &str, identity: &Identity) -> Result<ByteStream, ServiceError> {
        let result = self.decrypted(id, identity).await;
        self.metrics.stream("decrypted", outcome_label(&result));
        result
    }

    async fn decrypted(&self, id: &str, identity: &Identity) -> Result<ByteStream, ServiceError> {
        let record = self.authorized_record(id, identity).await?;
        let blob = self.store.contents(&record).await?;
        let format = BlobFormat::from_tag(record.metadata.container_format.as_deref());

        let key = self.key.clone();
        let backend = self.backend.clone();
        let scratch = self.scratch_dir.clone();
        let decrypted = tokio::task::spawn_blocking(move || {
            decrypt_blob(&blob, &key, format, backend.as_ref(), &scratch)
        })
        .await;

        let playback = match decrypted {
            Ok(Ok(Some(file))) => file,
            Ok(Ok(None)) => {
                warn!(id = %record.id, ?format, "object did not decrypt under the current key");
                self.metrics.decrypt_failed();
                return Err(ServiceError::DecryptionFailed);
            }
            Ok(Err(e)) => {
                warn!(id = %record.id, error = %e, "decryption failed");
                self.metrics.decrypt_failed();
                return Err(ServiceError::DecryptionFailed);
            }
            Err(e) => {
                warn!(id = %record.id, error = %e, "decryption task aborted");
                self.metrics.decrypt_failed();
                return Err(ServiceError::DecryptionFailed);
            }
        };

        debug!(id = %record.id, segments = playback.segments, "streaming decrypted footage");
        let file = tokio::fs::File::open(playback.path())
            .await
            .map_err(|e| ServiceError::Internal(format!("opening playback file: {e}")))?;
        let scratch_file = playback.into_temp_path();
        let body = ReaderStream::with_capacity(file, STREAM_CHUNK).map(move |piece| {
            let _keep = &scratch_file;
            piece
        });
        Ok(body.boxed())
    }

    /// Search stored objects the caller may see.
    pub async fn search(&self, params: &SearchParams, identity: &Identity) -> Result<SearchOutcome, ServiceError> {
        let window = search_window(params, self.local_offset)?;
        let query = ObjectQuery {
            plate: non_empty(&params.plate),
            camera_id: non_empty(&params.camera_id),
            uploaded_from: window.map(|(from, _)| from),
            uploaded_until: window.map(|(_, until)| until),
        };

        let summaries: Vec<ObjectSummary> = self
            .store
            .query(&query)
            .await?
            .into_iter()
            .filter(|o| o.metadata.authorize(identity) == Access::Allow)
            .map(|o| summarize(o, self.local_offset))
            .collect();

        debug!(user = %identity.username, hits = summaries.len(), "search");
        if summaries.is_empty() {
            Ok(SearchOutcome::NoResults)
        } else {
            Ok(SearchOutcome::Found(summaries))
        }
    }

    /// Append a plate string to an object's metadata.
    pub async fn update_plate_metadata(
        &self,
        id: &str,
        plate: Option<&str>,
        identity: &Identity,
    ) -> Result<(), ServiceError> {
        if !identity.may_update_metadata() {
            return Err(ServiceError::Forbidden(FORBIDDEN_UPDATE));
        }
        let plate = plate
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or(ServiceError::BadRequest("No plate number provided"))?;
        if !self.store.push_plate(id, plate).await? {
            return Err(ServiceError::NotFound);
        }
        tracing::info!(user = %identity.username, id, plate, "plate added");
        Ok(())
    }
}

fn outcome_label<T>(result: &Result<T, ServiceError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(ServiceError::Forbidden(_)) => "forbidden",
        Err(ServiceError::NotFound) => "not_found",
        Err(ServiceError::DecryptionFailed) => "decrypt_failed",
        Err(_) => "error",
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty()).map(String::from)
}

/// UTC upload window for a local-zone date and optional time range.
///
/// Without a date there is no window. Times only apply when both are given.
pub fn search_window(
    params: &SearchParams,
    offset: FixedOffset,
) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, ServiceError> {
    let Some(date) = params.date.as_deref().filter(|d| !d.is_empty()) else {
        return Ok(None);
    };
    let bad = || ServiceError::BadRequest(BAD_SEARCH);
    let day = NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|_| bad())?;

    let (start, end) = match (params.start_time.as_deref(), params.end_time.as_deref()) {
        (Some(s), Some(e)) if !s.is_empty() && !e.is_empty() => {
            let s = NaiveTime::parse_from_str(s, "%H:%M:%S").map_err(|_| bad())?;
            let e = NaiveTime::parse_from_str(e, "%H:%M:%S").map_err(|_| bad())?;
            (day.and_time(s), day.and_time(e))
        }
        _ => {
            let start = day.and_time(NaiveTime::default());
            (start, start + chrono::Duration::days(1))
        }
    };

    let to_utc = |local: NaiveDateTime| {
        offset
            .from_local_datetime(&local)
            .single()
            .map(|t| t.with_timezone(&Utc))
            .ok_or_else(bad)
    };
    Ok(Some((to_utc(start)?, to_utc(end)?)))
}

fn summarize(obj: StoredObject, offset: FixedOffset) -> ObjectSummary {
    let StoredObject {
        id,
        filename,
        upload_date,
        metadata: ObjectMetadata {
            camera_id,
            plate_numbers,
            ..
        },
        ..
    } = obj;
    ObjectSummary {
        video_id: id,
        filename,
        camera_id,
        upload_date_ist: upload_date
            .with_timezone(&offset)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
        plates_found: plate_numbers,
    }
}
