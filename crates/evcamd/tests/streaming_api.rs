//! End-to-end tests for the streaming API, driven in-process through the
//! axum router with an in-memory object store.

use axum::body::{to_bytes, Body};
use axum::http::header::{CONTENT_TYPE, COOKIE};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use chrono::{Duration, FixedOffset, Utc};
use evcam_core::types::{Identity, ObjectMetadata, Role};
use evcam_crypto::{
    generate_key, seal_frame, ContainerWriter, CryptoError, CryptoResult, GlobalHeader, Key,
    PlaybackSink, VideoBackend, VideoProps,
};
use evcam_storage::{BlobStore, StoredObject};
use evcamd::auth::{Claims, ClaimsVerifier};
use evcamd::http::{router, AppState};
use evcamd::metrics::{HealthState, ServiceMetrics};
use evcamd::stream::{StreamService, STREAM_CHUNK};
use futures::StreamExt;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use opendal::Operator;
use prometheus_client::registry::Registry;
use serde_json::Value;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tower::ServiceExt;

const SECRET: &[u8] = b"integration-secret";

/// Segments starting with `VID` count as video; the output is their payloads.
struct PrefixBackend;

struct PrefixSink(std::fs::File);

impl VideoBackend for PrefixBackend {
    fn probe(&self, segment: &[u8]) -> Option<VideoProps> {
        segment.starts_with(b"VID").then_some(VideoProps {
            fps: 10.0,
            width: 320,
            height: 240,
        })
    }

    fn open_sink(&self, output: &Path, _props: VideoProps) -> CryptoResult<Box<dyn PlaybackSink>> {
        Ok(Box::new(PrefixSink(std::fs::File::create(output)?)))
    }
}

impl PlaybackSink for PrefixSink {
    fn append(&mut self, segment: &[u8]) -> CryptoResult<()> {
        let payload = segment
            .strip_prefix(b"VID")
            .ok_or_else(|| CryptoError::Video("not video".into()))?;
        self.0.write_all(payload)?;
        Ok(())
    }

    fn finish(self: Box<Self>) -> CryptoResult<()> {
        Ok(())
    }
}

struct Harness {
    app: Router,
    service: Arc<StreamService>,
    store: BlobStore,
    key: Arc<Key>,
    scratch: tempfile::TempDir,
}

fn harness() -> Harness {
    let op = Operator::new(opendal::services::Memory::default())
        .expect("memory operator")
        .finish();
    let store = BlobStore::new(op.clone());
    let key = Arc::new(generate_key());
    let scratch = tempfile::tempdir().unwrap();

    let mut registry = Registry::default();
    let metrics = ServiceMetrics::register(&mut registry);
    let service = StreamService::new(
        store.clone(),
        key.clone(),
        Arc::new(PrefixBackend),
        scratch.path().to_path_buf(),
        FixedOffset::east_opt(330 * 60).unwrap(),
        metrics,
    );
    let service = Arc::new(service);
    let state = AppState {
        service: service.clone(),
        verifier: Arc::new(ClaimsVerifier::new(SECRET, "ev_token", 0)),
    };
    let health = HealthState {
        registry: Arc::new(registry),
        operator: op,
    };
    Harness {
        app: router(state, health),
        service,
        store,
        key,
        scratch,
    }
}

fn token(role: Role, cameras: &[&str]) -> String {
    token_expiring(role, cameras, Utc::now() + Duration::hours(2))
}

fn token_expiring(role: Role, cameras: &[&str], exp: chrono::DateTime<Utc>) -> String {
    let claims = Claims {
        username: format!("{role}-user"),
        role,
        assigned_cameras: cameras.iter().map(|c| c.to_string()).collect(),
        exp: exp.timestamp(),
    };
    encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(SECRET)).unwrap()
}

fn identity(role: Role, cameras: &[&str]) -> Identity {
    Identity {
        username: format!("{role}-user"),
        role,
        assigned_cameras: cameras.iter().map(|c| c.to_string()).collect(),
        expiry: Utc::now() + Duration::hours(2),
    }
}

fn meta(cam: &str, plates: &[&str], format: Option<&str>) -> ObjectMetadata {
    ObjectMetadata {
        camera_id: Some(cam.into()),
        plate_numbers: plates.iter().map(|p| p.to_string()).collect(),
        is_encrypted: true,
        container_format: format.map(String::from),
    }
}

async fn send(app: &Router, method: Method, uri: &str, token: Option<&str>, body: Body) -> (StatusCode, Option<String>, Vec<u8>) {
    let mut req = Request::builder().method(method).uri(uri);
    if let Some(t) = token {
        req = req.header(COOKIE, format!("ev_token={t}"));
    }
    let resp = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
    let status = resp.status();
    let content_type = resp
        .headers()
        .get(CONTENT_TYPE)
        .map(|v| v.to_str().unwrap().to_string());
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, content_type, bytes.to_vec())
}

async fn get(app: &Router, uri: &str, token: Option<&str>) -> (StatusCode, Option<String>, Vec<u8>) {
    send(app, Method::GET, uri, token, Body::empty()).await
}

fn json(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).unwrap()
}

fn container_bytes(key: &Key, segments: &[&[u8]]) -> Vec<u8> {
    let dir = tempfile::tempdir().unwrap();
    let mut writer = ContainerWriter::create_in(dir.path(), &GlobalHeader::new(Some("CAM_01".into()))).unwrap();
    for s in segments {
        writer.append_chunk(s, key).unwrap();
    }
    std::fs::read(writer.finish().unwrap()).unwrap()
}

/// Write a record with a chosen upload time, as an earlier deployment would have.
async fn put_with_date(store: &BlobStore, id: &str, cam: &str, uploaded: &str) {
    let record = StoredObject {
        id: id.into(),
        filename: format!("{id}.WattLagGyi"),
        length: 1,
        content_type: "application/octet-stream".into(),
        upload_date: uploaded.parse().unwrap(),
        metadata: meta(cam, &["KA01AB1234"], None),
    };
    let op = store.operator();
    op.write(&format!("objects/{id}"), vec![0u8]).await.unwrap();
    op.write(&format!("meta/{id}.json"), serde_json::to_vec(&record).unwrap())
        .await
        .unwrap();
}

fn scratch_is_empty(h: &Harness) -> bool {
    std::fs::read_dir(h.scratch.path()).unwrap().next().is_none()
}

// ── Authentication ───────────────────────────────────────────────────────

#[tokio::test]
async fn raw_requires_cookie() {
    let h = harness();
    let stored = h.store.put("a", "x", b"bytes".to_vec(), meta("CAM_01", &[], None)).await.unwrap();

    let (status, _, body) = get(&h.app, &format!("/video/{}", stored.id), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json(&body)["error"], "Authentication required");
}

#[tokio::test]
async fn expired_token_rejected() {
    let h = harness();
    let stale = token_expiring(Role::Admin, &[], Utc::now() - Duration::hours(1));

    let (status, _, body) = get(&h.app, "/search", Some(&stale)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json(&body)["error"], "Token expired");
}

#[tokio::test]
async fn me_reports_session_without_failing() {
    let h = harness();

    let (status, _, body) = get(&h.app, "/me", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body)["authenticated"], false);

    let (status, _, body) = get(&h.app, "/me", Some(&token(Role::Uploader, &["CAM_01"]))).await;
    assert_eq!(status, StatusCode::OK);
    let body = json(&body);
    assert_eq!(body["authenticated"], true);
    assert_eq!(body["user"]["role"], "uploader");
    assert_eq!(body["user"]["assigned_cameras"][0], "CAM_01");
}

// ── Raw streaming ────────────────────────────────────────────────────────

#[tokio::test]
async fn raw_forbidden_for_unassigned_camera() {
    let h = harness();
    let stored = h.store.put("a", "x", b"bytes".to_vec(), meta("CAM_02", &[], None)).await.unwrap();

    let (status, _, body) = get(&h.app, &format!("/video/{}", stored.id), Some(&token(Role::Viewer, &["CAM_01"]))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(json(&body)["error"], "Not authorized to view this camera's video");
}

#[tokio::test]
async fn raw_admin_sees_any_camera() {
    let h = harness();
    let payload = vec![0x5Au8; 200 * 1024];
    let stored = h.store.put("a", "x", payload.clone(), meta("CAM_99", &[], None)).await.unwrap();

    let (status, content_type, body) = get(&h.app, &format!("/video/{}", stored.id), Some(&token(Role::Admin, &[]))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some("application/octet-stream"));
    assert_eq!(body, payload);
}

#[tokio::test]
async fn raw_stream_yields_bounded_pieces() {
    let h = harness();
    let payload: Vec<u8> = (0..300 * 1024u32).map(|i| (i % 251) as u8).collect();
    let stored = h.store.put("a", "x", payload.clone(), meta("CAM_01", &[], None)).await.unwrap();

    let pieces: Vec<_> = h
        .service
        .stream_raw(&stored.id, &identity(Role::Viewer, &["CAM_01"]))
        .await
        .unwrap()
        .map(|p| p.unwrap())
        .collect()
        .await;
    assert!(pieces.len() >= 5);
    assert!(pieces.iter().all(|p| p.len() <= STREAM_CHUNK));
    assert_eq!(pieces.concat(), payload);
}

#[tokio::test]
async fn raw_unknown_id_not_found() {
    let h = harness();
    let viewer = token(Role::Admin, &[]);

    for id in [uuid::Uuid::new_v4().to_string(), "not-an-id".to_string()] {
        let (status, _, body) = get(&h.app, &format!("/video/{id}"), Some(&viewer)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json(&body)["error"], "Video not found");
    }
}

// ── Decrypted streaming ──────────────────────────────────────────────────

#[tokio::test]
async fn decrypted_single_frame_streams_plaintext() {
    let h = harness();
    let blob = seal_frame(b"plain mp4 bytes", &h.key).unwrap();
    let stored = h.store.put("a", "x", blob, meta("CAM_01", &[], Some("single-frame"))).await.unwrap();

    let (status, content_type, body) =
        get(&h.app, &format!("/video/decrypted/{}", stored.id), Some(&token(Role::Viewer, &["CAM_01"]))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some("video/mp4"));
    assert_eq!(body, b"plain mp4 bytes");
    assert!(scratch_is_empty(&h), "scratch file removed after streaming");
}

#[tokio::test]
async fn decrypted_scratch_removed_when_client_goes_away() {
    let h = harness();
    let plaintext: Vec<u8> = (0..300 * 1024u32).map(|i| (i % 251) as u8).collect();
    let blob = seal_frame(&plaintext, &h.key).unwrap();
    let stored = h.store.put("a", "x", blob, meta("CAM_01", &[], Some("single-frame"))).await.unwrap();

    let mut body = h
        .service
        .stream_decrypted(&stored.id, &identity(Role::Viewer, &["CAM_01"]))
        .await
        .unwrap();
    let first = body.next().await.unwrap().unwrap();
    assert!(!first.is_empty() && first.len() <= STREAM_CHUNK);
    assert_eq!(&first[..], &plaintext[..first.len()]);
    assert!(!scratch_is_empty(&h), "scratch file held while streaming");

    drop(body);
    assert!(scratch_is_empty(&h), "scratch file removed after early drop");
}

#[tokio::test]
async fn decrypted_container_reassembles_segments() {
    let h = harness();
    let blob = container_bytes(&h.key, &[b"junk", b"VIDone,", b"VIDtwo"]);
    let stored = h.store.put("c", "x", blob, meta("CAM_01", &[], Some("WattLagGyi"))).await.unwrap();

    let (status, _, body) = get(&h.app, &format!("/video/decrypted/{}", stored.id), Some(&token(Role::Admin, &[]))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"one,two");
    assert!(scratch_is_empty(&h));
}

#[tokio::test]
async fn decrypted_untagged_container_uses_fallback() {
    let h = harness();
    let blob = container_bytes(&h.key, &[b"VIDlegacy"]);
    let stored = h.store.put("c", "x", blob, meta("CAM_01", &[], None)).await.unwrap();

    let (status, _, body) = get(&h.app, &format!("/video/decrypted/{}", stored.id), Some(&token(Role::Admin, &[]))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"legacy");
}

#[tokio::test]
async fn decrypted_garbage_is_decryption_failure() {
    let h = harness();
    let stored = h.store.put("g", "x", vec![0xA5u8; 512], meta("CAM_01", &[], None)).await.unwrap();

    let (status, _, body) = get(&h.app, &format!("/video/decrypted/{}", stored.id), Some(&token(Role::Admin, &[]))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json(&body)["error"], "Decryption failed");
    assert!(scratch_is_empty(&h));
}

#[tokio::test]
async fn decrypted_forbidden_before_any_decryption() {
    let h = harness();
    let blob = seal_frame(b"secret footage", &h.key).unwrap();
    let stored = h.store.put("a", "x", blob, meta("CAM_07", &[], Some("single-frame"))).await.unwrap();

    let (status, _, body) =
        get(&h.app, &format!("/video/decrypted/{}", stored.id), Some(&token(Role::Uploader, &["CAM_01"]))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(!String::from_utf8_lossy(&body).contains("secret footage"));
}

// ── Search ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn search_by_date_uses_local_day_window() {
    let h = harness();
    // 2024-03-01 in +05:30 spans 2024-02-29T18:30Z .. 2024-03-01T18:30Z
    let inside = uuid::Uuid::new_v4().to_string();
    let before = uuid::Uuid::new_v4().to_string();
    let after = uuid::Uuid::new_v4().to_string();
    put_with_date(&h.store, &inside, "CAM_01", "2024-02-29T19:00:00Z").await;
    put_with_date(&h.store, &before, "CAM_01", "2024-02-29T18:29:59Z").await;
    put_with_date(&h.store, &after, "CAM_01", "2024-03-01T18:30:00Z").await;

    let (status, _, body) = get(&h.app, "/search?date=2024-03-01", Some(&token(Role::Admin, &[]))).await;
    assert_eq!(status, StatusCode::OK);
    let rows = json(&body);
    let rows = rows.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["video_id"], inside.as_str());
    assert_eq!(rows[0]["upload_date_ist"], "2024-03-01 00:30:00");
    assert_eq!(rows[0]["plates_found"][0], "KA01AB1234");
}

#[tokio::test]
async fn search_time_range() {
    let h = harness();
    let id = uuid::Uuid::new_v4().to_string();
    put_with_date(&h.store, &id, "CAM_01", "2024-03-01T04:00:00Z").await; // 09:30 local
    let admin = token(Role::Admin, &[]);

    let (status, _, _) = get(&h.app, "/search?date=2024-03-01&start_time=09:00:00&end_time=10:00:00", Some(&admin)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = get(&h.app, "/search?date=2024-03-01&start_time=10:00:00&end_time=11:00:00", Some(&admin)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json(&body)["message"], "No results found");
}

#[tokio::test]
async fn search_malformed_date_is_bad_request() {
    let h = harness();
    let (status, _, body) = get(&h.app, "/search?date=03/01/2024", Some(&token(Role::Admin, &[]))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json(&body)["error"], "Invalid format. Use Date: YYYY-MM-DD, Time: HH:MM:SS");
}

#[tokio::test]
async fn search_by_plate_hides_other_cameras() {
    let h = harness();
    h.store.put("mine", "x", b"a".to_vec(), meta("CAM_01", &["KA01AB1234"], None)).await.unwrap();
    h.store.put("theirs", "x", b"b".to_vec(), meta("CAM_02", &["KA01AB9999"], None)).await.unwrap();

    let (status, _, body) = get(&h.app, "/search?plate=KA01", Some(&token(Role::Viewer, &["CAM_01"]))).await;
    assert_eq!(status, StatusCode::OK);
    let rows = json(&body);
    assert_eq!(rows.as_array().unwrap().len(), 1);
    assert_eq!(rows[0]["filename"], "mine");
    assert_eq!(rows[0]["camera_id"], "CAM_01");
}

// ── Plate updates ────────────────────────────────────────────────────────

async fn post_plate(h: &Harness, id: &str, token: &str, body: &str) -> (StatusCode, Value) {
    let (status, _, bytes) = send(
        &h.app,
        Method::POST,
        &format!("/video/{id}/plates"),
        Some(token),
        Body::from(body.to_string()),
    )
    .await;
    (status, json(&bytes))
}

#[tokio::test]
async fn plate_update_requires_uploader_or_admin() {
    let h = harness();
    let stored = h.store.put("a", "x", b"a".to_vec(), meta("CAM_01", &[], None)).await.unwrap();

    let (status, body) = post_plate(&h, &stored.id, &token(Role::Viewer, &["CAM_01"]), r#"{"plate_numbers":"X"}"#).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "No permission to update metadata");
}

#[tokio::test]
async fn plate_update_validates_and_appends() {
    let h = harness();
    let stored = h.store.put("a", "x", b"a".to_vec(), meta("CAM_01", &["FIRST"], None)).await.unwrap();
    let uploader = token(Role::Uploader, &["CAM_01"]);

    let (status, body) = post_plate(&h, &stored.id, &uploader, "{}").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "No plate number provided");

    let (status, _) = post_plate(&h, &stored.id, &uploader, "").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = post_plate(&h, &uuid::Uuid::new_v4().to_string(), &uploader, r#"{"plate_numbers":"X"}"#).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Video not found");

    let (status, body) = post_plate(&h, &stored.id, &uploader, r#"{"plate_numbers":"TN09ZZ0001"}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Plate added to metadata");

    let record = h.store.record(&stored.id).await.unwrap();
    assert_eq!(record.metadata.plate_numbers, vec!["FIRST", "TN09ZZ0001"]);
}

// ── Probes ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn probes_and_metrics() {
    let h = harness();
    let stored = h.store.put("a", "x", b"a".to_vec(), meta("CAM_01", &[], None)).await.unwrap();
    get(&h.app, &format!("/video/{}", stored.id), Some(&token(Role::Admin, &[]))).await;

    assert_eq!(get(&h.app, "/healthz", None).await.0, StatusCode::OK);
    assert_eq!(get(&h.app, "/readyz", None).await.0, StatusCode::OK);

    let (status, _, body) = get(&h.app, "/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains(r#"evcam_stream_requests_total{kind="raw",outcome="ok"} 1"#));
}
