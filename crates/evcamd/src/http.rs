//! HTTP surface of the streaming service.
//!
//! Routes:
//!   GET  /video/{id}             stored bytes, `application/octet-stream`
//!   GET  /video/decrypted/{id}   decrypted footage, `video/mp4`
//!   GET  /search                 `?plate=&date=&camera_id=&start_time=&end_time=`
//!   POST /video/{id}/plates      `{"plate_numbers": "..."}`
//!   GET  /me                     claims of the current cookie, never 401
//! plus the probe and metrics routes from [`crate::metrics::router`].

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::auth::{ClaimsVerifier, Viewer};
use crate::error::ServiceError;
use crate::metrics::{self, HealthState};
use crate::stream::{ByteStream, SearchOutcome, SearchParams, StreamService};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<StreamService>,
    pub verifier: Arc<ClaimsVerifier>,
}

pub fn router(state: AppState, health: HealthState) -> Router {
    Router::new()
        .route("/video/{id}", get(raw_video))
        .route("/video/decrypted/{id}", get(decrypted_video))
        .route("/video/{id}/plates", post(update_plates))
        .route("/search", get(search))
        .route("/me", get(me))
        .with_state(state)
        .merge(metrics::router(health))
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    addr: &str,
    app: Router,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("http bind {addr}: {e}"))?;
    tracing::info!(addr, "http: listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| anyhow::anyhow!("http server: {e}"))
}

fn stream_response(content_type: &'static str, body: ByteStream) -> Response {
    ([(CONTENT_TYPE, content_type)], Body::from_stream(body)).into_response()
}

async fn raw_video(
    State(state): State<AppState>,
    Viewer(identity): Viewer,
    Path(id): Path<String>,
) -> Result<Response, ServiceError> {
    let body = state.service.stream_raw(&id, &identity).await?;
    Ok(stream_response("application/octet-stream", body))
}

async fn decrypted_video(
    State(state): State<AppState>,
    Viewer(identity): Viewer,
    Path(id): Path<String>,
) -> Result<Response, ServiceError> {
    let body = state.service.stream_decrypted(&id, &identity).await?;
    Ok(stream_response("video/mp4", body))
}

async fn search(
    State(state): State<AppState>,
    Viewer(identity): Viewer,
    Query(params): Query<SearchParams>,
) -> Result<Response, ServiceError> {
    Ok(match state.service.search(&params, &identity).await? {
        SearchOutcome::Found(rows) => Json(rows).into_response(),
        SearchOutcome::NoResults => (
            StatusCode::NOT_FOUND,
            Json(json!({ "message": "No results found" })),
        )
            .into_response(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct PlateUpdate {
    #[serde(default)]
    plate_numbers: Option<String>,
}

async fn update_plates(
    State(state): State<AppState>,
    Viewer(identity): Viewer,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Response, ServiceError> {
    // A missing or malformed body is treated as "no plate given"
    let update: PlateUpdate = serde_json::from_slice(&body).unwrap_or_default();
    state
        .service
        .update_plate_metadata(&id, update.plate_numbers.as_deref(), &identity)
        .await?;
    Ok(Json(json!({ "message": "Plate added to metadata" })).into_response())
}

async fn me(State(state): State<AppState>, headers: HeaderMap) -> Response {
    match state.verifier.current_claims(&headers) {
        Some(claims) => Json(json!({ "authenticated": true, "user": claims })).into_response(),
        None => Json(json!({ "authenticated": false })).into_response(),
    }
}
