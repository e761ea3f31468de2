/**
 * PROCMON REST API - HTTP surface of the ingestion service
 *
 * ROUTES :
 * - POST   /api/v1/process-snapshots/          ingestion (X-API-Key)
 * - GET    /api/v1/process-snapshots/latest/   latest snapshot of a host
 * - GET    /api/v1/process-snapshots/history/  newest-first history
 * - GET    /api/v1/hosts/                      known hostnames
 * - POST   /api/v1/hosts/rotate-key/           issue a host key (X-Admin-Key)
 * - DELETE /api/v1/hosts/{hostname}            drop a host and its data (X-Admin-Key)
 * - GET    /ws/processes/{hostname}/           live snapshots over WebSocket
 *
 * INGESTION ORDER :
 * validate payload -> resolve host + check key -> commit -> publish -> 201
 * Publishing happens strictly after the commit and cannot fail the request.
 */

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{extract::Path, Json, Router};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::ApiError;
use crate::keys::RotatedKey;
use crate::models::{Snapshot, SnapshotIn};
use crate::state::AppState;
use crate::store::DEFAULT_HISTORY_LIMIT;
use crate::ws;

const API_KEY_HEADER: &str = "x-api-key";
const ADMIN_KEY_HEADER: &str = "x-admin-key";

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/v1/process-snapshots/", post(ingest))
        .route("/api/v1/process-snapshots/latest/", get(latest))
        .route("/api/v1/process-snapshots/history/", get(history))
        .route("/api/v1/hosts/", get(list_hosts))
        .route("/api/v1/hosts/rotate-key/", post(rotate_key))
        .route("/api/v1/hosts/{hostname}", delete(delete_host))
        .route("/ws/processes/{hostname}/", get(ws::subscribe))
        .with_state(app_state)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn required_hostname(params: &HashMap<String, String>) -> Result<&str, ApiError> {
    params
        .get("hostname")
        .map(String::as_str)
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ApiError::Validation("hostname query param required".into()))
}

// POST /api/v1/process-snapshots/
async fn ingest(State(app): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Response, ApiError> {
    let payload = SnapshotIn::parse(&body)?;
    let admission = app
        .gate
        .admit(&payload.hostname, header_str(&headers, API_KEY_HEADER))
        .await?;

    let snapshot = app.store.ingest(&admission.host, &payload.processes).await?;
    info!(
        hostname = %snapshot.hostname,
        snapshot_id = snapshot.id,
        processes = snapshot.processes.len(),
        credential = ?admission.credential,
        "Snapshot ingested"
    );

    Ok(publish_and_respond(&app, snapshot))
}

fn publish_and_respond(app: &AppState, snapshot: Snapshot) -> Response {
    match serde_json::to_string(&snapshot) {
        Ok(body) => {
            app.hub.publish(&snapshot.hostname, Arc::from(body.as_str()));
            (StatusCode::CREATED, [(header::CONTENT_TYPE, "application/json")], body).into_response()
        }
        Err(e) => {
            warn!(hostname = %snapshot.hostname, error = %e, "Snapshot not published: serialization failed");
            (StatusCode::CREATED, Json(snapshot)).into_response()
        }
    }
}

// GET /api/v1/process-snapshots/latest/?hostname=
async fn latest(
    State(app): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Snapshot>, ApiError> {
    let hostname = required_hostname(&params)?;
    Ok(Json(app.store.latest(hostname).await?))
}

// GET /api/v1/process-snapshots/history/?hostname=&limit=
async fn history(
    State(app): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Vec<Snapshot>>, ApiError> {
    let hostname = required_hostname(&params)?;
    let limit = match params.get("limit") {
        Some(raw) => raw
            .parse::<u32>()
            .map_err(|_| ApiError::Validation(format!("limit must be a non-negative integer, got {raw:?}")))?,
        None => DEFAULT_HISTORY_LIMIT,
    };
    Ok(Json(app.store.history(hostname, limit).await?))
}

// GET /api/v1/hosts/
async fn list_hosts(State(app): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let hosts = app.store.list_hosts().await?;
    Ok(Json(serde_json::json!({ "hosts": hosts })))
}

#[derive(Debug, Deserialize)]
struct RotateRequest {
    hostname: Option<String>,
}

// POST /api/v1/hosts/rotate-key/
async fn rotate_key(State(app): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<RotatedKey>, ApiError> {
    let admin = header_str(&headers, ADMIN_KEY_HEADER);
    app.keys.authorize(admin)?;

    let hostname = serde_json::from_slice::<RotateRequest>(&body)
        .ok()
        .and_then(|r| r.hostname)
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ApiError::Validation("hostname required".into()))?;

    Ok(Json(app.keys.rotate(admin, &hostname).await?))
}

// DELETE /api/v1/hosts/{hostname}
async fn delete_host(
    State(app): State<AppState>,
    headers: HeaderMap,
    Path(hostname): Path<String>,
) -> Result<StatusCode, ApiError> {
    app.keys.delete_host(header_str(&headers, ADMIN_KEY_HEADER), &hostname).await?;
    Ok(StatusCode::NO_CONTENT)
}
