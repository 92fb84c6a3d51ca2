// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Request handlers and wire types for the REST API.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path, Query, Request, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use tower::ServiceExt;
use tower_http::services::ServeFile;

use super::AppState;
use crate::errors::{sanitize_error_details, ApiResult, UserError};
use crate::files::{DirectoryListing, RootSummary};
use crate::orchestrator::EngineInfo;
use crate::poller::{EngineHealth, HealthSnapshot};
use crate::registry::StatusCounts;
use crate::rpc::EngineOptions;
use crate::types::{DownloadFilter, DownloadStatus, DownloadTask, ExtractionStatus, ExtractionTask};
use crate::utils::{format_bytes, format_speed};

type AppStateRef = State<Arc<AppState>>;

/// Unwrap a JSON body, turning axum's rejection into our error envelope.
fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| UserError::invalid_request(&rejection.body_text(), Some("body")))
}

// =============================================================================
// WIRE TYPES
// =============================================================================

/// A download as returned by the API.
#[derive(Debug, Serialize)]
pub struct DownloadView {
    #[serde(flatten)]
    pub task: DownloadTask,
    pub progress_percent: Option<f64>,
    pub eta_seconds: Option<u64>,
    pub speed_formatted: String,
    pub size_formatted: Option<String>,
}

impl From<DownloadTask> for DownloadView {
    fn from(task: DownloadTask) -> Self {
        Self {
            progress_percent: task.progress_percent(),
            eta_seconds: task.eta_seconds(),
            speed_formatted: format_speed(task.download_speed),
            size_formatted: task.total_bytes.map(format_bytes),
            task,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DownloadsResponse {
    pub downloads: Vec<DownloadView>,
    pub count: usize,
}

#[derive(Debug, Deserialize)]
pub struct AddDownloadRequest {
    /// Mirrors of one file
    #[serde(default, alias = "urls")]
    pub uris: Vec<String>,
    /// Single-URI shorthand
    pub url: Option<String>,
    /// Destination relative to the download root
    #[serde(default, alias = "dir")]
    pub destination: Option<String>,
    #[serde(default)]
    pub options: EngineOptions,
}

#[derive(Debug, Default, Deserialize)]
pub struct RetryRequest {
    #[serde(default)]
    pub fresh: bool,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    /// Comma-separated status filter
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PathQuery {
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct DeleteRequest {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct ExtractRequest {
    pub path: String,
    pub target: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub engine: HealthSnapshot,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: &'static str,
    pub engine: Option<EngineInfo>,
    pub engine_error: Option<String>,
    pub health: HealthSnapshot,
    pub downloads: StatusCounts,
    pub files: RootSummary,
    pub total_size_formatted: String,
    pub download_dir: String,
    pub max_concurrent_downloads: u32,
    pub max_retries: u32,
}

#[derive(Debug, Serialize)]
pub struct ExtractionsResponse {
    pub extractions: Vec<ExtractionTask>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

// =============================================================================
// HEALTH & STATUS
// =============================================================================

pub async fn health_handler(State(state): AppStateRef) -> Response {
    let engine = state.health.snapshot();
    let status_code = match engine.health {
        EngineHealth::AuthFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    let body = HealthResponse {
        status: engine.health.as_str(),
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started_at.elapsed().as_secs(),
        engine,
    };
    (status_code, Json(body)).into_response()
}

pub async fn status_handler(State(state): AppStateRef) -> ApiResult<Json<StatusResponse>> {
    let (engine, engine_error) = match state.orchestrator.engine_status().await {
        Ok(info) => (Some(info), None),
        Err(e) => (None, Some(sanitize_error_details(&e.to_string()))),
    };
    let files = state.files.root_summary().await?;

    Ok(Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        engine,
        engine_error,
        health: state.health.snapshot(),
        downloads: state.orchestrator.registry().status_counts(),
        total_size_formatted: format_bytes(files.total_bytes),
        files,
        download_dir: state.files.root().path().display().to_string(),
        max_concurrent_downloads: state.max_concurrent_downloads,
        max_retries: state.orchestrator.max_retries(),
    }))
}

// =============================================================================
// DOWNLOADS
// =============================================================================

fn parse_filter(raw: Option<&str>) -> ApiResult<DownloadFilter> {
    let mut filter = DownloadFilter::all();
    if let Some(raw) = raw {
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let status: DownloadStatus = part
                .parse()
                .map_err(|e: String| UserError::invalid_request(&e, Some("status")))?;
            filter.statuses.push(status);
        }
    }
    Ok(filter)
}

pub async fn list_downloads(
    State(state): AppStateRef,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<DownloadsResponse>> {
    let filter = parse_filter(query.status.as_deref())?;
    let downloads: Vec<DownloadView> = state
        .orchestrator
        .list_downloads(&filter)
        .into_iter()
        .map(DownloadView::from)
        .collect();
    Ok(Json(DownloadsResponse {
        count: downloads.len(),
        downloads,
    }))
}

pub async fn add_download(
    State(state): AppStateRef,
    payload: Result<Json<AddDownloadRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<DownloadView>)> {
    let request = json_body(payload)?;
    let mut uris = request.uris;
    if let Some(url) = request.url {
        uris.insert(0, url);
    }

    let task = state
        .orchestrator
        .add_download(uris, request.destination.as_deref().unwrap_or(""), request.options)
        .await?;
    Ok((StatusCode::CREATED, Json(task.into())))
}

pub async fn get_download(
    State(state): AppStateRef,
    Path(id): Path<String>,
) -> ApiResult<Json<DownloadView>> {
    Ok(Json(state.orchestrator.get_download(&id)?.into()))
}

pub async fn pause_download(
    State(state): AppStateRef,
    Path(id): Path<String>,
) -> ApiResult<Json<DownloadView>> {
    Ok(Json(state.orchestrator.pause_download(&id).await?.into()))
}

pub async fn resume_download(
    State(state): AppStateRef,
    Path(id): Path<String>,
) -> ApiResult<Json<DownloadView>> {
    Ok(Json(state.orchestrator.resume_download(&id).await?.into()))
}

pub async fn remove_download(
    State(state): AppStateRef,
    Path(id): Path<String>,
) -> ApiResult<Json<DownloadView>> {
    Ok(Json(state.orchestrator.remove_download(&id).await?.into()))
}

pub async fn retry_download(
    State(state): AppStateRef,
    Path(id): Path<String>,
    body: Option<Json<RetryRequest>>,
) -> ApiResult<Json<DownloadView>> {
    let fresh = body.map(|Json(r)| r.fresh).unwrap_or(false);
    Ok(Json(state.orchestrator.retry_download(&id, fresh).await?.into()))
}

// =============================================================================
// FILES
// =============================================================================

pub async fn list_files(
    State(state): AppStateRef,
    Query(query): Query<PathQuery>,
) -> ApiResult<Json<DirectoryListing>> {
    Ok(Json(state.files.list_directory(&query.path).await?))
}

pub async fn delete_file(
    State(state): AppStateRef,
    payload: Result<Json<DeleteRequest>, JsonRejection>,
) -> ApiResult<Json<MessageResponse>> {
    let request = json_body(payload)?;
    state.files.delete_entry(&request.path).await?;
    Ok(Json(MessageResponse {
        message: format!("Deleted {}", request.path),
    }))
}

pub async fn extract_file(
    State(state): AppStateRef,
    payload: Result<Json<ExtractRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<ExtractionTask>)> {
    let request = json_body(payload)?;
    let task = state
        .files
        .extract_archive(&request.path, request.target.as_deref())
        .await?;
    Ok((StatusCode::ACCEPTED, Json(task)))
}

pub async fn download_file(
    State(state): AppStateRef,
    Path(path): Path<String>,
    request: Request,
) -> ApiResult<Response> {
    let absolute = state.files.resolve_file(&path).await?;
    let file_name = absolute
        .file_name()
        .map(|n| n.to_string_lossy().replace('"', ""))
        .unwrap_or_default();

    let response = match ServeFile::new(&absolute).oneshot(request).await {
        Ok(response) => response,
        Err(infallible) => match infallible {},
    };
    let mut response = response.map(Body::new);
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", file_name)) {
        response.headers_mut().insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

// =============================================================================
// EXTRACTIONS
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ExtractionQuery {
    pub status: Option<ExtractionStatus>,
}

pub async fn list_extractions(
    State(state): AppStateRef,
    Query(query): Query<ExtractionQuery>,
) -> Json<ExtractionsResponse> {
    let extractions = state.files.list_extractions(query.status);
    Json(ExtractionsResponse {
        count: extractions.len(),
        extractions,
    })
}

pub async fn get_extraction(
    State(state): AppStateRef,
    Path(id): Path<String>,
) -> ApiResult<Json<ExtractionTask>> {
    Ok(Json(state.files.get_extraction(&id)?))
}
