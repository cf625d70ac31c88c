use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use axum::{
    Json, Router,
    body::Body,
    extract::{Path as RoutePath, State},
    http::{
        HeaderMap, HeaderValue,
        header::{CONTENT_DISPOSITION, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tower_http::services::ServeDir;

use crate::{
    download::{DownloadCoordinator, FormatKind},
    error::ApiError,
    fetch::FetchError,
    progress::{ProgressRecord, ProgressStore},
};

#[derive(Clone)]
pub struct AppState {
    pub progress: Arc<ProgressStore>,
    pub coordinator: Arc<DownloadCoordinator>,
    pub downloads_dir: PathBuf,
}

pub fn router(state: AppState, frontend_dir: PathBuf) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/downloads/{filename}", get(serve_download))
        .route("/progress", post(check_progress))
        .route("/download", post(start_download))
        .fallback_service(ServeDir::new(frontend_dir))
        .with_state(state)
}

async fn home() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "message": "YTCOMET Backend is Running!",
        "status": "success",
    }))
}

#[derive(Debug, Deserialize)]
struct ProgressRequest {
    #[serde(default)]
    url: String,
}

async fn check_progress(
    State(state): State<AppState>,
    Json(payload): Json<ProgressRequest>,
) -> Result<Json<ProgressRecord>, ApiError> {
    let url = payload.url.trim();
    if url.is_empty() {
        return Err(ApiError::bad_request("No URL provided"));
    }
    Ok(Json(state.progress.get(url)))
}

#[derive(Debug, Deserialize)]
struct DownloadRequest {
    #[serde(default)]
    url: String,
    format: FormatKind,
    quality: String,
}

#[derive(Debug, Serialize)]
struct PlaylistResponse {
    message: &'static str,
    files: Vec<String>,
}

/// Blocks for the full download, then streams the artifact back. Playlist
/// inputs answer with the produced file names instead of a stream.
async fn start_download(
    State(state): State<AppState>,
    Json(payload): Json<DownloadRequest>,
) -> Result<Response, ApiError> {
    let url = payload.url.trim();
    if url.is_empty() {
        return Err(ApiError::bad_request("No URL provided"));
    }

    let artifacts = state
        .coordinator
        .run_job(url, payload.format, &payload.quality)
        .await
        .map_err(fetch_error_response)?;

    if artifacts.len() > 1 {
        let files = artifacts
            .iter()
            .filter_map(|path| path.file_name().and_then(|name| name.to_str()))
            .map(ToString::to_string)
            .collect();
        return Ok(Json(PlaylistResponse {
            message: "Playlist downloaded!",
            files,
        })
        .into_response());
    }

    let artifact = artifacts
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::not_found("File not found!"))?;
    stream_attachment(&artifact, "application/octet-stream").await
}

async fn serve_download(
    State(state): State<AppState>,
    RoutePath(filename): RoutePath<String>,
) -> Result<Response, ApiError> {
    // The downloads directory is flat; anything that walks out of it is
    // treated as absent.
    if filename.contains(['/', '\\']) || filename.contains("..") {
        return Err(ApiError::not_found("File not found!"));
    }

    let path = state.downloads_dir.join(&filename);
    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return Err(ApiError::not_found("File not found!"));
    }

    stream_attachment(&path, content_type_for_filename(&filename)).await
}

fn fetch_error_response(error: FetchError) -> ApiError {
    match error {
        FetchError::NoArtifacts => ApiError::not_found(error.to_string()),
        other => ApiError::internal(other.to_string()),
    }
}

async fn stream_attachment(path: &Path, content_type: &'static str) -> Result<Response, ApiError> {
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("download.bin")
        .to_string();

    let file = tokio::fs::File::open(path)
        .await
        .map_err(|_| ApiError::not_found("File not found!"))?;
    let body = Body::from_stream(ReaderStream::new(file));

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&filename))
            .map_err(|_| ApiError::internal("could not build the download header"))?,
    );

    Ok((headers, body).into_response())
}

fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let mut sanitized = String::with_capacity(value.len());

    for character in value.chars() {
        if character.is_ascii_alphanumeric()
            || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
        {
            sanitized.push(character);
        } else {
            sanitized.push('_');
        }
    }

    let compact = sanitized.trim();
    if compact.is_empty() {
        "download.bin".to_string()
    } else {
        compact.to_string()
    }
}

fn content_type_for_filename(filename: &str) -> &'static str {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "opus" => "audio/ogg",
        "wav" => "audio/wav",
        _ => "application/octet-stream",
    }
}
