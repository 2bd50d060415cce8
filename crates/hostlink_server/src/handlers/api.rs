use crate::auth::RequireToken;
use crate::error::ApiError;
use axum::{
    Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Query, State, multipart::Field},
    http::{HeaderValue, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use hostlink_core::{DirListing, RelayError, RelayResult, RouterHandle, Sandbox, UploadTarget};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

/// Shared state for the file API
#[derive(Clone)]
pub struct ApiState {
    pub sandbox: Arc<Sandbox>,
    pub relay: RouterHandle,
    /// Per-file upload cap in bytes.
    pub max_file_size: u64,
}

#[derive(Debug, Deserialize)]
pub struct DirQuery {
    pub path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub dest: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SavedFile {
    pub file: String,
    pub size: u64,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub saved: Vec<SavedFile>,
}

/// Server status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub version: String,
    /// Devices currently authenticated on the relay.
    pub devices: usize,
}

pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/dir", get(list_dir))
        .route("/download", get(download))
        .route(
            "/upload",
            post(upload).layer(DefaultBodyLimit::disable()),
        )
        .with_state(state)
}

/// Run a blocking sandbox operation off the async threads.
async fn blocking<T, F>(op: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> RelayResult<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(op).await {
        Ok(result) => result.map_err(ApiError::from),
        Err(err) => {
            error!("Sandbox task failed: {}", err);
            Err(ApiError::Internal)
        }
    }
}

/// GET /api/status - Relay status
async fn get_status(State(state): State<ApiState>) -> impl IntoResponse {
    let devices = match state.relay.snapshot().await {
        Some(snapshot) => snapshot.devices.len(),
        None => 0,
    };
    Json(StatusResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        devices,
    })
}

/// GET /api/dir?path= - List a sandbox directory
async fn list_dir(
    State(state): State<ApiState>,
    _auth: RequireToken,
    Query(query): Query<DirQuery>,
) -> Result<Json<DirListing>, ApiError> {
    let path = query
        .path
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| ".".to_string());
    let sandbox = state.sandbox.clone();
    let listing = blocking(move || sandbox.list_directory(&path)).await?;
    Ok(Json(listing))
}

/// GET /api/download?path= - Stream a sandbox file
async fn download(
    State(state): State<ApiState>,
    _auth: RequireToken,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, ApiError> {
    let path = query
        .path
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ApiError::BadRequest("path required".to_string()))?;
    let sandbox = state.sandbox.clone();
    let target = blocking(move || sandbox.open_file(&path)).await?;

    let file = tokio::fs::File::open(&target.path)
        .await
        .map_err(|e| RelayError::io("open download", &e))?;
    info!("Download: {} ({} bytes)", target.file_name, target.size);

    let stream = tokio_util::io::ReaderStream::new(file);
    let body = Body::from_stream(stream);

    let disposition = format!(
        "attachment; filename=\"{}\"",
        target.file_name.replace(['"', '\\', '\r', '\n'], "_")
    );
    let disposition = HeaderValue::from_str(&disposition)
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"));

    Ok((
        [
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            ),
            (header::CONTENT_LENGTH, HeaderValue::from(target.size)),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

/// POST /api/upload?dest= - Save multipart files into a sandbox directory
async fn upload(
    State(state): State<ApiState>,
    _auth: RequireToken,
    Query(query): Query<UploadQuery>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let dest = query
        .dest
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| ".".to_string());
    let sandbox = state.sandbox.clone();
    let directory = blocking(move || sandbox.ensure_directory(&dest)).await?;

    let mut saved = Vec::new();
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                warn!("Malformed multipart upload: {}", err);
                return Err(ApiError::BadRequest(err.body_text()));
            }
        };
        // Plain form fields carry no file.
        let Some(file_name) = field.file_name().map(str::to_string) else {
            debug!("Skipping non-file field {:?}", field.name());
            continue;
        };

        let sandbox = state.sandbox.clone();
        let (dir, name) = (directory.clone(), file_name.clone());
        let target = blocking(move || sandbox.upload_target(&dir, &name)).await?;
        let size = save_field(field, &target, state.max_file_size).await?;
        info!("Upload: saved {} ({} bytes)", file_name, size);
        saved.push(SavedFile {
            file: file_name,
            size,
        });
    }

    Ok(Json(UploadResponse { saved }))
}

/// Stream one multipart field to `target`, enforcing the size cap.
///
/// Bytes land in the exclusively created partial file and are renamed into
/// place only once complete; the partial file is removed on any failure.
async fn save_field(
    mut field: Field<'_>,
    target: &UploadTarget,
    max_size: u64,
) -> Result<u64, ApiError> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&target.partial)
        .await
        .map_err(|e| RelayError::io("create upload", &e))?;

    let mut size = 0u64;
    let outcome: Result<(), ApiError> = async {
        while let Some(chunk) = field.chunk().await.map_err(|err| {
            warn!("Upload stream read failed: {}", err);
            ApiError::BadRequest(err.body_text())
        })? {
            size += chunk.len() as u64;
            if size > max_size {
                return Err(RelayError::capacity("File too large").into());
            }
            file.write_all(&chunk)
                .await
                .map_err(|e| RelayError::io("write upload", &e))?;
        }
        file.flush()
            .await
            .map_err(|e| RelayError::io("flush upload", &e))?;
        drop(file);
        tokio::fs::rename(&target.partial, &target.path)
            .await
            .map_err(|e| RelayError::io("rename upload", &e))?;
        Ok(())
    }
    .await;

    if let Err(err) = outcome {
        if let Err(e) = tokio::fs::remove_file(&target.partial).await {
            debug!("Failed to remove partial upload: {}", e);
        }
        return Err(err);
    }
    Ok(size)
}
