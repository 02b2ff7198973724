//! Asset transfer HTTP server
//!
//! Loopback-only bridge for binary payloads that are too large for the
//! socket channel.
//!
//! ```text
//! POST /assets/{hash}  - upload bytes (idempotent per hash)
//! GET  /assets/{hash}  - download bytes
//! ```

use super::store::{is_valid_hash, AssetRecord, AssetStore, RemoveOptions};
use crate::error::RelayError;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use futures_util::StreamExt;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

const DEFAULT_MIME: &str = "application/octet-stream";
const CACHE_FOREVER: &str = "public, max-age=31536000, immutable";
const WIDTH_HEADER: &str = "x-asset-width";
const HEIGHT_HEADER: &str = "x-asset-height";

/// Shared state for the asset routes
#[derive(Clone)]
pub struct AssetServerState {
    pub store: Arc<AssetStore>,
    pub max_asset_bytes: u64,
}

/// Build the asset router.
pub fn router(state: AssetServerState) -> Router {
    Router::new()
        .route("/assets/{hash}", get(download_handler).post(upload_handler))
        .with_state(state)
}

/// A running asset server.
pub struct AssetServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl AssetServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Base URL, e.g. `http://127.0.0.1:51234`
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Stop accepting requests; in-flight requests finish.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Wait for the server task to exit.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            log::warn!("Asset server task ended abnormally: {}", e);
        }
    }
}

/// Start the asset server on an ephemeral loopback port.
pub async fn start_asset_server(
    state: AssetServerState,
    shutdown: CancellationToken,
) -> Result<AssetServer, RelayError> {
    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .map_err(RelayError::AssetServer)?;
    let addr = listener.local_addr().map_err(RelayError::AssetServer)?;

    let app = router(state);
    let token = shutdown.clone();
    let task = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await;
        if let Err(e) = result {
            log::error!("Asset server error: {}", e);
        }
    });

    log::info!("Asset server listening on http://{}", addr);
    Ok(AssetServer {
        addr,
        shutdown,
        task,
    })
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn header_u32(headers: &HeaderMap, name: &str) -> Option<u32> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

// ============================================================================
// Upload
// ============================================================================

/// POST /assets/{hash}
async fn upload_handler(
    State(state): State<AssetServerState>,
    Path(hash): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    if !is_valid_hash(&hash) {
        return error_response(StatusCode::BAD_REQUEST, format!("Invalid asset hash '{}'", hash));
    }

    // Concurrent uploads of one hash queue here; later ones see the stored blob
    let slot = state.store.upload_slot(&hash);
    let response = {
        let _guard = slot.lock().await;
        store_upload(&state, hash.clone(), &headers, body).await
    };
    drop(slot);
    state.store.release_upload_slot(&hash);
    response
}

async fn store_upload(
    state: &AssetServerState,
    hash: String,
    headers: &HeaderMap,
    body: Body,
) -> Response {
    if state.store.file_present(&hash) {
        state.store.touch(&hash);
        let size = state.store.get(&hash).map(|r| r.size).unwrap_or(0);
        log::debug!("Asset {} already cached, skipping write", hash);
        return (
            StatusCode::OK,
            Json(json!({ "hash": hash, "size": size, "stored": false })),
        )
            .into_response();
    }

    let declared_len = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared_len.is_some_and(|len| len > state.max_asset_bytes) {
        return error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("Asset exceeds {} bytes", state.max_asset_bytes),
        );
    }

    let mime_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_MIME)
        .to_string();

    let final_path = state.store.path_for(&hash);
    let part_path = state.store.part_path_for(&hash);

    let size = match write_body(&part_path, body, state.max_asset_bytes).await {
        Ok(size) => size,
        Err((status, message)) => {
            let _ = tokio::fs::remove_file(&part_path).await;
            log::warn!("Upload of asset {} failed: {}", hash, message);
            return error_response(status, message);
        }
    };

    if let Err(e) = tokio::fs::rename(&part_path, &final_path).await {
        let _ = tokio::fs::remove_file(&part_path).await;
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to store asset: {}", e),
        );
    }

    state.store.upsert(AssetRecord {
        hash: hash.clone(),
        file_path: final_path,
        mime_type,
        size,
        last_touched: Utc::now(),
        width: header_u32(headers, WIDTH_HEADER),
        height: header_u32(headers, HEIGHT_HEADER),
    });

    log::info!("Stored asset {} ({} bytes)", hash, size);
    (
        StatusCode::CREATED,
        Json(json!({ "hash": hash, "size": size, "stored": true })),
    )
        .into_response()
}

/// Stream the request body into `path`, counting bytes.
async fn write_body(
    path: &std::path::Path,
    body: Body,
    max_bytes: u64,
) -> Result<u64, (StatusCode, String)> {
    let internal = |e: std::io::Error| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string());

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(internal)?;
    }
    let mut file = tokio::fs::File::create(path).await.map_err(internal)?;

    let mut size: u64 = 0;
    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| (StatusCode::BAD_REQUEST, format!("Body read error: {}", e)))?;
        size += chunk.len() as u64;
        if size > max_bytes {
            return Err((
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("Asset exceeds {} bytes", max_bytes),
            ));
        }
        file.write_all(&chunk).await.map_err(internal)?;
    }

    file.flush().await.map_err(internal)?;
    Ok(size)
}

// ============================================================================
// Download
// ============================================================================

/// GET /assets/{hash}
async fn download_handler(
    State(state): State<AssetServerState>,
    Path(hash): Path<String>,
) -> Response {
    if !is_valid_hash(&hash) {
        return error_response(StatusCode::BAD_REQUEST, format!("Invalid asset hash '{}'", hash));
    }

    let record = match state.store.get(&hash) {
        Some(record) => record,
        None => return error_response(StatusCode::NOT_FOUND, "Asset not found"),
    };

    let file = match tokio::fs::File::open(&record.file_path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::warn!("Asset {} indexed but missing on disk, dropping record", hash);
            state.store.remove(&hash, RemoveOptions { remove_file: false });
            return error_response(StatusCode::NOT_FOUND, "Asset not found");
        }
        Err(e) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to open asset: {}", e),
            )
        }
    };

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&record.mime_type)
            .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_MIME)),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(record.size));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(CACHE_FOREVER));
    if let Ok(etag) = HeaderValue::from_str(&format!("\"{}\"", hash)) {
        headers.insert(header::ETAG, etag);
    }

    state.store.touch(&hash);
    (StatusCode::OK, headers, Body::from_stream(ReaderStream::new(file))).into_response()
}
