//! HLS read surface.
//!
//! Serves the transient output directory with origin cache hints: playlists
//! must always be revalidated, segments are content-addressed by sequence
//! number and effectively immutable.

use std::path::Path as FsPath;

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
};
use tracing::debug;

use super::AppState;

pub async fn serve_stream_file(
    State(state): State<AppState>,
    Path(file): Path<String>,
) -> impl IntoResponse {
    // File names are flat `<key>_...` artifacts; anything resembling a path
    // is refused outright.
    if file.contains('/') || file.contains('\\') || file.contains("..") {
        return StatusCode::NOT_FOUND.into_response();
    }

    let Some((content_type, cache_control)) = headers_for(&file) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let path = FsPath::new(&state.config.streaming.streams_dir).join(&file);
    let body = match tokio::fs::read(&path).await {
        Ok(body) => body,
        Err(e) => {
            debug!(file = %file, error = %e, "Stream file not served");
            return StatusCode::NOT_FOUND.into_response();
        }
    };

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(cache_control),
    );
    (headers, body).into_response()
}

/// Content type and cache policy by artifact kind; `None` for files we do
/// not serve.
fn headers_for(file: &str) -> Option<(&'static str, &'static str)> {
    if file.ends_with(".m3u8") {
        Some(("application/vnd.apple.mpegurl", "no-cache"))
    } else if file.ends_with(".ts") {
        Some(("video/mp2t", "public, max-age=31536000, immutable"))
    } else if file.ends_with(".m4s") || file.ends_with(".mp4") {
        Some(("video/iso.segment", "public, max-age=31536000, immutable"))
    } else {
        None
    }
}
