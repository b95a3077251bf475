// Module: http
// WebSocket event channel, ingest hooks, HLS read surface, status endpoints

pub mod hls;
pub mod ingest;
pub mod status;
pub mod websocket;

use std::sync::Arc;

use axum::{
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use lectern_core::room::RoomService;
use lectern_livestream::StreamOrchestrator;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<lectern_core::Config>,
    pub rooms: Arc<RoomService>,
    pub orchestrator: Arc<StreamOrchestrator>,
}

/// Assemble the HTTP router: status endpoints, ingest publish hooks, the
/// per-room WebSocket channel, and the HLS file surface.
pub fn create_router(state: AppState) -> Router {
    let cors = build_cors_layer(&state.config);

    Router::new()
        .route("/healthz", get(status::healthz))
        .route("/api/streams", get(status::list_streams))
        .route("/api/rooms/{stream_key}", get(status::room_summary))
        .route("/api/ingest/pre-publish", post(ingest::pre_publish))
        .route("/api/ingest/post-publish", post(ingest::post_publish))
        .route("/api/ingest/done-publish", post(ingest::done_publish))
        .route("/ws/rooms/{stream_key}", get(websocket::websocket_handler))
        .route("/streams/{file}", get(hls::serve_stream_file))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn build_cors_layer(config: &lectern_core::Config) -> CorsLayer {
    if config.server.cors_allowed_origins.is_empty() {
        // HLS players and the classroom UI are typically served elsewhere.
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = config
            .server
            .cors_allowed_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
