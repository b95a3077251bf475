//! HTTP surface tests: ingest hooks, status endpoints, and the HLS read
//! surface with its cache policy.
//!
//! Run with: cargo test --test http_surface

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use tower::util::ServiceExt;

use lectern_api::{create_router, AppState};
use lectern_core::room::{RoomMessageHub, RoomRegistry, RoomService};
use lectern_core::Config;
use lectern_livestream::mock_launcher::MockTranscoderLauncher;
use lectern_livestream::{CleanupScheduler, StreamOrchestrator, TranscoderLauncher};

struct Harness {
    state: AppState,
    _streams_dir: tempfile::TempDir,
    _recordings_dir: tempfile::TempDir,
}

fn harness() -> Harness {
    let streams_dir = tempfile::tempdir().expect("streams tempdir");
    let recordings_dir = tempfile::tempdir().expect("recordings tempdir");

    let mut config = Config::default();
    config.streaming.streams_dir = streams_dir.path().to_string_lossy().into_owned();
    config.streaming.recordings_dir = recordings_dir.path().to_string_lossy().into_owned();
    let config = Arc::new(config);

    let rooms = Arc::new(RoomService::new(
        RoomRegistry::new(),
        RoomMessageHub::new(),
        config.room.chat_retention,
    ));
    let launcher = Arc::new(MockTranscoderLauncher::new());
    let cleanup = Arc::new(CleanupScheduler::new(
        streams_dir.path().to_path_buf(),
        Duration::from_secs(config.streaming.cleanup_grace_seconds),
    ));
    let orchestrator = StreamOrchestrator::new(
        config.clone(),
        launcher as Arc<dyn TranscoderLauncher>,
        rooms.clone(),
        cleanup,
    );

    Harness {
        state: AppState {
            config,
            rooms,
            orchestrator,
        },
        _streams_dir: streams_dir,
        _recordings_dir: recordings_dir,
    }
}

fn post_json(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

#[tokio::test]
async fn test_healthz() {
    let h = harness();
    let response = create_router(h.state)
        .oneshot(get("/healthz"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_ingest_hooks_drive_stream_lifecycle() {
    let h = harness();
    let router = create_router(h.state.clone());

    let response = router
        .clone()
        .oneshot(post_json(
            "/api/ingest/post-publish",
            r#"{"path":"/live/k1","addr":"203.0.113.9:50211"}"#,
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(h.state.orchestrator.active_stream_count(), 1);

    let response = router
        .clone()
        .oneshot(get("/api/streams"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("body");
    let summaries: serde_json::Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(summaries.as_array().map(Vec::len), Some(1));
    assert_eq!(summaries[0]["stream_key"], "k1");

    let response = router
        .clone()
        .oneshot(post_json(
            "/api/ingest/done-publish",
            r#"{"path":"/live/k1","addr":"203.0.113.9:50211"}"#,
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(h.state.orchestrator.active_stream_count(), 0);
}

#[tokio::test]
async fn test_malformed_ingest_hook_tolerated() {
    let h = harness();
    let router = create_router(h.state.clone());

    let response = router
        .oneshot(post_json("/api/ingest/post-publish", r#"{"path":"///"}"#))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(h.state.orchestrator.active_stream_count(), 0);
}

#[tokio::test]
async fn test_room_summary_after_publish() {
    let h = harness();
    let router = create_router(h.state.clone());

    let response = router
        .clone()
        .oneshot(get("/api/rooms/k1"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    router
        .clone()
        .oneshot(post_json(
            "/api/ingest/post-publish",
            r#"{"path":"/live/k1","addr":"203.0.113.9:50211"}"#,
        ))
        .await
        .expect("response");

    let response = router
        .oneshot(get("/api/rooms/k1"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("body");
    let summary: serde_json::Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(summary["live"], true);
    assert_eq!(summary["participant_count"], 0);
}

#[tokio::test]
async fn test_hls_cache_policy() {
    let h = harness();
    let streams_dir = h.state.config.streaming.streams_dir.clone();
    tokio::fs::write(
        std::path::Path::new(&streams_dir).join("k1_h264.m3u8"),
        "#EXTM3U\n",
    )
    .await
    .expect("write playlist");
    tokio::fs::write(
        std::path::Path::new(&streams_dir).join("k1_h264_720p_000.ts"),
        b"segment",
    )
    .await
    .expect("write segment");

    let router = create_router(h.state);

    let response = router
        .clone()
        .oneshot(get("/streams/k1_h264.m3u8"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CACHE_CONTROL).unwrap(),
        "no-cache"
    );
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/vnd.apple.mpegurl"
    );

    let response = router
        .clone()
        .oneshot(get("/streams/k1_h264_720p_000.ts"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CACHE_CONTROL).unwrap(),
        "public, max-age=31536000, immutable"
    );

    let response = router
        .clone()
        .oneshot(get("/streams/missing_000.ts"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = router
        .oneshot(get("/streams/..%2F..%2Fetc%2Fpasswd"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
