//! Publish lifecycle hooks called by the RTMP ingest server.
//!
//! Modeled on the `on_publish` / `on_publish_done` callback convention of
//! off-the-shelf ingest servers: each hook posts the publish path and the
//! publisher's address. Malformed or duplicate callbacks are tolerated and
//! answered with 200 so the ingest server never tears down a session over
//! an origin-side hiccup.

use axum::{extract::State, http::StatusCode, Json};
use serde::Deserialize;
use tracing::warn;

use lectern_livestream::ingest::PublishEvent;

use super::AppState;

/// Raw hook payload from the ingest server.
#[derive(Debug, Deserialize)]
pub struct PublishHook {
    /// Publish path, e.g. `/live/physics-101`.
    pub path: String,
    /// Publisher network address.
    #[serde(default)]
    pub addr: String,
}

fn normalize(hook: &PublishHook) -> Option<PublishEvent> {
    let event = PublishEvent::from_path(&hook.path, hook.addr.clone());
    if event.is_none() {
        warn!(path = %hook.path, "Ignoring publish hook with unusable path");
    }
    event
}

pub async fn pre_publish(
    State(state): State<AppState>,
    Json(hook): Json<PublishHook>,
) -> StatusCode {
    if let Some(event) = normalize(&hook) {
        state.orchestrator.handle_pre_publish(&event);
    }
    StatusCode::OK
}

pub async fn post_publish(
    State(state): State<AppState>,
    Json(hook): Json<PublishHook>,
) -> StatusCode {
    if let Some(event) = normalize(&hook) {
        // Spawn errors are already logged and surfaced to the room; the
        // ingest server cannot do anything useful with a failure status.
        let _ = state.orchestrator.handle_post_publish(&event).await;
    }
    StatusCode::OK
}

pub async fn done_publish(
    State(state): State<AppState>,
    Json(hook): Json<PublishHook>,
) -> StatusCode {
    if let Some(event) = normalize(&hook) {
        state.orchestrator.handle_done_publish(&event.stream_key).await;
    }
    StatusCode::OK
}
