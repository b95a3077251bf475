//! Status endpoints: liveness plus small operational summaries.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;

use lectern_core::models::StreamKey;
use lectern_livestream::StreamSummary;

use super::AppState;

#[derive(Serialize)]
pub struct Health {
    status: &'static str,
}

pub async fn healthz() -> Json<Health> {
    Json(Health { status: "ok" })
}

pub async fn list_streams(State(state): State<AppState>) -> Json<Vec<StreamSummary>> {
    Json(state.orchestrator.stream_summaries())
}

#[derive(Debug, Serialize)]
pub struct RoomSummary {
    pub stream_key: StreamKey,
    pub live: bool,
    pub participant_count: usize,
    pub chat_messages: usize,
    pub active_polls: usize,
    pub total_polls: usize,
    pub hands_raised: usize,
    pub secondary_codec_enabled: bool,
}

pub async fn room_summary(
    Path(stream_key): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<RoomSummary>, StatusCode> {
    let stream_key = StreamKey::from(stream_key);
    let Some(room) = state.rooms.registry().get(&stream_key) else {
        return Err(StatusCode::NOT_FOUND);
    };

    let room_state = room.state.lock().await;
    Ok(Json(RoomSummary {
        live: state.orchestrator.is_active(&stream_key),
        participant_count: room_state.participants.len(),
        chat_messages: room_state.chat.len(),
        active_polls: room_state.polls.iter().filter(|p| p.is_active()).count(),
        total_polls: room_state.polls.len(),
        hands_raised: room_state.hand_queue.len(),
        secondary_codec_enabled: room_state.settings.codec_policy.secondary_codec_enabled,
        stream_key,
    }))
}
