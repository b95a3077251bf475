//! WebSocket handler for the room event channel.
//!
//! Protocol: JSON text frames carrying tagged commands and events. The
//! first accepted command must be `join`; everything before it is dropped.
//! One reader and one writer task per connection. The writer drains the
//! hub's bounded per-connection queue and pings on an interval; the reader
//! enforces the silence timeout and feeds commands to the room service.

use std::time::Duration;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
};
use futures::{stream::StreamExt, SinkExt};
use tracing::{debug, error, info, warn};

use lectern_core::models::{Role, StreamKey};
use lectern_core::room::ClientCommand;

use super::AppState;

/// How long a fresh connection may dawdle before sending `join`.
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest accepted username, in bytes.
const MAX_USERNAME_BYTES: usize = 64;

/// Handle WebSocket connection for a room
///
/// # Route
/// GET /ws/rooms/{stream_key}
pub async fn websocket_handler(
    Path(stream_key): Path<String>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, StreamKey::from(stream_key), state))
}

/// Handle an upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, stream_key: StreamKey, state: AppState) {
    let connection_id = format!("ws_{}", nanoid::nanoid!(8));
    let (mut sender, mut receiver) = socket.split();

    // The connection is anonymous until it joins.
    let Some((username, role)) = await_join(&mut receiver, &connection_id).await else {
        debug!(connection_id = %connection_id, "Connection closed before joining");
        return;
    };

    info!(
        stream_key = %stream_key.as_str(),
        connection_id = %connection_id,
        username = %username,
        "WebSocket connected"
    );

    // Subscribe before joining so the room_state snapshot is the first
    // event in this connection's queue.
    let mut event_rx = state
        .rooms
        .hub()
        .subscribe(stream_key.clone(), connection_id.clone());
    state
        .rooms
        .join(&stream_key, &connection_id, username, role)
        .await;

    // Writer: hub events out, plus heartbeat pings.
    let heartbeat = Duration::from_secs(state.config.room.heartbeat_interval_seconds);
    let writer_connection_id = connection_id.clone();
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat);
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    let Some(event) = event else {
                        // Unsubscribed by the hub (slow client eviction).
                        break;
                    };
                    let json = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            error!(error = %e, "Failed to serialize server event");
                            continue;
                        }
                    };
                    if sender.send(WsMessage::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if sender.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(connection_id = %writer_connection_id, "Writer task ended");
    });

    // Reader: commands in, silence timeout enforced per frame.
    let client_timeout = Duration::from_secs(state.config.room.client_timeout_seconds);
    loop {
        let frame = tokio::time::timeout(client_timeout, receiver.next()).await;
        match frame {
            Err(_) => {
                info!(
                    connection_id = %connection_id,
                    timeout_seconds = client_timeout.as_secs(),
                    "Disconnecting silent connection"
                );
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(connection_id = %connection_id, error = %e, "WebSocket read error");
                break;
            }
            Ok(Some(Ok(WsMessage::Text(text)))) => {
                dispatch(&state, &stream_key, &connection_id, text.as_str()).await;
            }
            Ok(Some(Ok(WsMessage::Close(_)))) => break,
            Ok(Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Binary(_)))) => {
                // Any traffic counts as liveness; binary frames are ignored.
            }
        }
    }

    // Teardown: the hub drops the queue, the room observes the leave.
    state.rooms.leave(&stream_key, &connection_id).await;
    state.rooms.hub().unsubscribe(&connection_id);
    writer.abort();

    let stream_live = state.orchestrator.is_active(&stream_key);
    state.rooms.registry().retire_if_idle(&stream_key, stream_live);

    info!(
        stream_key = %stream_key.as_str(),
        connection_id = %connection_id,
        "WebSocket disconnected"
    );
}

/// Wait for the initial `join`. Non-join and malformed frames are dropped
/// (never a disconnect); transport close or the join timeout ends the
/// connection.
async fn await_join(
    receiver: &mut futures::stream::SplitStream<WebSocket>,
    connection_id: &str,
) -> Option<(String, Role)> {
    loop {
        match tokio::time::timeout(JOIN_TIMEOUT, receiver.next()).await {
            Ok(Some(Ok(WsMessage::Text(text)))) => {
                match serde_json::from_str::<ClientCommand>(text.as_str()) {
                    Ok(ClientCommand::Join { username, role }) => {
                        let username = username.trim().to_string();
                        if username.is_empty() || username.len() > MAX_USERNAME_BYTES {
                            info!(
                                connection_id = %connection_id,
                                "Dropped join with invalid username"
                            );
                            continue;
                        }
                        return Some((username, role));
                    }
                    Ok(other) => {
                        info!(
                            connection_id = %connection_id,
                            command = ?other,
                            "Dropped command sent before join"
                        );
                    }
                    Err(e) => {
                        info!(
                            connection_id = %connection_id,
                            error = %e,
                            "Dropped malformed message before join"
                        );
                    }
                }
            }
            Ok(Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Binary(_)))) => {}
            Ok(Some(Ok(WsMessage::Close(_)))) | Ok(None) | Ok(Some(Err(_))) => return None,
            Err(_) => {
                info!(connection_id = %connection_id, "Connection never joined, closing");
                return None;
            }
        }
    }
}

/// Parse and apply one command frame. Protocol violations are dropped and
/// logged at info; room-state integrity violations are handled inside the
/// service as silent no-ops.
async fn dispatch(state: &AppState, stream_key: &StreamKey, connection_id: &str, text: &str) {
    let command = match serde_json::from_str::<ClientCommand>(text) {
        Ok(command) => command,
        Err(e) => {
            info!(
                connection_id = %connection_id,
                error = %e,
                "Dropped malformed client message"
            );
            return;
        }
    };

    let rooms = &state.rooms;
    match command {
        ClientCommand::Join { .. } => {
            warn!(
                connection_id = %connection_id,
                "Duplicate join ignored"
            );
        }
        ClientCommand::Chat { body } => {
            rooms.chat(stream_key, connection_id, body).await;
        }
        ClientCommand::Typing { typing } => {
            rooms.typing(stream_key, connection_id, typing).await;
        }
        ClientCommand::CreatePoll {
            question,
            options,
            auto_close_seconds,
        } => {
            rooms
                .create_poll(stream_key, connection_id, question, options, auto_close_seconds)
                .await;
        }
        ClientCommand::Vote { poll_id, option_id } => {
            rooms.vote(stream_key, connection_id, &poll_id, &option_id).await;
        }
        ClientCommand::ClosePoll { poll_id } => {
            rooms.close_poll(stream_key, connection_id, &poll_id).await;
        }
        ClientCommand::RaiseHand => {
            rooms.raise_hand(stream_key, connection_id).await;
        }
        ClientCommand::LowerHand => {
            rooms.lower_hand(stream_key, connection_id).await;
        }
        ClientCommand::SetCodecPolicy {
            secondary_codec_enabled,
        } => {
            rooms
                .set_codec_policy(stream_key, connection_id, secondary_codec_enabled)
                .await;
        }
    }
}
