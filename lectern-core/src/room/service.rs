//! Authoritative room state machine.
//!
//! Applies typed client commands to room state and fans resulting events out
//! through the message hub. All mutations of one room happen under that
//! room's mutex, and events are emitted while the lock is held, so every
//! subscriber observes transitions in a single total order.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::events::{RoomStateSnapshot, ServerEvent};
use super::hub::RoomMessageHub;
use super::registry::{RoomRegistry, RoomState};
use crate::models::{ChatMessage, HandRaise, Participant, Poll, Role, StreamKey};

/// Longest accepted chat message body, in bytes.
const MAX_CHAT_BODY_BYTES: usize = 500;

/// Longest accepted poll question, in bytes.
const MAX_POLL_QUESTION_BYTES: usize = 300;

pub struct RoomService {
    registry: RoomRegistry,
    hub: RoomMessageHub,
    chat_retention: usize,
}

impl RoomService {
    #[must_use]
    pub fn new(registry: RoomRegistry, hub: RoomMessageHub, chat_retention: usize) -> Self {
        Self {
            registry,
            hub,
            chat_retention,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    #[must_use]
    pub fn hub(&self) -> &RoomMessageHub {
        &self.hub
    }

    /// Add a participant. The caller must already have subscribed the
    /// connection to the hub, so the `room_state` snapshot lands in its
    /// queue before any later broadcast.
    pub async fn join(
        &self,
        stream_key: &StreamKey,
        connection_id: &str,
        username: String,
        role: Role,
    ) {
        let room = self.registry.get_or_create(stream_key);
        let mut state = room.state.lock().await;

        if state.participants.contains_key(connection_id) {
            warn!(
                stream_key = %stream_key.as_str(),
                connection_id = %connection_id,
                "Duplicate join ignored"
            );
            return;
        }

        let participant = Participant::new(connection_id.to_string(), username, role);
        state
            .participants
            .insert(connection_id.to_string(), participant.clone());

        info!(
            stream_key = %stream_key.as_str(),
            connection_id = %connection_id,
            username = %participant.username,
            role = ?participant.role,
            "Participant joined"
        );

        let snapshot = Self::snapshot(stream_key, &state);
        self.hub.send_to_connection(
            stream_key,
            connection_id,
            ServerEvent::RoomState { state: snapshot },
        );
        self.hub.broadcast_except(
            stream_key,
            connection_id,
            ServerEvent::ParticipantJoined {
                participant,
                participant_count: state.participants.len(),
                timestamp: Utc::now(),
            },
        );
    }

    /// Remove a participant (explicit leave or transport disconnect).
    /// Lowers their hand first if it was raised.
    pub async fn leave(&self, stream_key: &StreamKey, connection_id: &str) {
        let Some(room) = self.registry.get(stream_key) else {
            return;
        };
        let mut state = room.state.lock().await;

        let Some(participant) = state.participants.remove(connection_id) else {
            return;
        };

        if participant.hand_raised {
            state
                .hand_queue
                .retain(|hand| hand.connection_id != connection_id);
            self.hub.broadcast(
                stream_key,
                ServerEvent::HandLowered {
                    queue: state.hand_queue.iter().cloned().collect(),
                },
            );
        }

        info!(
            stream_key = %stream_key.as_str(),
            connection_id = %connection_id,
            username = %participant.username,
            "Participant left"
        );

        self.hub.broadcast_except(
            stream_key,
            connection_id,
            ServerEvent::ParticipantLeft {
                connection_id: connection_id.to_string(),
                username: participant.username,
                participant_count: state.participants.len(),
                timestamp: Utc::now(),
            },
        );
    }

    /// Append a chat message, trimming the log to the retention bound.
    pub async fn chat(&self, stream_key: &StreamKey, connection_id: &str, body: String) {
        if body.is_empty() || body.len() > MAX_CHAT_BODY_BYTES {
            debug!(
                stream_key = %stream_key.as_str(),
                connection_id = %connection_id,
                len = body.len(),
                "Rejected chat message with invalid length"
            );
            return;
        }

        let Some(room) = self.registry.get(stream_key) else {
            return;
        };
        let mut state = room.state.lock().await;

        let Some(participant) = state.participants.get(connection_id) else {
            info!(
                stream_key = %stream_key.as_str(),
                connection_id = %connection_id,
                "Dropped chat from non-participant"
            );
            return;
        };

        let message = ChatMessage::new(participant.username.clone(), participant.role, body);
        state.chat.push_back(message.clone());
        while state.chat.len() > self.chat_retention {
            state.chat.pop_front();
        }

        self.hub
            .broadcast(stream_key, ServerEvent::ChatMessage { message });
    }

    /// Relay a transient typing indicator. No state is stored.
    pub async fn typing(&self, stream_key: &StreamKey, connection_id: &str, typing: bool) {
        let Some(room) = self.registry.get(stream_key) else {
            return;
        };
        let state = room.state.lock().await;
        let Some(participant) = state.participants.get(connection_id) else {
            return;
        };

        self.hub.broadcast_except(
            stream_key,
            connection_id,
            ServerEvent::UserTyping {
                connection_id: connection_id.to_string(),
                username: participant.username.clone(),
                typing,
            },
        );
    }

    /// Create a poll (teacher only). Schedules auto-closure when requested.
    pub async fn create_poll(
        self: &Arc<Self>,
        stream_key: &StreamKey,
        connection_id: &str,
        question: String,
        options: Vec<String>,
        auto_close_seconds: Option<u64>,
    ) {
        if question.is_empty()
            || question.len() > MAX_POLL_QUESTION_BYTES
            || options.len() < 2
            || options.iter().any(String::is_empty)
        {
            debug!(
                stream_key = %stream_key.as_str(),
                connection_id = %connection_id,
                "Rejected malformed poll"
            );
            return;
        }

        let Some(room) = self.registry.get(stream_key) else {
            return;
        };
        let mut state = room.state.lock().await;

        if !Self::is_teacher(&state, connection_id, "create_poll") {
            return;
        }

        let poll = Poll::new(question, options, auto_close_seconds);
        let poll_id = poll.id.clone();
        state.polls.push(poll.clone());

        info!(
            stream_key = %stream_key.as_str(),
            poll_id = %poll_id,
            auto_close_seconds = ?auto_close_seconds,
            "Poll created"
        );

        self.hub.broadcast(stream_key, ServerEvent::NewPoll { poll });
        drop(state);

        if let Some(secs) = auto_close_seconds {
            let service = Arc::clone(self);
            let key = stream_key.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                service.close_poll_by_id(&key, &poll_id).await;
            });
        }
    }

    /// Record a vote. Double votes, unknown options, and votes on closed
    /// polls are silent no-ops.
    pub async fn vote(
        &self,
        stream_key: &StreamKey,
        connection_id: &str,
        poll_id: &str,
        option_id: &str,
    ) {
        let Some(room) = self.registry.get(stream_key) else {
            return;
        };
        let mut state = room.state.lock().await;

        if !state.participants.contains_key(connection_id) {
            return;
        }

        let Some(poll) = state.polls.iter_mut().find(|p| p.id == poll_id) else {
            debug!(
                stream_key = %stream_key.as_str(),
                poll_id = %poll_id,
                "Vote on unknown poll ignored"
            );
            return;
        };

        if poll.vote(connection_id, option_id) {
            let updated = poll.clone();
            self.hub
                .broadcast(stream_key, ServerEvent::PollUpdated { poll: updated });
        } else {
            debug!(
                stream_key = %stream_key.as_str(),
                poll_id = %poll_id,
                connection_id = %connection_id,
                "Vote rejected"
            );
        }
    }

    /// Close a poll (teacher only). Closing an already-closed poll is a no-op.
    pub async fn close_poll(&self, stream_key: &StreamKey, connection_id: &str, poll_id: &str) {
        let Some(room) = self.registry.get(stream_key) else {
            return;
        };
        {
            let state = room.state.lock().await;
            if !Self::is_teacher(&state, connection_id, "close_poll") {
                return;
            }
        }
        self.close_poll_by_id(stream_key, poll_id).await;
    }

    /// Close a poll without an authorization check (auto-close timers).
    /// Emits `poll_closed` at most once per poll.
    async fn close_poll_by_id(&self, stream_key: &StreamKey, poll_id: &str) {
        let Some(room) = self.registry.get(stream_key) else {
            return;
        };
        let mut state = room.state.lock().await;

        let Some(poll) = state.polls.iter_mut().find(|p| p.id == poll_id) else {
            return;
        };

        if poll.close() {
            info!(
                stream_key = %stream_key.as_str(),
                poll_id = %poll_id,
                total_votes = poll.total_votes(),
                "Poll closed"
            );
            let closed = poll.clone();
            self.hub
                .broadcast(stream_key, ServerEvent::PollClosed { poll: closed });
        }
    }

    /// Append to the hand-raise queue; re-raising while queued is a no-op.
    pub async fn raise_hand(&self, stream_key: &StreamKey, connection_id: &str) {
        let Some(room) = self.registry.get(stream_key) else {
            return;
        };
        let mut state = room.state.lock().await;

        let Some(participant) = state.participants.get_mut(connection_id) else {
            return;
        };
        if participant.hand_raised {
            return;
        }
        participant.hand_raised = true;
        let hand = HandRaise::new(connection_id.to_string(), participant.username.clone());
        state.hand_queue.push_back(hand);

        self.hub.broadcast(
            stream_key,
            ServerEvent::HandRaised {
                queue: state.hand_queue.iter().cloned().collect(),
            },
        );
    }

    /// Remove from the hand-raise queue; lowering an unraised hand is a no-op.
    pub async fn lower_hand(&self, stream_key: &StreamKey, connection_id: &str) {
        let Some(room) = self.registry.get(stream_key) else {
            return;
        };
        let mut state = room.state.lock().await;

        let Some(participant) = state.participants.get_mut(connection_id) else {
            return;
        };
        if !participant.hand_raised {
            return;
        }
        participant.hand_raised = false;
        state
            .hand_queue
            .retain(|hand| hand.connection_id != connection_id);

        self.hub.broadcast(
            stream_key,
            ServerEvent::HandLowered {
                queue: state.hand_queue.iter().cloned().collect(),
            },
        );
    }

    /// Update the room's codec policy (teacher only). Applies to the next
    /// publish start; the orchestrator snapshots policy per stream.
    pub async fn set_codec_policy(
        &self,
        stream_key: &StreamKey,
        connection_id: &str,
        secondary_codec_enabled: bool,
    ) {
        let room = self.registry.get_or_create(stream_key);
        let mut state = room.state.lock().await;

        if !Self::is_teacher(&state, connection_id, "set_codec_policy") {
            return;
        }

        state.settings.codec_policy.secondary_codec_enabled = secondary_codec_enabled;

        info!(
            stream_key = %stream_key.as_str(),
            secondary_codec_enabled = secondary_codec_enabled,
            "Codec policy updated"
        );

        self.hub.broadcast(
            stream_key,
            ServerEvent::SettingsUpdated {
                settings: state.settings,
            },
        );
    }

    /// Announce a newly started stream to the room (creates it if needed).
    pub async fn notify_stream_started(&self, stream_key: &StreamKey) {
        let _room = self.registry.get_or_create(stream_key);
        self.hub.broadcast(
            stream_key,
            ServerEvent::StreamStarted {
                stream_key: stream_key.clone(),
                timestamp: Utc::now(),
            },
        );
    }

    pub async fn notify_stream_ended(&self, stream_key: &StreamKey) {
        self.hub.broadcast(
            stream_key,
            ServerEvent::StreamEnded {
                stream_key: stream_key.clone(),
                timestamp: Utc::now(),
            },
        );
    }

    pub async fn notify_stream_failed(&self, stream_key: &StreamKey, reason: &str) {
        self.hub.broadcast(
            stream_key,
            ServerEvent::StreamFailed {
                stream_key: stream_key.clone(),
                reason: reason.to_string(),
                timestamp: Utc::now(),
            },
        );
    }

    /// Authorization gate for teacher-only commands. Violations are logged
    /// and become no-ops; the client is never errored or disconnected.
    fn is_teacher(state: &RoomState, connection_id: &str, command: &str) -> bool {
        match state.participants.get(connection_id) {
            Some(participant) if participant.role.is_teacher() => true,
            Some(participant) => {
                info!(
                    connection_id = %connection_id,
                    username = %participant.username,
                    command = command,
                    "Unauthorized teacher command ignored"
                );
                false
            }
            None => {
                info!(
                    connection_id = %connection_id,
                    command = command,
                    "Command from non-participant ignored"
                );
                false
            }
        }
    }

    fn snapshot(stream_key: &StreamKey, state: &RoomState) -> RoomStateSnapshot {
        let mut participants: Vec<_> = state.participants.values().cloned().collect();
        participants.sort_by(|a, b| a.joined_at.cmp(&b.joined_at));

        RoomStateSnapshot {
            stream_key: stream_key.clone(),
            participants,
            chat: state.chat.iter().cloned().collect(),
            polls: state.polls.clone(),
            hand_queue: state.hand_queue.iter().cloned().collect(),
            settings: state.settings,
        }
    }
}
