use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{
    ChatMessage, HandRaise, Participant, Poll, Role, RoomSettings, StreamKey,
};

/// Commands sent by clients over the event channel.
///
/// Every message is a tagged record; unknown or malformed messages are
/// dropped at the transport boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    /// First message on every connection; everything else is rejected until
    /// the sender has joined.
    Join {
        username: String,
        role: Role,
    },
    Chat {
        body: String,
    },
    Typing {
        typing: bool,
    },
    CreatePoll {
        question: String,
        options: Vec<String>,
        auto_close_seconds: Option<u64>,
    },
    Vote {
        poll_id: String,
        option_id: String,
    },
    ClosePoll {
        poll_id: String,
    },
    RaiseHand,
    LowerHand,
    SetCodecPolicy {
        secondary_codec_enabled: bool,
    },
}

/// Full room snapshot delivered to a joining client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomStateSnapshot {
    pub stream_key: StreamKey,
    pub participants: Vec<Participant>,
    pub chat: Vec<ChatMessage>,
    pub polls: Vec<Poll>,
    pub hand_queue: Vec<HandRaise>,
    pub settings: RoomSettings,
}

/// Events emitted by the room hub to joined clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Sent only to the joining connection.
    RoomState {
        state: RoomStateSnapshot,
    },

    ParticipantJoined {
        participant: Participant,
        participant_count: usize,
        timestamp: DateTime<Utc>,
    },

    ParticipantLeft {
        connection_id: String,
        username: String,
        participant_count: usize,
        timestamp: DateTime<Utc>,
    },

    ChatMessage {
        message: ChatMessage,
    },

    UserTyping {
        connection_id: String,
        username: String,
        typing: bool,
    },

    NewPoll {
        poll: Poll,
    },

    PollUpdated {
        poll: Poll,
    },

    PollClosed {
        poll: Poll,
    },

    /// Carries the full queue so clients never have to diff.
    HandRaised {
        queue: Vec<HandRaise>,
    },

    HandLowered {
        queue: Vec<HandRaise>,
    },

    SettingsUpdated {
        settings: RoomSettings,
    },

    StreamStarted {
        stream_key: StreamKey,
        timestamp: DateTime<Utc>,
    },

    StreamEnded {
        stream_key: StreamKey,
        timestamp: DateTime<Utc>,
    },

    StreamFailed {
        stream_key: StreamKey,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl ServerEvent {
    /// Get a short description of the event type
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::RoomState { .. } => "room_state",
            Self::ParticipantJoined { .. } => "participant_joined",
            Self::ParticipantLeft { .. } => "participant_left",
            Self::ChatMessage { .. } => "chat_message",
            Self::UserTyping { .. } => "user_typing",
            Self::NewPoll { .. } => "new_poll",
            Self::PollUpdated { .. } => "poll_updated",
            Self::PollClosed { .. } => "poll_closed",
            Self::HandRaised { .. } => "hand_raised",
            Self::HandLowered { .. } => "hand_lowered",
            Self::SettingsUpdated { .. } => "settings_updated",
            Self::StreamStarted { .. } => "stream_started",
            Self::StreamEnded { .. } => "stream_ended",
            Self::StreamFailed { .. } => "stream_failed",
        }
    }
}
