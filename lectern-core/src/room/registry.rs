use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::models::{
    ChatMessage, CodecPolicy, HandRaise, Participant, Poll, RoomSettings, StreamKey,
};

/// Mutable state of one room. All access goes through the owning
/// [`Room`]'s mutex, so transitions are totally ordered per room.
#[derive(Debug, Default)]
pub struct RoomState {
    pub participants: HashMap<String, Participant>,
    pub chat: VecDeque<ChatMessage>,
    pub polls: Vec<Poll>,
    pub hand_queue: VecDeque<HandRaise>,
    pub settings: RoomSettings,
}

/// One collaboration room, keyed by stream key.
#[derive(Debug)]
pub struct Room {
    pub stream_key: StreamKey,
    pub state: Mutex<RoomState>,
}

impl Room {
    fn new(stream_key: StreamKey) -> Self {
        Self {
            stream_key,
            state: Mutex::new(RoomState::default()),
        }
    }
}

/// Registry of rooms with lazy creation and idle destruction.
///
/// Rooms come into existence on first join or first publish, and are
/// destroyed (dropping chat and polls) once they have no participants and
/// no active stream.
#[derive(Clone, Debug, Default)]
pub struct RoomRegistry {
    rooms: Arc<DashMap<StreamKey, Arc<Room>>>,
}

impl RoomRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, stream_key: &StreamKey) -> Option<Arc<Room>> {
        self.rooms.get(stream_key).map(|entry| entry.value().clone())
    }

    pub fn get_or_create(&self, stream_key: &StreamKey) -> Arc<Room> {
        if let Some(room) = self.get(stream_key) {
            return room;
        }
        let created = self
            .rooms
            .entry(stream_key.clone())
            .or_insert_with(|| {
                info!(stream_key = %stream_key.as_str(), "Room created");
                Arc::new(Room::new(stream_key.clone()))
            })
            .value()
            .clone();
        created
    }

    /// Snapshot the room's codec policy, or the default when no room exists.
    /// Read by the stream orchestrator at publish start.
    pub async fn codec_policy(&self, stream_key: &StreamKey) -> CodecPolicy {
        match self.get(stream_key) {
            Some(room) => room.state.lock().await.settings.codec_policy,
            None => CodecPolicy::default(),
        }
    }

    /// Destroy the room if it has no participants and the caller reports no
    /// active stream for its key. Returns whether the room was removed.
    ///
    /// Uses `try_lock` inside the map guard: a room whose state is being
    /// mutated right now is by definition not idle, so skipping it is
    /// correct.
    pub fn retire_if_idle(&self, stream_key: &StreamKey, stream_active: bool) -> bool {
        if stream_active {
            return false;
        }
        let removed = self
            .rooms
            .remove_if(stream_key, |_, room| {
                room.state
                    .try_lock()
                    .map(|state| state.participants.is_empty())
                    .unwrap_or(false)
            })
            .is_some();
        if removed {
            debug!(stream_key = %stream_key.as_str(), "Idle room destroyed");
        }
        removed
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// All live room keys (for status endpoints).
    #[must_use]
    pub fn room_keys(&self) -> Vec<StreamKey> {
        self.rooms.iter().map(|entry| entry.key().clone()).collect()
    }
}
