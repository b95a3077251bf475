use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::events::ServerEvent;
use crate::models::StreamKey;

/// Handle for a client connection subscription
pub type ConnectionId = String;

/// Capacity for per-subscriber message channels.
/// Messages are dropped with a warning when a subscriber is too slow.
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;

/// Number of consecutive drops before automatically disconnecting a slow subscriber.
const MAX_CONSECUTIVE_DROPS: u32 = 10;

/// Subscriber information
#[derive(Debug)]
struct Subscriber {
    connection_id: ConnectionId,
    sender: mpsc::Sender<ServerEvent>,
    /// Consecutive message drops due to a full channel
    consecutive_drops: Arc<AtomicU32>,
}

impl Clone for Subscriber {
    fn clone(&self) -> Self {
        Self {
            connection_id: self.connection_id.clone(),
            sender: self.sender.clone(),
            consecutive_drops: self.consecutive_drops.clone(),
        }
    }
}

/// In-memory hub routing server events to connected clients per room.
///
/// This is the transport-facing half of the event channel: it owns one
/// bounded queue per connection and evicts subscribers that stop draining.
/// Dropping a subscriber closes its sender; the connection's writer task
/// then observes end-of-stream and tears the socket down, which in turn
/// surfaces a `leave` to the room service.
#[derive(Clone, Debug, Default)]
pub struct RoomMessageHub {
    /// Map of stream key -> subscribers in that room
    rooms: Arc<DashMap<StreamKey, Vec<Subscriber>>>,

    /// Map of connection id -> stream key, for cleanup
    connections: Arc<DashMap<ConnectionId, StreamKey>>,
}

impl RoomMessageHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a connection to a room's events.
    /// Returns the receiving end of the connection's bounded queue.
    pub fn subscribe(
        &self,
        stream_key: StreamKey,
        connection_id: ConnectionId,
    ) -> mpsc::Receiver<ServerEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);

        let subscriber = Subscriber {
            connection_id: connection_id.clone(),
            sender: tx,
            consecutive_drops: Arc::new(AtomicU32::new(0)),
        };

        self.rooms
            .entry(stream_key.clone())
            .or_default()
            .push(subscriber);

        self.connections
            .insert(connection_id.clone(), stream_key.clone());

        info!(
            stream_key = %stream_key.as_str(),
            connection_id = %connection_id,
            "Client subscribed to room"
        );

        rx
    }

    /// Unsubscribe a connection from its room.
    pub fn unsubscribe(&self, connection_id: &str) {
        if let Some((_, stream_key)) = self.connections.remove(connection_id) {
            if let Some(mut subscribers) = self.rooms.get_mut(&stream_key) {
                subscribers.retain(|sub| sub.connection_id != connection_id);

                if subscribers.is_empty() {
                    drop(subscribers); // Drop the RefMut before removing
                    self.rooms.remove(&stream_key);
                    debug!(stream_key = %stream_key.as_str(), "Room has no more subscribers, removed");
                }
            }

            info!(
                stream_key = %stream_key.as_str(),
                connection_id = %connection_id,
                "Client unsubscribed from room"
            );
        } else {
            warn!(
                connection_id = %connection_id,
                "Attempted to unsubscribe unknown connection"
            );
        }
    }

    /// Broadcast an event to all subscribers in a room.
    ///
    /// Subscribers that fail to receive messages for `MAX_CONSECUTIVE_DROPS`
    /// consecutive broadcasts are automatically disconnected to prevent
    /// unbounded backpressure from a single slow client.
    pub fn broadcast(&self, stream_key: &StreamKey, event: ServerEvent) -> usize {
        self.broadcast_filtered(stream_key, event, None)
    }

    /// Broadcast to everyone in the room except one connection (usually the
    /// command's sender).
    pub fn broadcast_except(
        &self,
        stream_key: &StreamKey,
        excluded_connection_id: &str,
        event: ServerEvent,
    ) -> usize {
        self.broadcast_filtered(stream_key, event, Some(excluded_connection_id))
    }

    fn broadcast_filtered(
        &self,
        stream_key: &StreamKey,
        event: ServerEvent,
        excluded_connection_id: Option<&str>,
    ) -> usize {
        let mut sent_count = 0;
        let mut failed_connections = Vec::new();

        if let Some(subscribers) = self.rooms.get(stream_key) {
            for subscriber in subscribers.iter() {
                if excluded_connection_id == Some(subscriber.connection_id.as_str()) {
                    continue;
                }
                match subscriber.sender.try_send(event.clone()) {
                    Ok(()) => {
                        subscriber.consecutive_drops.store(0, Ordering::Relaxed);
                        sent_count += 1;
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        let drops =
                            subscriber.consecutive_drops.fetch_add(1, Ordering::Relaxed) + 1;
                        if drops >= MAX_CONSECUTIVE_DROPS {
                            warn!(
                                stream_key = %stream_key.as_str(),
                                connection_id = %subscriber.connection_id,
                                consecutive_drops = drops,
                                "Disconnecting persistently slow subscriber"
                            );
                            failed_connections.push(subscriber.connection_id.clone());
                        } else {
                            warn!(
                                stream_key = %stream_key.as_str(),
                                connection_id = %subscriber.connection_id,
                                event_type = %event.event_type(),
                                consecutive_drops = drops,
                                "Subscriber channel full, dropping event for slow consumer"
                            );
                        }
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        failed_connections.push(subscriber.connection_id.clone());
                    }
                }
            }
        }

        // Clean up failed/slow connections (drop the read guard first)
        for conn_id in failed_connections {
            self.unsubscribe(&conn_id);
        }

        if sent_count > 0 {
            debug!(
                stream_key = %stream_key.as_str(),
                sent_count = sent_count,
                event_type = %event.event_type(),
                "Event broadcast complete"
            );
        }

        sent_count
    }

    /// Deliver an event to a single connection (e.g. the `room_state`
    /// snapshot for a joining client).
    /// Returns 1 if sent, 0 if the connection was not found or its queue full.
    pub fn send_to_connection(
        &self,
        stream_key: &StreamKey,
        connection_id: &str,
        event: ServerEvent,
    ) -> usize {
        let mut result = 0;
        let mut failed_connection: Option<ConnectionId> = None;

        if let Some(subscribers) = self.rooms.get(stream_key) {
            for subscriber in subscribers.iter() {
                if subscriber.connection_id == connection_id {
                    let event_type = event.event_type();
                    match subscriber.sender.try_send(event) {
                        Ok(()) => {
                            result = 1;
                        }
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            warn!(
                                stream_key = %stream_key.as_str(),
                                connection_id = %connection_id,
                                event_type = %event_type,
                                "Subscriber channel full, dropping targeted event"
                            );
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            failed_connection = Some(subscriber.connection_id.clone());
                        }
                    }
                    break;
                }
            }
        }
        // The DashMap read guard must be released before unsubscribe(),
        // which takes a write lock on the same shard.

        if let Some(conn_id) = failed_connection {
            self.unsubscribe(&conn_id);
        }

        result
    }

    /// Get the number of subscribers in a room
    #[must_use]
    pub fn subscriber_count(&self, stream_key: &StreamKey) -> usize {
        self.rooms
            .get(stream_key)
            .map_or(0, |subscribers| subscribers.len())
    }

    /// Get total number of active connections
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}
