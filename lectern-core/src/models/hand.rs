use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One entry in a room's hand-raise queue (FIFO by first raise).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandRaise {
    pub connection_id: String,
    pub username: String,
    pub raised_at: DateTime<Utc>,
}

impl HandRaise {
    pub fn new(connection_id: String, username: String) -> Self {
        Self {
            connection_id,
            username,
            raised_at: Utc::now(),
        }
    }
}
