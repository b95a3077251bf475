use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::participant::Role;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String, // nanoid(12)
    pub username: String,
    pub role: Role,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(username: String, role: Role, body: String) -> Self {
        Self {
            id: super::id::generate_id(),
            username,
            role,
            body,
            timestamp: Utc::now(),
        }
    }
}
