use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role of a room participant. Roles are claimed by the client at join time
/// (identity is trusted, see non-goals) but every privileged command is
/// still checked server-side against the stored role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Teacher,
    Student,
}

impl Role {
    #[must_use]
    pub const fn is_teacher(self) -> bool {
        matches!(self, Self::Teacher)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub connection_id: String,
    pub username: String,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
    /// Mirrors membership in the room's hand-raise queue.
    pub hand_raised: bool,
}

impl Participant {
    pub fn new(connection_id: String, username: String, role: Role) -> Self {
        Self {
            connection_id,
            username,
            role,
            joined_at: Utc::now(),
            hand_raised: false,
        }
    }
}
