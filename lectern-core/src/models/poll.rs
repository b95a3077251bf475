use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollStatus {
    Active,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollOption {
    pub id: String,
    pub text: String,
    pub vote_count: u32,
}

/// A poll within one room's lifetime.
///
/// Vote integrity: each connection id votes at most once, a vote targets a
/// known option of an active poll, and the per-option counts always sum to
/// the size of the voter set. Closed polls never mutate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Poll {
    pub id: String,
    pub question: String,
    pub options: Vec<PollOption>,
    /// Connection ids that have voted. Not sent to clients.
    #[serde(skip)]
    pub voters: HashSet<String>,
    pub status: PollStatus,
    pub created_at: DateTime<Utc>,
    pub auto_close_seconds: Option<u64>,
}

impl Poll {
    pub fn new(question: String, options: Vec<String>, auto_close_seconds: Option<u64>) -> Self {
        Self {
            id: super::id::generate_id(),
            question,
            options: options
                .into_iter()
                .map(|text| PollOption {
                    id: super::id::generate_id(),
                    text,
                    vote_count: 0,
                })
                .collect(),
            voters: HashSet::new(),
            status: PollStatus::Active,
            created_at: Utc::now(),
            auto_close_seconds,
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == PollStatus::Active
    }

    /// Record a vote. Returns `false` (and changes nothing) when the poll is
    /// closed, the voter has already voted, or the option is unknown.
    pub fn vote(&mut self, voter_connection_id: &str, option_id: &str) -> bool {
        if !self.is_active() || self.voters.contains(voter_connection_id) {
            return false;
        }
        let Some(option) = self.options.iter_mut().find(|o| o.id == option_id) else {
            return false;
        };
        option.vote_count += 1;
        self.voters.insert(voter_connection_id.to_string());
        true
    }

    /// Transition to closed. Returns `false` if the poll was already closed.
    pub fn close(&mut self) -> bool {
        if self.status == PollStatus::Closed {
            return false;
        }
        self.status = PollStatus::Closed;
        true
    }

    #[must_use]
    pub fn total_votes(&self) -> u32 {
        self.options.iter().map(|o| o.vote_count).sum()
    }
}
