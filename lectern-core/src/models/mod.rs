pub mod chat;
pub mod hand;
pub mod id;
pub mod participant;
pub mod poll;
pub mod settings;

pub use chat::ChatMessage;
pub use hand::HandRaise;
pub use id::{generate_id, StreamKey};
pub use participant::{Participant, Role};
pub use poll::{Poll, PollOption, PollStatus};
pub use settings::{CodecPolicy, RoomSettings};
