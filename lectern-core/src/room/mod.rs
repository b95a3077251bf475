pub mod events;
pub mod hub;
pub mod registry;
pub mod service;

pub use events::{ClientCommand, RoomStateSnapshot, ServerEvent};
pub use hub::{ConnectionId, RoomMessageHub};
pub use registry::{Room, RoomRegistry, RoomState};
pub use service::RoomService;
