//! Shared domain types for the huddle room engine: branded identifiers,
//! room records and the events that travel over the room bus.

pub mod events;
pub mod ids;
pub mod room;

pub use events::{RoomEvent, RoomEventKind};
pub use ids::{PrincipalId, RoomId};
pub use room::{Room, RoomStats};
