use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{PrincipalId, RoomId};

/// Longest accepted room name, in characters.
pub const MAX_ROOM_NAME_LEN: usize = 100;

/// A durably persisted chat room. Only created and deleted, never edited.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub created_by: PrincipalId,
    pub created_at: DateTime<Utc>,
    pub is_private: bool,
}

impl Room {
    /// Build a new room record with a freshly generated ID.
    pub fn new(name: impl Into<String>, created_by: PrincipalId, is_private: bool) -> Self {
        Self {
            id: RoomId::new(),
            name: name.into(),
            created_by,
            created_at: Utc::now(),
            is_private,
        }
    }
}

/// Read-only view combining durable and process-local membership counts.
///
/// `active_members` only counts streams attached to this process; other
/// instances serving the same room are not visible here.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RoomStats {
    pub room: Room,
    pub total_members: usize,
    pub active_members: usize,
}
