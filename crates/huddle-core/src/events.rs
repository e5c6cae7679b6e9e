use serde::{Deserialize, Serialize};

use crate::ids::{PrincipalId, RoomId};

/// What happened in a room.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomEventKind {
    UserJoined,
    UserLeft,
    RoomDeleted,
    /// Chat messages ride the same bus but are delivered by a separate path.
    MessagePosted,
    RoomUpdated,
}

impl RoomEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserJoined => "user_joined",
            Self::UserLeft => "user_left",
            Self::RoomDeleted => "room_deleted",
            Self::MessagePosted => "message_posted",
            Self::RoomUpdated => "room_updated",
        }
    }
}

/// Event published on a room's bus channel.
///
/// Serialized as a flat JSON object: `{"type": "user_joined", "room_id": ..,
/// "user_id": .., "payload": ..}`. `payload` is omitted when absent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoomEvent {
    #[serde(rename = "type")]
    pub kind: RoomEventKind,
    pub room_id: RoomId,
    pub user_id: PrincipalId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl RoomEvent {
    fn new(kind: RoomEventKind, room_id: RoomId, user_id: PrincipalId) -> Self {
        Self {
            kind,
            room_id,
            user_id,
            payload: None,
        }
    }

    pub fn user_joined(room_id: RoomId, user_id: PrincipalId) -> Self {
        Self::new(RoomEventKind::UserJoined, room_id, user_id)
    }

    pub fn user_left(room_id: RoomId, user_id: PrincipalId) -> Self {
        Self::new(RoomEventKind::UserLeft, room_id, user_id)
    }

    pub fn room_deleted(room_id: RoomId, actor: PrincipalId) -> Self {
        Self::new(RoomEventKind::RoomDeleted, room_id, actor)
    }

    pub fn message_posted(room_id: RoomId, author: PrincipalId, body: serde_json::Value) -> Self {
        Self::new(RoomEventKind::MessagePosted, room_id, author).with_payload(body)
    }

    pub fn room_updated(room_id: RoomId, actor: PrincipalId) -> Self {
        Self::new(RoomEventKind::RoomUpdated, room_id, actor)
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Presence events are the ones streamed to joined clients.
    pub fn is_presence(&self) -> bool {
        matches!(self.kind, RoomEventKind::UserJoined | RoomEventKind::UserLeft)
    }
}
