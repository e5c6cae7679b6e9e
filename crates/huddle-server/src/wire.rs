//! JSON shapes sent to clients.

use huddle_core::{Room, RoomEvent, RoomEventKind, RoomId, RoomStats};
use serde_json::{json, Value};

/// Notification type for streamed room events.
pub const ROOM_EVENT: &str = "room.event";

/// Notification frame for a presence event. Other kinds have no client
/// representation and yield `None`.
pub fn room_event_frame(event: &RoomEvent) -> Option<Value> {
    if !event.is_presence() {
        return None;
    }
    let key = if event.kind == RoomEventKind::UserJoined {
        "userJoined"
    } else {
        "userLeft"
    };
    Some(json!({
        "type": ROOM_EVENT,
        "roomId": event.room_id,
        "event": { key: { "userId": event.user_id } },
    }))
}

pub fn room_json(room: &Room) -> Value {
    json!({
        "id": room.id,
        "name": room.name,
        "createdBy": room.created_by,
        "createdAt": room.created_at.to_rfc3339(),
        "isPrivate": room.is_private,
    })
}

pub fn stats_json(stats: &RoomStats) -> Value {
    json!({
        "room": room_json(&stats.room),
        "totalMembers": stats.total_members,
        "activeMembers": stats.active_members,
    })
}

pub fn join_ack(room_id: &RoomId) -> Value {
    json!({ "joined": true, "roomId": room_id })
}
