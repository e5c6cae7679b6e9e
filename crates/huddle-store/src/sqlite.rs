use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use huddle_core::{PrincipalId, Room, RoomId};
use rusqlite::{params, OptionalExtension};

use crate::bus::MessageBus;
use crate::database::Database;
use crate::error::StoreError;
use crate::gateway::{room_channel, PersistenceGateway, Subscription};

/// Gateway that persists rooms and memberships in SQLite and fans events out
/// over an in-process [`MessageBus`].
///
/// Records survive restarts. The bus does not cross process boundaries, so
/// several processes sharing one database file will not see each other's
/// events.
#[derive(Clone)]
pub struct SqliteGateway {
    db: Database,
    bus: Arc<MessageBus>,
}

impl SqliteGateway {
    pub fn new(db: Database) -> Self {
        Self::with_bus(db, Arc::new(MessageBus::new()))
    }

    pub fn with_bus(db: Database, bus: Arc<MessageBus>) -> Self {
        Self { db, bus }
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }
}

// Fixed-width so that lexical order matches chronological order.
fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn row_to_room(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, String, String, bool)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn build_room(raw: (String, String, String, String, bool)) -> Result<Room, StoreError> {
    let (id, name, created_by, created_at, is_private) = raw;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| StoreError::Serialization(format!("created_at: {e}")))?
        .with_timezone(&Utc);
    Ok(Room {
        id: RoomId::from_raw(id),
        name,
        created_by: PrincipalId::from_raw(created_by),
        created_at,
        is_private,
    })
}

#[async_trait]
impl PersistenceGateway for SqliteGateway {
    async fn create_room(&self, room: &Room) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO rooms (id, name, created_by, created_at, is_private)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    room.id.as_str(),
                    room.name,
                    room.created_by.as_str(),
                    timestamp(&room.created_at),
                    room.is_private,
                ],
            )?;
            if inserted == 0 {
                return Err(StoreError::Conflict(format!("room {} already exists", room.id)));
            }
            Ok(())
        })
    }

    async fn get_room(&self, room_id: &RoomId) -> Result<Room, StoreError> {
        let raw = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, created_by, created_at, is_private FROM rooms WHERE id = ?1",
                [room_id.as_str()],
                row_to_room,
            )
            .optional()
            .map_err(StoreError::from)
        })?;
        match raw {
            Some(raw) => build_room(raw),
            None => Err(StoreError::NotFound(format!("room {room_id}"))),
        }
    }

    /// Memberships go with the room through `ON DELETE CASCADE`.
    async fn delete_room(&self, room_id: &RoomId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM rooms WHERE id = ?1", [room_id.as_str()])?;
            Ok(())
        })
    }

    async fn list_room_ids(&self) -> Result<Vec<RoomId>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM rooms ORDER BY created_at, id")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .map(|r| r.map(RoomId::from_raw))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    async fn add_member(&self, room_id: &RoomId, principal: &PrincipalId) -> Result<bool, StoreError> {
        self.db.with_tx(|tx| {
            let exists: Option<i64> = tx
                .query_row("SELECT 1 FROM rooms WHERE id = ?1", [room_id.as_str()], |row| row.get(0))
                .optional()?;
            if exists.is_none() {
                return Err(StoreError::NotFound(format!("room {room_id}")));
            }
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO room_members (room_id, principal_id, joined_at)
                 VALUES (?1, ?2, ?3)",
                params![room_id.as_str(), principal.as_str(), timestamp(&Utc::now())],
            )?;
            Ok(inserted > 0)
        })
    }

    async fn remove_member(&self, room_id: &RoomId, principal: &PrincipalId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM room_members WHERE room_id = ?1 AND principal_id = ?2",
                params![room_id.as_str(), principal.as_str()],
            )?;
            Ok(removed > 0)
        })
    }

    async fn get_members(&self, room_id: &RoomId) -> Result<Vec<PrincipalId>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT principal_id FROM room_members WHERE room_id = ?1 ORDER BY principal_id",
            )?;
            let members = stmt
                .query_map([room_id.as_str()], |row| row.get::<_, String>(0))?
                .map(|r| r.map(PrincipalId::from_raw))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(members)
        })
    }

    async fn is_member(&self, room_id: &RoomId, principal: &PrincipalId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM room_members WHERE room_id = ?1 AND principal_id = ?2",
                    params![room_id.as_str(), principal.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    async fn remove_all_members(&self, room_id: &RoomId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM room_members WHERE room_id = ?1", [room_id.as_str()])?;
            Ok(())
        })
    }

    async fn subscribe(&self, room_id: &RoomId) -> Result<Subscription, StoreError> {
        Ok(self.bus.subscribe(&room_channel(room_id)))
    }

    async fn publish(&self, room_id: &RoomId, payload: String) -> Result<usize, StoreError> {
        Ok(self.bus.publish(&room_channel(room_id), payload))
    }
}
