use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use huddle_core::{PrincipalId, Room, RoomId};
use parking_lot::RwLock;

use crate::bus::MessageBus;
use crate::error::StoreError;
use crate::gateway::{room_channel, PersistenceGateway, Subscription};

/// Gateway that keeps everything in process memory.
///
/// "Durable" state lives as long as the gateway. Clones share state, so a
/// clone can stand in for a second service instance in tests.
#[derive(Clone, Default)]
pub struct MemoryGateway {
    rooms: Arc<RwLock<HashMap<RoomId, Room>>>,
    members: Arc<RwLock<HashMap<RoomId, BTreeSet<PrincipalId>>>>,
    bus: Arc<MessageBus>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an existing bus, e.g. one shared with another gateway.
    pub fn with_bus(bus: Arc<MessageBus>) -> Self {
        Self {
            bus,
            ..Self::default()
        }
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// Live bus subscriptions for a room.
    pub fn subscriber_count(&self, room_id: &RoomId) -> usize {
        self.bus.subscriber_count(&room_channel(room_id))
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn create_room(&self, room: &Room) -> Result<(), StoreError> {
        let mut rooms = self.rooms.write();
        if rooms.contains_key(&room.id) {
            return Err(StoreError::Conflict(format!("room {} already exists", room.id)));
        }
        rooms.insert(room.id.clone(), room.clone());
        Ok(())
    }

    async fn get_room(&self, room_id: &RoomId) -> Result<Room, StoreError> {
        self.rooms
            .read()
            .get(room_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("room {room_id}")))
    }

    async fn delete_room(&self, room_id: &RoomId) -> Result<(), StoreError> {
        // Lock order is rooms, then members.
        let mut rooms = self.rooms.write();
        rooms.remove(room_id);
        self.members.write().remove(room_id);
        Ok(())
    }

    async fn list_room_ids(&self) -> Result<Vec<RoomId>, StoreError> {
        let mut ids: Vec<RoomId> = self.rooms.read().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn add_member(&self, room_id: &RoomId, principal: &PrincipalId) -> Result<bool, StoreError> {
        let rooms = self.rooms.read();
        if !rooms.contains_key(room_id) {
            return Err(StoreError::NotFound(format!("room {room_id}")));
        }
        Ok(self
            .members
            .write()
            .entry(room_id.clone())
            .or_default()
            .insert(principal.clone()))
    }

    async fn remove_member(&self, room_id: &RoomId, principal: &PrincipalId) -> Result<bool, StoreError> {
        let mut members = self.members.write();
        let Some(set) = members.get_mut(room_id) else {
            return Ok(false);
        };
        let removed = set.remove(principal);
        if set.is_empty() {
            members.remove(room_id);
        }
        Ok(removed)
    }

    async fn get_members(&self, room_id: &RoomId) -> Result<Vec<PrincipalId>, StoreError> {
        Ok(self
            .members
            .read()
            .get(room_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn is_member(&self, room_id: &RoomId, principal: &PrincipalId) -> Result<bool, StoreError> {
        Ok(self
            .members
            .read()
            .get(room_id)
            .is_some_and(|set| set.contains(principal)))
    }

    async fn remove_all_members(&self, room_id: &RoomId) -> Result<(), StoreError> {
        self.members.write().remove(room_id);
        Ok(())
    }

    async fn subscribe(&self, room_id: &RoomId) -> Result<Subscription, StoreError> {
        Ok(self.bus.subscribe(&room_channel(room_id)))
    }

    async fn publish(&self, room_id: &RoomId, payload: String) -> Result<usize, StoreError> {
        Ok(self.bus.publish(&room_channel(room_id), payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(s: &str) -> PrincipalId {
        PrincipalId::from_raw(s)
    }

    #[tokio::test]
    async fn create_and_get_room() {
        let gw = MemoryGateway::new();
        let room = Room::new("general", principal("U1"), false);
        gw.create_room(&room).await.unwrap();

        let fetched = gw.get_room(&room.id).await.unwrap();
        assert_eq!(fetched, room);
        assert_eq!(gw.list_room_ids().await.unwrap(), vec![room.id.clone()]);
    }

    #[tokio::test]
    async fn duplicate_room_id_conflicts() {
        let gw = MemoryGateway::new();
        let room = Room::new("general", principal("U1"), false);
        gw.create_room(&room).await.unwrap();
        assert!(matches!(gw.create_room(&room).await, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn missing_room_is_not_found() {
        let gw = MemoryGateway::new();
        let result = gw.get_room(&RoomId::from_raw("nope")).await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    async fn created(gw: &MemoryGateway, name: &str) -> RoomId {
        let room = Room::new(name, principal("U1"), false);
        gw.create_room(&room).await.unwrap();
        room.id
    }

    #[tokio::test]
    async fn membership_has_set_semantics() {
        let gw = MemoryGateway::new();
        let room = created(&gw, "general").await;

        assert!(gw.add_member(&room, &principal("U1")).await.unwrap());
        assert!(!gw.add_member(&room, &principal("U1")).await.unwrap());
        assert!(gw.add_member(&room, &principal("U2")).await.unwrap());

        assert_eq!(gw.get_members(&room).await.unwrap().len(), 2);
        assert!(gw.is_member(&room, &principal("U1")).await.unwrap());

        assert!(gw.remove_member(&room, &principal("U1")).await.unwrap());
        assert!(!gw.remove_member(&room, &principal("U1")).await.unwrap());
        assert!(!gw.is_member(&room, &principal("U1")).await.unwrap());
    }

    #[tokio::test]
    async fn delete_room_clears_members() {
        let gw = MemoryGateway::new();
        let room = Room::new("doomed", principal("U1"), true);
        gw.create_room(&room).await.unwrap();
        gw.add_member(&room.id, &principal("U1")).await.unwrap();

        gw.delete_room(&room.id).await.unwrap();

        assert!(gw.get_room(&room.id).await.is_err());
        assert!(gw.get_members(&room.id).await.unwrap().is_empty());
        assert!(gw.list_room_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn members_need_an_existing_room() {
        let gw = MemoryGateway::new();
        let ghost = RoomId::new();
        let err = gw.add_member(&ghost, &principal("U1")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(gw.get_members(&ghost).await.unwrap().is_empty());

        let room = created(&gw, "short-lived").await;
        gw.delete_room(&room).await.unwrap();
        assert!(matches!(
            gw.add_member(&room, &principal("U1")).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(gw.get_members(&room).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_all_members_empties_set() {
        let gw = MemoryGateway::new();
        let room = created(&gw, "crowd").await;
        gw.add_member(&room, &principal("U1")).await.unwrap();
        gw.add_member(&room, &principal("U2")).await.unwrap();
        gw.remove_all_members(&room).await.unwrap();
        assert!(gw.get_members(&room).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn clones_share_state_and_bus() {
        let a = MemoryGateway::new();
        let b = a.clone();
        let room = Room::new("shared", principal("U1"), false);
        a.create_room(&room).await.unwrap();
        assert!(b.get_room(&room.id).await.is_ok());

        let mut sub = b.subscribe(&room.id).await.unwrap();
        assert_eq!(a.publish(&room.id, "ping".into()).await.unwrap(), 1);
        assert_eq!(sub.next_message().await.unwrap().unwrap(), "ping");
        assert_eq!(a.subscriber_count(&room.id), 1);
    }
}
