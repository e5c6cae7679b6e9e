use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use huddle_core::{PrincipalId, Room, RoomId};

use crate::error::StoreError;

/// Bus channel name for a room.
pub fn room_channel(room_id: &RoomId) -> String {
    format!("room:{room_id}")
}

/// Live subscription to one bus channel.
///
/// Yields raw payloads in publish order. `None` means the channel is gone.
/// Dropping the subscription unsubscribes.
pub struct Subscription {
    channel: String,
    inner: BoxStream<'static, Result<String, StoreError>>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, inner: BoxStream<'static, Result<String, StoreError>>) -> Self {
        Self {
            channel: channel.into(),
            inner,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub async fn next_message(&mut self) -> Option<Result<String, StoreError>> {
        self.inner.next().await
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

/// Durable key/value, set and pub/sub primitives the room engine relies on.
///
/// Membership methods have set semantics; `add_member` and `remove_member`
/// report whether the set actually changed.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn create_room(&self, room: &Room) -> Result<(), StoreError>;

    /// Fails with [`StoreError::NotFound`] when the room does not exist.
    async fn get_room(&self, room_id: &RoomId) -> Result<Room, StoreError>;

    /// Removes the room record, its membership set and its index entry.
    async fn delete_room(&self, room_id: &RoomId) -> Result<(), StoreError>;

    async fn list_room_ids(&self) -> Result<Vec<RoomId>, StoreError>;

    /// Fails with [`StoreError::NotFound`] when the room does not exist, so
    /// a join racing a delete leaves no orphan membership.
    async fn add_member(&self, room_id: &RoomId, principal: &PrincipalId) -> Result<bool, StoreError>;

    async fn remove_member(&self, room_id: &RoomId, principal: &PrincipalId) -> Result<bool, StoreError>;

    async fn get_members(&self, room_id: &RoomId) -> Result<Vec<PrincipalId>, StoreError>;

    async fn is_member(&self, room_id: &RoomId, principal: &PrincipalId) -> Result<bool, StoreError>;

    async fn remove_all_members(&self, room_id: &RoomId) -> Result<(), StoreError>;

    async fn subscribe(&self, room_id: &RoomId) -> Result<Subscription, StoreError>;

    /// Best-effort fan-out. Returns the number of subscribers reached, which
    /// may be zero.
    async fn publish(&self, room_id: &RoomId, payload: String) -> Result<usize, StoreError>;
}
