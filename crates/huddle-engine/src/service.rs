use std::sync::Arc;
use std::time::Duration;

use huddle_core::room::MAX_ROOM_NAME_LEN;
use huddle_core::{PrincipalId, Room, RoomEvent, RoomId, RoomStats};
use huddle_store::{PersistenceGateway, StoreError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bridge::EventBridge;
use crate::error::RoomError;
use crate::registry::{LocalJoin, RoomRegistry};

/// Engine tuning knobs.
#[derive(Clone, Debug)]
pub struct RoomConfig {
    /// Capacity of each member's event channel.
    pub event_buffer: usize,
    /// Upper bound on rooms with local members. 0 means unlimited.
    pub max_active_rooms: usize,
    /// How long a leave waits for the room's bridge to stop.
    pub bridge_shutdown_timeout: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            event_buffer: 10,
            max_active_rooms: 0,
            bridge_shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Room lifecycle orchestration over a gateway, the local registry and the
/// per-room event bridges.
pub struct RoomService {
    gateway: Arc<dyn PersistenceGateway>,
    registry: Arc<RoomRegistry>,
    bridge: EventBridge,
    config: RoomConfig,
}

impl RoomService {
    pub fn new(gateway: Arc<dyn PersistenceGateway>, config: RoomConfig) -> Self {
        let registry = Arc::new(RoomRegistry::new(config.event_buffer, config.max_active_rooms));
        let bridge = EventBridge::new(gateway.clone(), registry.clone());
        Self {
            gateway,
            registry,
            bridge,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    pub async fn create_room(
        &self,
        name: &str,
        creator: &PrincipalId,
        is_private: bool,
    ) -> Result<Room, RoomError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RoomError::Validation("room name must not be empty".into()));
        }
        if name.chars().count() > MAX_ROOM_NAME_LEN {
            return Err(RoomError::Validation(format!(
                "room name exceeds {MAX_ROOM_NAME_LEN} characters"
            )));
        }

        let room = Room::new(name, creator.clone(), is_private);
        self.gateway.create_room(&room).await.map_err(RoomError::Persistence)?;

        info!(room_id = %room.id, creator = %creator, is_private, "Room created");
        Ok(room)
    }

    /// Join `room_id` and return the member's event stream.
    ///
    /// Either the principal ends up durably and locally joined with a live
    /// bridge behind the stream, or nothing this call added remains.
    pub async fn join_room(
        &self,
        room_id: &RoomId,
        principal: &PrincipalId,
    ) -> Result<mpsc::Receiver<RoomEvent>, RoomError> {
        self.gateway.get_room(room_id).await?;

        // A concurrent delete surfaces here as NotFound.
        let added = self.gateway.add_member(room_id, principal).await?;

        let join = match self.registry.register_local_join(room_id, principal).await {
            Ok(join) => join,
            Err(e) => {
                self.rollback_member(room_id, principal, added).await;
                return Err(e);
            }
        };

        let events = match self.activate(room_id, principal, join).await {
            Ok(events) => events,
            Err(e) => {
                self.rollback_member(room_id, principal, added).await;
                return Err(e);
            }
        };

        info!(room_id = %room_id, principal = %principal, "Joined room");
        self.publish(RoomEvent::user_joined(room_id.clone(), principal.clone())).await;
        Ok(events)
    }

    /// Ensure the room's bridge is running before the join completes.
    async fn activate(
        &self,
        room_id: &RoomId,
        principal: &PrincipalId,
        join: LocalJoin,
    ) -> Result<mpsc::Receiver<RoomEvent>, RoomError> {
        let LocalJoin {
            events,
            first_joiner,
            generation,
            cancel,
            mut ready,
        } = join;

        if !first_joiner {
            // Another join is starting the bridge; its failure closes `ready`.
            return match ready.wait_for(|r| *r).await {
                Ok(_) => Ok(events),
                Err(_) => {
                    self.registry.register_local_leave(room_id, principal);
                    Err(RoomError::Subscription(format!(
                        "room {room_id}: event bridge failed to start"
                    )))
                }
            };
        }

        let handle = match self.bridge.start(room_id.clone(), generation, cancel).await {
            Ok(handle) => handle,
            Err(e) => {
                self.registry.abandon(room_id, generation);
                return Err(e);
            }
        };

        match self.registry.attach_bridge(room_id, generation, handle) {
            Ok(()) => {
                debug!(room_id = %room_id, generation, "Event bridge attached");
                Ok(events)
            }
            Err(handle) => {
                // Context drained while the bridge was starting.
                handle.abort();
                let _ = handle.await;
                self.registry.release(room_id, generation);
                Err(RoomError::Subscription(format!(
                    "room {room_id}: closed while joining"
                )))
            }
        }
    }

    async fn rollback_member(&self, room_id: &RoomId, principal: &PrincipalId, added: bool) {
        if !added {
            return;
        }
        if let Err(e) = self.gateway.remove_member(room_id, principal).await {
            warn!(room_id = %room_id, principal = %principal, error = %e, "Failed to roll back membership");
        }
    }

    /// Leave `room_id`. Leaving a room one is not in is a no-op.
    pub async fn leave_room(&self, room_id: &RoomId, principal: &PrincipalId) -> Result<(), RoomError> {
        let removed = self.gateway.remove_member(room_id, principal).await;

        let local = self.registry.register_local_leave(room_id, principal);
        if let Some(teardown) = local.teardown {
            let clean = teardown.wait(&self.registry, self.config.bridge_shutdown_timeout).await;
            debug!(room_id = %room_id, clean, "Room torn down");
        }

        let removed = removed.map_err(RoomError::Persistence)?;
        if !removed && !local.was_member {
            debug!(room_id = %room_id, principal = %principal, "Leave by non-member ignored");
            return Ok(());
        }

        info!(room_id = %room_id, principal = %principal, "Left room");
        self.publish(RoomEvent::user_left(room_id.clone(), principal.clone())).await;
        Ok(())
    }

    pub async fn delete_room(&self, room_id: &RoomId, actor: &PrincipalId) -> Result<(), RoomError> {
        self.gateway.get_room(room_id).await?;
        self.publish(RoomEvent::room_deleted(room_id.clone(), actor.clone())).await;
        self.gateway.delete_room(room_id).await.map_err(RoomError::Persistence)?;
        info!(room_id = %room_id, actor = %actor, "Room deleted");
        Ok(())
    }

    pub async fn get_room(&self, room_id: &RoomId) -> Result<Room, RoomError> {
        Ok(self.gateway.get_room(room_id).await?)
    }

    pub async fn list_rooms(&self) -> Result<Vec<Room>, RoomError> {
        let ids = self.gateway.list_room_ids().await.map_err(RoomError::Persistence)?;
        let mut rooms = Vec::with_capacity(ids.len());
        for id in ids {
            match self.gateway.get_room(&id).await {
                Ok(room) => rooms.push(room),
                Err(StoreError::NotFound(_)) => {
                    debug!(room_id = %id, "Room vanished while listing");
                }
                Err(e) => return Err(RoomError::Persistence(e)),
            }
        }
        Ok(rooms)
    }

    pub async fn get_room_members(&self, room_id: &RoomId) -> Result<Vec<PrincipalId>, RoomError> {
        self.gateway.get_room(room_id).await?;
        self.gateway.get_members(room_id).await.map_err(RoomError::Persistence)
    }

    /// `active_members` counts only streams attached to this process.
    pub async fn room_stats(&self, room_id: &RoomId) -> Result<RoomStats, RoomError> {
        let room = self.gateway.get_room(room_id).await?;
        let total_members = self
            .gateway
            .get_members(room_id)
            .await
            .map_err(RoomError::Persistence)?
            .len();
        Ok(RoomStats {
            room,
            total_members,
            active_members: self.registry.active_count(room_id),
        })
    }

    /// Cancel every bridge. Durable membership is left untouched.
    pub fn shutdown(&self) {
        let rooms = self.registry.shutdown();
        if rooms > 0 {
            info!(rooms, "Room bridges cancelled");
        }
    }

    async fn publish(&self, event: RoomEvent) {
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(room_id = %event.room_id, error = %e, "Failed to encode room event");
                return;
            }
        };
        match self.gateway.publish(&event.room_id, payload).await {
            Ok(receivers) => {
                debug!(room_id = %event.room_id, event = event.kind.as_str(), receivers, "Room event published");
            }
            Err(e) => {
                warn!(room_id = %event.room_id, event = event.kind.as_str(), error = %e, "Failed to publish room event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use huddle_core::RoomEventKind;
    use huddle_store::{MemoryGateway, Subscription};

    use super::*;

    fn user(s: &str) -> PrincipalId {
        PrincipalId::from_raw(s)
    }

    fn service_with(gateway: MemoryGateway, config: RoomConfig) -> RoomService {
        RoomService::new(Arc::new(gateway), config)
    }

    fn service() -> (RoomService, MemoryGateway) {
        let gw = MemoryGateway::new();
        (service_with(gw.clone(), RoomConfig::default()), gw)
    }

    async fn next_event(rx: &mut mpsc::Receiver<RoomEvent>) -> RoomEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("stream closed")
    }

    /// Gateway wrapper that fails selected operations on demand.
    #[derive(Default)]
    struct FaultyGateway {
        inner: MemoryGateway,
        fail_subscribe: AtomicBool,
        fail_add: AtomicBool,
        fail_remove: AtomicBool,
        fail_publish: AtomicBool,
        delete_before_add: AtomicBool,
    }

    fn unavailable() -> StoreError {
        StoreError::Unavailable("injected".into())
    }

    #[async_trait]
    impl PersistenceGateway for FaultyGateway {
        async fn create_room(&self, room: &Room) -> Result<(), StoreError> {
            self.inner.create_room(room).await
        }
        async fn get_room(&self, room_id: &RoomId) -> Result<Room, StoreError> {
            self.inner.get_room(room_id).await
        }
        async fn delete_room(&self, room_id: &RoomId) -> Result<(), StoreError> {
            self.inner.delete_room(room_id).await
        }
        async fn list_room_ids(&self) -> Result<Vec<RoomId>, StoreError> {
            self.inner.list_room_ids().await
        }
        async fn add_member(&self, room_id: &RoomId, principal: &PrincipalId) -> Result<bool, StoreError> {
            if self.fail_add.load(Ordering::SeqCst) {
                return Err(unavailable());
            }
            if self.delete_before_add.load(Ordering::SeqCst) {
                self.inner.delete_room(room_id).await?;
            }
            self.inner.add_member(room_id, principal).await
        }
        async fn remove_member(&self, room_id: &RoomId, principal: &PrincipalId) -> Result<bool, StoreError> {
            if self.fail_remove.load(Ordering::SeqCst) {
                return Err(unavailable());
            }
            self.inner.remove_member(room_id, principal).await
        }
        async fn get_members(&self, room_id: &RoomId) -> Result<Vec<PrincipalId>, StoreError> {
            self.inner.get_members(room_id).await
        }
        async fn is_member(&self, room_id: &RoomId, principal: &PrincipalId) -> Result<bool, StoreError> {
            self.inner.is_member(room_id, principal).await
        }
        async fn remove_all_members(&self, room_id: &RoomId) -> Result<(), StoreError> {
            self.inner.remove_all_members(room_id).await
        }
        async fn subscribe(&self, room_id: &RoomId) -> Result<Subscription, StoreError> {
            if self.fail_subscribe.load(Ordering::SeqCst) {
                return Err(unavailable());
            }
            self.inner.subscribe(room_id).await
        }
        async fn publish(&self, room_id: &RoomId, payload: String) -> Result<usize, StoreError> {
            if self.fail_publish.load(Ordering::SeqCst) {
                return Err(unavailable());
            }
            self.inner.publish(room_id, payload).await
        }
    }

    #[tokio::test]
    async fn create_room_trims_and_persists() {
        let (svc, gw) = service();
        let room = svc.create_room("  general ", &user("U1"), false).await.unwrap();
        assert_eq!(room.name, "general");
        assert_eq!(room.created_by, user("U1"));
        assert!(!room.is_private);
        assert_eq!(gw.get_room(&room.id).await.unwrap(), room);
    }

    #[tokio::test]
    async fn create_room_rejects_bad_names() {
        let (svc, gw) = service();
        assert!(matches!(
            svc.create_room("   ", &user("U1"), false).await,
            Err(RoomError::Validation(_))
        ));
        let long = "x".repeat(MAX_ROOM_NAME_LEN + 1);
        assert!(matches!(
            svc.create_room(&long, &user("U1"), false).await,
            Err(RoomError::Validation(_))
        ));
        assert!(gw.list_room_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn join_then_leave_scenario() {
        let (svc, gw) = service();
        let room = svc.create_room("general", &user("U1"), false).await.unwrap();

        let mut u1 = svc.join_room(&room.id, &user("U1")).await.unwrap();
        let own = next_event(&mut u1).await;
        assert_eq!(own.kind, RoomEventKind::UserJoined);
        assert_eq!(own.user_id, user("U1"));

        let mut u2 = svc.join_room(&room.id, &user("U2")).await.unwrap();
        let joined = next_event(&mut u1).await;
        assert_eq!(joined.kind, RoomEventKind::UserJoined);
        assert_eq!(joined.user_id, user("U2"));
        assert_eq!(next_event(&mut u2).await.user_id, user("U2"));

        svc.leave_room(&room.id, &user("U2")).await.unwrap();
        let left = next_event(&mut u1).await;
        assert_eq!(left.kind, RoomEventKind::UserLeft);
        assert_eq!(left.user_id, user("U2"));
        assert!(u2.recv().await.is_none());

        assert_eq!(gw.get_members(&room.id).await.unwrap(), vec![user("U1")]);
        assert_eq!(gw.subscriber_count(&room.id), 1);
    }

    #[tokio::test]
    async fn sole_member_leave_tears_down_bridge() {
        let (svc, gw) = service();
        let room = svc.create_room("solo", &user("U1"), false).await.unwrap();

        let mut rx = svc.join_room(&room.id, &user("U1")).await.unwrap();
        assert!(svc.registry().contains_room(&room.id));
        assert_eq!(gw.subscriber_count(&room.id), 1);
        assert_eq!(next_event(&mut rx).await.kind, RoomEventKind::UserJoined);

        svc.leave_room(&room.id, &user("U1")).await.unwrap();
        assert!(!svc.registry().contains_room(&room.id));
        assert_eq!(gw.subscriber_count(&room.id), 0);
        assert_eq!(gw.bus().total_subscribers(), 0);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn join_unknown_room_has_no_side_effects() {
        let (svc, gw) = service();
        let ghost = RoomId::new();
        let err = svc.join_room(&ghost, &user("U1")).await.unwrap_err();
        assert!(matches!(err, RoomError::NotFound(_)));
        assert!(gw.get_members(&ghost).await.unwrap().is_empty());
        assert!(!svc.registry().contains_room(&ghost));
        assert_eq!(gw.subscriber_count(&ghost), 0);
    }

    #[tokio::test]
    async fn concurrent_joins_both_succeed() {
        let (svc, gw) = service();
        let room = svc.create_room("busy", &user("U1"), false).await.unwrap();
        let (u1, u2) = (user("U1"), user("U2"));

        let (a, b) = tokio::join!(svc.join_room(&room.id, &u1), svc.join_room(&room.id, &u2));
        let mut a = a.unwrap();
        let mut b = b.unwrap();

        let mut members = gw.get_members(&room.id).await.unwrap();
        members.sort();
        assert_eq!(members, vec![u1.clone(), u2.clone()]);
        assert_eq!(svc.registry().active_count(&room.id), 2);
        assert_eq!(gw.subscriber_count(&room.id), 1);

        // Each joiner hears about the other.
        let seen_by_a = [next_event(&mut a).await.user_id, next_event(&mut a).await.user_id];
        let seen_by_b = [next_event(&mut b).await.user_id, next_event(&mut b).await.user_id];
        assert!(seen_by_a.contains(&u2), "a saw {seen_by_a:?}");
        assert!(seen_by_b.contains(&u1), "b saw {seen_by_b:?}");

        // Later events reach both.
        let _u3 = svc.join_room(&room.id, &user("U3")).await.unwrap();
        assert_eq!(next_event(&mut a).await.user_id, user("U3"));
        assert_eq!(next_event(&mut b).await.user_id, user("U3"));
    }

    #[tokio::test]
    async fn rejoin_during_teardown_keeps_one_subscription() {
        let (svc, gw) = service();
        let room = svc.create_room("churn", &user("U1"), false).await.unwrap();
        let (u1, u2) = (user("U1"), user("U2"));
        let mut first = svc.join_room(&room.id, &u1).await.unwrap();
        next_event(&mut first).await;

        let (left, (subscribers, joined)) = tokio::join!(svc.leave_room(&room.id, &u1), async {
            let joined = svc.join_room(&room.id, &u2).await;
            (gw.subscriber_count(&room.id), joined)
        });
        left.unwrap();
        let _second = joined.unwrap();

        assert_eq!(subscribers, 1);
        assert_eq!(gw.subscriber_count(&room.id), 1);
        assert!(svc.registry().is_active(&room.id, &u2));
        assert!(!svc.registry().is_draining(&room.id));
        assert!(first.recv().await.is_none());
        assert_eq!(gw.get_members(&room.id).await.unwrap(), vec![u2.clone()]);
    }

    #[tokio::test]
    async fn repeated_churn_never_doubles_bridge() {
        let (svc, gw) = service();
        let room = svc.create_room("churn", &user("U1"), false).await.unwrap();
        let (u1, u2) = (user("U1"), user("U2"));
        let mut streams = vec![svc.join_room(&room.id, &u1).await.unwrap()];

        for round in 0..10 {
            let (leaver, joiner) = if round % 2 == 0 { (&u1, &u2) } else { (&u2, &u1) };
            let (left, joined) = tokio::join!(svc.leave_room(&room.id, leaver), async {
                let joined = svc.join_room(&room.id, joiner).await;
                assert!(gw.subscriber_count(&room.id) <= 1);
                joined
            });
            left.unwrap();
            streams.push(joined.unwrap());
            assert_eq!(gw.subscriber_count(&room.id), 1, "round {round}");
        }
        assert_eq!(svc.registry().active_count(&room.id), 1);
    }

    #[tokio::test]
    async fn leave_by_non_member_publishes_nothing() {
        let (svc, gw) = service();
        let room = svc.create_room("quiet", &user("U1"), false).await.unwrap();
        let mut rx = svc.join_room(&room.id, &user("U1")).await.unwrap();
        next_event(&mut rx).await;

        svc.leave_room(&room.id, &user("stranger")).await.unwrap();
        svc.leave_room(&RoomId::new(), &user("U1")).await.unwrap();

        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(gw.get_members(&room.id).await.unwrap(), vec![user("U1")]);
    }

    #[tokio::test]
    async fn slow_consumer_gets_at_most_capacity() {
        let gw = MemoryGateway::new();
        let svc = service_with(
            gw.clone(),
            RoomConfig {
                event_buffer: 3,
                ..RoomConfig::default()
            },
        );
        let room = svc.create_room("flood", &user("U1"), false).await.unwrap();
        let mut rx = svc.join_room(&room.id, &user("U1")).await.unwrap();

        for i in 0..20 {
            let event = RoomEvent::user_joined(room.id.clone(), user(&format!("X{i}")));
            gw.publish(&room.id, serde_json::to_string(&event).unwrap()).await.unwrap();
        }
        // Let the bridge drain the bus.
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }

        let mut delivered = 0;
        while rx.try_recv().is_ok() {
            delivered += 1;
        }
        assert!(delivered <= 3, "delivered {delivered}");
        assert!(delivered > 0);
    }

    #[tokio::test]
    async fn bridge_failure_rolls_back_membership() {
        let gw = Arc::new(FaultyGateway::default());
        gw.fail_subscribe.store(true, Ordering::SeqCst);
        let svc = RoomService::new(gw.clone(), RoomConfig::default());
        let room = svc.create_room("fragile", &user("U1"), false).await.unwrap();

        let err = svc.join_room(&room.id, &user("U1")).await.unwrap_err();
        assert!(matches!(err, RoomError::Subscription(_)));
        assert!(err.is_internal());
        assert!(gw.get_members(&room.id).await.unwrap().is_empty());
        assert!(!svc.registry().contains_room(&room.id));
    }

    #[tokio::test]
    async fn rollback_keeps_prior_durable_membership() {
        let gw = Arc::new(FaultyGateway::default());
        let svc = RoomService::new(gw.clone(), RoomConfig::default());
        let room = svc.create_room("sticky", &user("U1"), false).await.unwrap();
        gw.add_member(&room.id, &user("U1")).await.unwrap();

        gw.fail_subscribe.store(true, Ordering::SeqCst);
        assert!(svc.join_room(&room.id, &user("U1")).await.is_err());
        assert_eq!(gw.get_members(&room.id).await.unwrap(), vec![user("U1")]);
    }

    #[tokio::test]
    async fn capacity_error_rolls_back_membership() {
        let gw = MemoryGateway::new();
        let svc = service_with(
            gw.clone(),
            RoomConfig {
                max_active_rooms: 1,
                ..RoomConfig::default()
            },
        );
        let a = svc.create_room("a", &user("U1"), false).await.unwrap();
        let b = svc.create_room("b", &user("U1"), false).await.unwrap();

        let _rx = svc.join_room(&a.id, &user("U1")).await.unwrap();
        let err = svc.join_room(&b.id, &user("U2")).await.unwrap_err();
        assert!(matches!(err, RoomError::Capacity(_)));
        assert!(gw.get_members(&b.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn durable_add_failure_leaves_nothing_behind() {
        let gw = Arc::new(FaultyGateway::default());
        let svc = RoomService::new(gw.clone(), RoomConfig::default());
        let room = svc.create_room("r", &user("U1"), false).await.unwrap();

        gw.fail_add.store(true, Ordering::SeqCst);
        let err = svc.join_room(&room.id, &user("U1")).await.unwrap_err();
        assert!(matches!(err, RoomError::Persistence(_)));
        assert!(!svc.registry().contains_room(&room.id));
    }

    #[tokio::test]
    async fn join_racing_delete_leaves_no_membership() {
        let gw = Arc::new(FaultyGateway::default());
        let svc = RoomService::new(gw.clone(), RoomConfig::default());
        let room = svc.create_room("doomed", &user("U1"), false).await.unwrap();

        gw.delete_before_add.store(true, Ordering::SeqCst);
        let err = svc.join_room(&room.id, &user("U1")).await.unwrap_err();
        assert!(matches!(err, RoomError::NotFound(_)));
        assert!(gw.get_members(&room.id).await.unwrap().is_empty());
        assert!(!svc.registry().contains_room(&room.id));
        assert_eq!(gw.inner.subscriber_count(&room.id), 0);
    }

    #[tokio::test]
    async fn leave_releases_locally_when_durable_remove_fails() {
        let gw = Arc::new(FaultyGateway::default());
        let svc = RoomService::new(gw.clone(), RoomConfig::default());
        let room = svc.create_room("r", &user("U1"), false).await.unwrap();
        let _rx = svc.join_room(&room.id, &user("U1")).await.unwrap();

        gw.fail_remove.store(true, Ordering::SeqCst);
        let err = svc.leave_room(&room.id, &user("U1")).await.unwrap_err();
        assert!(matches!(err, RoomError::Persistence(_)));
        assert!(!svc.registry().contains_room(&room.id));
        assert_eq!(gw.inner.subscriber_count(&room.id), 0);
    }

    #[tokio::test]
    async fn publish_failure_does_not_fail_join() {
        let gw = Arc::new(FaultyGateway::default());
        gw.fail_publish.store(true, Ordering::SeqCst);
        let svc = RoomService::new(gw.clone(), RoomConfig::default());
        let room = svc.create_room("r", &user("U1"), false).await.unwrap();
        assert!(svc.join_room(&room.id, &user("U1")).await.is_ok());
        assert!(svc.leave_room(&room.id, &user("U1")).await.is_ok());
    }

    #[tokio::test]
    async fn delete_room_notifies_and_removes() {
        let (svc, gw) = service();
        let room = svc.create_room("doomed", &user("U1"), false).await.unwrap();
        gw.add_member(&room.id, &user("U2")).await.unwrap();

        let mut watcher = gw.subscribe(&room.id).await.unwrap();
        svc.delete_room(&room.id, &user("U1")).await.unwrap();

        let raw = watcher.next_message().await.unwrap().unwrap();
        let event: RoomEvent = serde_json::from_str(&raw).unwrap();
        assert_eq!(event.kind, RoomEventKind::RoomDeleted);
        assert_eq!(event.user_id, user("U1"));

        assert!(matches!(svc.get_room(&room.id).await, Err(RoomError::NotFound(_))));
        assert!(gw.get_members(&room.id).await.unwrap().is_empty());
        assert!(matches!(
            svc.delete_room(&room.id, &user("U1")).await,
            Err(RoomError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn stats_combine_durable_and_local() {
        let (svc, gw) = service();
        let room = svc.create_room("stats", &user("U1"), true).await.unwrap();
        gw.add_member(&room.id, &user("offline")).await.unwrap();
        let _rx = svc.join_room(&room.id, &user("U1")).await.unwrap();

        let stats = svc.room_stats(&room.id).await.unwrap();
        assert_eq!(stats.room.id, room.id);
        assert_eq!(stats.total_members, 2);
        assert_eq!(stats.active_members, 1);

        assert!(matches!(
            svc.room_stats(&RoomId::new()).await,
            Err(RoomError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_and_members_passthroughs() {
        let (svc, _gw) = service();
        let a = svc.create_room("a", &user("U1"), false).await.unwrap();
        let b = svc.create_room("b", &user("U1"), false).await.unwrap();
        let _rx = svc.join_room(&b.id, &user("U2")).await.unwrap();

        let mut ids: Vec<RoomId> = svc.list_rooms().await.unwrap().into_iter().map(|r| r.id).collect();
        ids.sort();
        let mut expected = vec![a.id.clone(), b.id.clone()];
        expected.sort();
        assert_eq!(ids, expected);

        assert_eq!(svc.get_room_members(&b.id).await.unwrap(), vec![user("U2")]);
        assert!(svc.get_room_members(&a.id).await.unwrap().is_empty());
        assert!(matches!(
            svc.get_room_members(&RoomId::new()).await,
            Err(RoomError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn shutdown_ends_all_streams() {
        let (svc, gw) = service();
        let room = svc.create_room("r", &user("U1"), false).await.unwrap();
        let mut rx = svc.join_room(&room.id, &user("U1")).await.unwrap();
        next_event(&mut rx).await;

        svc.shutdown();
        assert!(rx.recv().await.is_none());
        // Durable membership is untouched.
        assert_eq!(gw.get_members(&room.id).await.unwrap(), vec![user("U1")]);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;
        use std::collections::BTreeSet;

        #[derive(Clone, Debug)]
        enum Op {
            Join(u8),
            Leave(u8),
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![(0u8..4).prop_map(Op::Join), (0u8..4).prop_map(Op::Leave)]
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(48))]

            #[test]
            fn durable_set_tracks_join_leave(ops in proptest::collection::vec(op(), 0..24)) {
                let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
                rt.block_on(async {
                    let (svc, gw) = service();
                    let room = svc.create_room("prop", &user("owner"), false).await.unwrap();
                    let mut model = BTreeSet::new();
                    let mut streams = Vec::new();

                    for op in ops {
                        match op {
                            Op::Join(u) => {
                                streams.push(svc.join_room(&room.id, &user(&format!("U{u}"))).await.unwrap());
                                model.insert(format!("U{u}"));
                            }
                            Op::Leave(u) => {
                                svc.leave_room(&room.id, &user(&format!("U{u}"))).await.unwrap();
                                model.remove(&format!("U{u}"));
                            }
                        }
                        let durable: BTreeSet<String> = gw
                            .get_members(&room.id)
                            .await
                            .unwrap()
                            .into_iter()
                            .map(|p| p.as_str().to_string())
                            .collect();
                        prop_assert_eq!(&durable, &model);
                        prop_assert_eq!(svc.registry().contains_room(&room.id), !model.is_empty());
                        prop_assert_eq!(gw.subscriber_count(&room.id), usize::from(!model.is_empty()));
                    }
                    Ok::<(), TestCaseError>(())
                })?;
            }
        }
    }
}
