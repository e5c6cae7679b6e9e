//! Process-local directory of rooms with attached streams.
//!
//! A room has a live entry here iff at least one principal holds an open
//! stream for it on this process. The entry owns the cancellation token of
//! the room's event bridge and the sending half of each member's event
//! channel. When the last member leaves, the entry stays behind in a
//! draining state until the bridge has dropped its subscription; joins that
//! arrive meanwhile wait for it to go. All mutation happens under one lock
//! that is never held across `.await`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use huddle_core::{PrincipalId, RoomEvent, RoomId};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::RoomError;

struct RoomContext {
    /// Distinguishes this context from earlier ones for the same room.
    generation: u64,
    members: HashMap<PrincipalId, mpsc::Sender<RoomEvent>>,
    cancel: CancellationToken,
    ready: watch::Sender<bool>,
    bridge: Option<JoinHandle<()>>,
    /// Cancelled, waiting for the bridge to let go of its subscription.
    draining: bool,
    /// Fires once the entry has left the map.
    released: CancellationToken,
}

impl RoomContext {
    fn retire(self) {
        self.cancel.cancel();
        self.released.cancel();
    }
}

/// Result of registering a local join.
pub struct LocalJoin {
    pub events: mpsc::Receiver<RoomEvent>,
    /// This join created the room context; the caller must start its bridge.
    pub first_joiner: bool,
    pub generation: u64,
    pub cancel: CancellationToken,
    /// Flips to `true` once the bridge is subscribed. Closes without
    /// flipping if the bridge never starts.
    pub ready: watch::Receiver<bool>,
}

/// Outcome of [`RoomRegistry::try_register_local_join`].
pub enum Registration {
    Joined(LocalJoin),
    /// The room's previous bridge is still shutting down. Retry once the
    /// token fires.
    Draining(CancellationToken),
}

/// Result of registering a local leave.
pub struct LocalLeave {
    /// The principal held a local stream for the room.
    pub was_member: bool,
    /// Set when this leave emptied the room and cancelled its bridge.
    pub teardown: Option<Teardown>,
}

/// A cancelled bridge whose task may still be finishing.
pub struct Teardown {
    pub room_id: RoomId,
    pub generation: u64,
    bridge: Option<JoinHandle<()>>,
}

impl Teardown {
    /// Wait for the bridge task to exit, then drop the draining context.
    /// Aborts the task if it does not finish within `timeout`. Returns
    /// whether it exited on its own.
    ///
    /// Without a handle the bridge is still being started; whoever is
    /// starting it finishes the teardown.
    pub async fn wait(self, registry: &RoomRegistry, timeout: Duration) -> bool {
        let Some(mut handle) = self.bridge else {
            return true;
        };
        let clean = match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!(room_id = %self.room_id, error = %e, "Event bridge task failed");
                true
            }
            Err(_) => {
                tracing::warn!(
                    room_id = %self.room_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Event bridge did not stop in time, aborting"
                );
                handle.abort();
                let _ = handle.await;
                false
            }
        };
        registry.release(&self.room_id, self.generation);
        clean
    }
}

pub struct RoomRegistry {
    rooms: Mutex<HashMap<RoomId, RoomContext>>,
    next_generation: AtomicU64,
    event_buffer: usize,
    max_active_rooms: usize,
}

impl RoomRegistry {
    /// `event_buffer` is the capacity of each member's event channel.
    /// `max_active_rooms` of 0 means unlimited.
    pub fn new(event_buffer: usize, max_active_rooms: usize) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            event_buffer: event_buffer.max(1),
            max_active_rooms,
        }
    }

    /// Add `principal` to the room's local set, creating the room context if
    /// needed. Waits out a draining context first, so a room never has two
    /// bridges subscribed at once.
    pub async fn register_local_join(
        &self,
        room_id: &RoomId,
        principal: &PrincipalId,
    ) -> Result<LocalJoin, RoomError> {
        loop {
            match self.try_register_local_join(room_id, principal)? {
                Registration::Joined(join) => return Ok(join),
                Registration::Draining(released) => {
                    tracing::debug!(room_id = %room_id, principal = %principal, "Waiting for room teardown");
                    released.cancelled().await;
                }
            }
        }
    }

    /// Non-waiting form of [`register_local_join`](Self::register_local_join).
    /// A principal already present gets a fresh channel; its previous stream
    /// sees end-of-stream.
    pub fn try_register_local_join(
        &self,
        room_id: &RoomId,
        principal: &PrincipalId,
    ) -> Result<Registration, RoomError> {
        let (tx, rx) = mpsc::channel(self.event_buffer);
        let mut rooms = self.rooms.lock();

        if let Some(ctx) = rooms.get_mut(room_id) {
            if ctx.draining {
                return Ok(Registration::Draining(ctx.released.clone()));
            }
            if ctx.members.insert(principal.clone(), tx).is_some() {
                tracing::debug!(room_id = %room_id, principal = %principal, "Replaced existing local stream");
            }
            return Ok(Registration::Joined(LocalJoin {
                events: rx,
                first_joiner: false,
                generation: ctx.generation,
                cancel: ctx.cancel.clone(),
                ready: ctx.ready.subscribe(),
            }));
        }

        if self.max_active_rooms > 0 && rooms.len() >= self.max_active_rooms {
            return Err(RoomError::Capacity(format!(
                "{} rooms already active on this node",
                self.max_active_rooms
            )));
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = watch::channel(false);
        let mut members = HashMap::new();
        members.insert(principal.clone(), tx);
        rooms.insert(
            room_id.clone(),
            RoomContext {
                generation,
                members,
                cancel: cancel.clone(),
                ready: ready_tx,
                bridge: None,
                draining: false,
                released: CancellationToken::new(),
            },
        );

        Ok(Registration::Joined(LocalJoin {
            events: rx,
            first_joiner: true,
            generation,
            cancel,
            ready: ready_rx,
        }))
    }

    /// Remove `principal` from the room's local set. Emptying the set cancels
    /// the bridge and leaves the context draining until
    /// [`release`](Self::release).
    pub fn register_local_leave(&self, room_id: &RoomId, principal: &PrincipalId) -> LocalLeave {
        let mut rooms = self.rooms.lock();
        let ctx = match rooms.get_mut(room_id) {
            Some(ctx) if !ctx.draining => ctx,
            _ => {
                return LocalLeave {
                    was_member: false,
                    teardown: None,
                }
            }
        };

        let was_member = ctx.members.remove(principal).is_some();
        if !ctx.members.is_empty() {
            return LocalLeave {
                was_member,
                teardown: None,
            };
        }

        ctx.draining = true;
        ctx.cancel.cancel();
        LocalLeave {
            was_member,
            teardown: Some(Teardown {
                room_id: room_id.clone(),
                generation: ctx.generation,
                bridge: ctx.bridge.take(),
            }),
        }
    }

    /// Hand the running bridge task to the context it was started for and
    /// mark the room ready. Gives the handle back if that context is gone or
    /// draining.
    pub fn attach_bridge(
        &self,
        room_id: &RoomId,
        generation: u64,
        handle: JoinHandle<()>,
    ) -> Result<(), JoinHandle<()>> {
        let mut rooms = self.rooms.lock();
        match rooms.get_mut(room_id) {
            Some(ctx) if ctx.generation == generation && !ctx.draining => {
                ctx.bridge = Some(handle);
                ctx.ready.send_replace(true);
                Ok(())
            }
            _ => Err(handle),
        }
    }

    /// Drop the draining context `generation`. Call only once its bridge has
    /// released the subscription.
    pub fn release(&self, room_id: &RoomId, generation: u64) -> bool {
        let mut rooms = self.rooms.lock();
        match rooms.get(room_id) {
            Some(ctx) if ctx.generation == generation && ctx.draining => {
                if let Some(ctx) = rooms.remove(room_id) {
                    ctx.retire();
                }
                true
            }
            _ => false,
        }
    }

    /// Drop the context created as `generation`, closing every member
    /// channel. Used when its bridge cannot start or dies.
    pub fn abandon(&self, room_id: &RoomId, generation: u64) -> bool {
        let mut rooms = self.rooms.lock();
        match rooms.get(room_id) {
            Some(ctx) if ctx.generation == generation => {
                if let Some(ctx) = rooms.remove(room_id) {
                    ctx.retire();
                }
                true
            }
            _ => false,
        }
    }

    /// Snapshot of member channels for the context `generation`.
    pub fn senders(&self, room_id: &RoomId, generation: u64) -> Vec<(PrincipalId, mpsc::Sender<RoomEvent>)> {
        let rooms = self.rooms.lock();
        match rooms.get(room_id) {
            Some(ctx) if ctx.generation == generation => ctx
                .members
                .iter()
                .map(|(p, tx)| (p.clone(), tx.clone()))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Local active member count (0 if the room has no context).
    pub fn active_count(&self, room_id: &RoomId) -> usize {
        self.rooms.lock().get(room_id).map_or(0, |ctx| ctx.members.len())
    }

    pub fn is_active(&self, room_id: &RoomId, principal: &PrincipalId) -> bool {
        self.rooms
            .lock()
            .get(room_id)
            .is_some_and(|ctx| ctx.members.contains_key(principal))
    }

    /// Whether the room has an entry, live or draining.
    pub fn contains_room(&self, room_id: &RoomId) -> bool {
        self.rooms.lock().contains_key(room_id)
    }

    pub fn is_draining(&self, room_id: &RoomId) -> bool {
        self.rooms.lock().get(room_id).is_some_and(|ctx| ctx.draining)
    }

    /// Rooms with at least one local member.
    pub fn active_rooms(&self) -> Vec<RoomId> {
        let mut ids: Vec<RoomId> = self
            .rooms
            .lock()
            .iter()
            .filter(|(_, ctx)| !ctx.draining)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Cancel every bridge and drop every context. Used at shutdown.
    pub fn shutdown(&self) -> usize {
        let drained: Vec<RoomContext> = self.rooms.lock().drain().map(|(_, ctx)| ctx).collect();
        let count = drained.len();
        for ctx in drained {
            ctx.retire();
        }
        count
    }
}
