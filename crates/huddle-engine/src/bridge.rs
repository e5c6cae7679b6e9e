//! Per-room task that forwards bus events to local member streams.

use std::sync::Arc;

use huddle_core::{RoomEvent, RoomEventKind, RoomId};
use huddle_store::{PersistenceGateway, Subscription};
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::RoomError;
use crate::registry::RoomRegistry;

/// Starts event bridges. One bridge runs per room context.
#[derive(Clone)]
pub struct EventBridge {
    gateway: Arc<dyn PersistenceGateway>,
    registry: Arc<RoomRegistry>,
}

impl EventBridge {
    pub fn new(gateway: Arc<dyn PersistenceGateway>, registry: Arc<RoomRegistry>) -> Self {
        Self { gateway, registry }
    }

    /// Subscribe to the room's channel and spawn the forwarding loop.
    ///
    /// The subscription is established before this returns, so anything
    /// published afterwards reaches the bridge. The task exits when `cancel`
    /// fires or the subscription fails for good; in the latter case it
    /// abandons the room context so members see end-of-stream.
    pub async fn start(
        &self,
        room_id: RoomId,
        generation: u64,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>, RoomError> {
        let subscription = self
            .gateway
            .subscribe(&room_id)
            .await
            .map_err(|e| RoomError::Subscription(format!("room {room_id}: {e}")))?;

        debug!(room_id = %room_id, generation, "Event bridge subscribed");

        let registry = self.registry.clone();
        Ok(tokio::spawn(run(registry, room_id, generation, cancel, subscription)))
    }
}

async fn run(
    registry: Arc<RoomRegistry>,
    room_id: RoomId,
    generation: u64,
    cancel: CancellationToken,
    mut subscription: Subscription,
) {
    let failed = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!(room_id = %room_id, "Event bridge cancelled");
                break false;
            }
            message = subscription.next_message() => match message {
                Some(Ok(raw)) => deliver(&registry, &room_id, generation, &raw),
                Some(Err(e)) if e.is_recoverable() => {
                    warn!(room_id = %room_id, error = %e, "Event bridge lagged behind bus");
                }
                Some(Err(e)) => {
                    error!(room_id = %room_id, error = %e, "Event bridge subscription failed");
                    break true;
                }
                None => {
                    // Channel went away while members were still attached.
                    if cancel.is_cancelled() {
                        break false;
                    }
                    warn!(room_id = %room_id, "Event bridge subscription closed");
                    break true;
                }
            },
        }
    };

    // The context may only leave the registry once nothing is subscribed.
    drop(subscription);
    if failed {
        registry.abandon(&room_id, generation);
    } else {
        registry.release(&room_id, generation);
    }
    info!(room_id = %room_id, generation, "Event bridge stopped");
}

fn deliver(registry: &RoomRegistry, room_id: &RoomId, generation: u64, raw: &str) {
    let event: RoomEvent = match serde_json::from_str(raw) {
        Ok(event) => event,
        Err(e) => {
            warn!(room_id = %room_id, error = %e, "Dropping malformed room event");
            return;
        }
    };

    // Chat messages are delivered elsewhere.
    if event.kind == RoomEventKind::MessagePosted {
        return;
    }

    for (principal, tx) in registry.senders(room_id, generation) {
        match tx.try_send(event.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(
                    room_id = %room_id,
                    principal = %principal,
                    event = event.kind.as_str(),
                    "Member event buffer full, dropping event"
                );
            }
            Err(TrySendError::Closed(_)) => {
                debug!(room_id = %room_id, principal = %principal, "Member stream closed");
            }
        }
    }
}
