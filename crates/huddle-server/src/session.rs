//! Streaming join sessions.
//!
//! A [`StreamingSession`] drives one client's `room.join` call:
//!
//! ```text
//! Init --join ok--> Joined --(forward loop)--> Leaving --> Left
//!   \                  \                                 ^
//!    \--join failed-----\--event stream closed-----------/
//! ```
//!
//! The session leaves the room itself when a frame cannot be delivered or the
//! client disconnects. When the event stream closes (someone else ended or
//! took over the join) it stops without leaving, even if a disconnect is
//! seen in the same tick.

use std::sync::Arc;

use async_trait::async_trait;
use huddle_core::{PrincipalId, RoomEvent, RoomId};
use huddle_engine::{RoomError, RoomService};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::Client;
use crate::wire;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("join failed: {0}")]
    Join(#[from] RoomError),

    #[error("send failed: {0}")]
    Send(String),
}

/// Where a session's frames go.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Deliver one frame. An error ends the session.
    async fn send(&self, frame: String) -> Result<(), SessionError>;

    /// Cancelled when the peer disconnects.
    fn disconnected(&self) -> CancellationToken;
}

#[async_trait]
impl FrameSink for Arc<Client> {
    async fn send(&self, frame: String) -> Result<(), SessionError> {
        if self.try_send(frame) {
            Ok(())
        } else if self.is_connected() {
            Err(SessionError::Send(format!("client {} send queue full", self.id)))
        } else {
            Err(SessionError::Send(format!("client {} disconnected", self.id)))
        }
    }

    fn disconnected(&self) -> CancellationToken {
        self.closed().clone()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Joined,
    Leaving,
    Left,
}

pub struct StreamingSession<S> {
    service: Arc<RoomService>,
    sink: S,
    room_id: RoomId,
    principal: PrincipalId,
    state: SessionState,
}

impl<S: FrameSink> StreamingSession<S> {
    pub fn new(service: Arc<RoomService>, sink: S, room_id: RoomId, principal: PrincipalId) -> Self {
        Self {
            service,
            sink,
            room_id,
            principal,
            state: SessionState::Init,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Join and forward until the session ends.
    pub async fn run(mut self) -> Result<(), SessionError> {
        let events = self.join().await?;
        self.forward(events).await
    }

    /// `Init -> Joined`, or `Init -> Left` on failure.
    pub async fn join(&mut self) -> Result<mpsc::Receiver<RoomEvent>, SessionError> {
        match self.service.join_room(&self.room_id, &self.principal).await {
            Ok(events) => {
                self.state = SessionState::Joined;
                Ok(events)
            }
            Err(e) => {
                self.state = SessionState::Left;
                debug!(
                    room_id = %self.room_id,
                    principal = %self.principal,
                    kind = e.error_kind(),
                    error = %e,
                    "Join failed"
                );
                Err(SessionError::Join(e))
            }
        }
    }

    /// Relay presence events to the sink until the stream closes, a send
    /// fails or the peer disconnects.
    pub async fn forward(&mut self, mut events: mpsc::Receiver<RoomEvent>) -> Result<(), SessionError> {
        let disconnected = self.sink.disconnected();
        loop {
            tokio::select! {
                biased;
                () = disconnected.cancelled() => {
                    info!(room_id = %self.room_id, principal = %self.principal, "Client disconnected, leaving room");
                    self.leave_if_current(&events).await;
                    return Ok(());
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        debug!(room_id = %self.room_id, principal = %self.principal, "Event stream closed");
                        self.state = SessionState::Left;
                        return Ok(());
                    };
                    let Some(frame) = wire::room_event_frame(&event) else {
                        continue;
                    };
                    if let Err(e) = self.sink.send(frame.to_string()).await {
                        warn!(room_id = %self.room_id, principal = %self.principal, error = %e, "Failed to deliver room event");
                        self.leave_if_current(&events).await;
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Leave, unless the stream was already closed by a newer join or the
    /// engine. That membership no longer belongs to this session.
    async fn leave_if_current(&mut self, events: &mpsc::Receiver<RoomEvent>) {
        if events.is_closed() {
            debug!(room_id = %self.room_id, principal = %self.principal, "Event stream already closed, not leaving");
            self.state = SessionState::Left;
            return;
        }
        self.leave().await;
    }

    /// `-> Leaving -> Left`. A failed leave is logged, not returned.
    pub async fn leave(&mut self) {
        self.state = SessionState::Leaving;
        if let Err(e) = self.service.leave_room(&self.room_id, &self.principal).await {
            warn!(room_id = %self.room_id, principal = %self.principal, error = %e, "Leave after session end failed");
        }
        self.state = SessionState::Left;
    }
}
