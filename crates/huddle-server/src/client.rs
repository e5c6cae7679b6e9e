//! Connected WebSocket clients and their socket pumps.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use huddle_core::PrincipalId;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Missed heartbeats before a client is considered dead.
const MISSED_HEARTBEATS: u32 = 3;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClientId(String);

impl ClientId {
    pub fn new() -> Self {
        Self(format!("client_{}", Uuid::now_v7()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One WebSocket connection. Frames are queued on a bounded channel that the
/// writer pump drains; `closed` is cancelled exactly once when the connection
/// goes away.
pub struct Client {
    pub id: ClientId,
    principal: RwLock<Option<PrincipalId>>,
    outbound: mpsc::Sender<String>,
    closed: CancellationToken,
    last_seen: Mutex<Instant>,
}

impl Client {
    pub fn principal(&self) -> Option<PrincipalId> {
        self.principal.read().clone()
    }

    pub fn set_principal(&self, principal: PrincipalId) {
        *self.principal.write() = Some(principal);
    }

    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.is_cancelled()
    }

    /// Queue a frame without waiting. `false` if the queue is full or the
    /// connection is gone.
    pub fn try_send(&self, frame: String) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(frame)) => {
                warn!(client_id = %self.id, frame_len = frame.len(), "Outbound queue full, frame dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Any inbound traffic counts as a sign of life.
    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }
}

/// Every live client on this process.
pub struct ClientRegistry {
    clients: DashMap<ClientId, Arc<Client>>,
    queue_capacity: usize,
    idle_timeout: Duration,
}

impl ClientRegistry {
    /// Clients idle for three heartbeat intervals are reaped.
    pub fn new(queue_capacity: usize, heartbeat_interval: Duration) -> Self {
        Self {
            clients: DashMap::new(),
            queue_capacity: queue_capacity.max(1),
            idle_timeout: heartbeat_interval * MISSED_HEARTBEATS,
        }
    }

    /// Add a client; the receiver is the client's outbound queue.
    pub fn register(&self, principal: Option<PrincipalId>) -> (Arc<Client>, mpsc::Receiver<String>) {
        let (outbound, rx) = mpsc::channel(self.queue_capacity);
        let client = Arc::new(Client {
            id: ClientId::new(),
            principal: RwLock::new(principal),
            outbound,
            closed: CancellationToken::new(),
            last_seen: Mutex::new(Instant::now()),
        });
        self.clients.insert(client.id.clone(), Arc::clone(&client));
        (client, rx)
    }

    /// Drop a client and cancel its `closed` token. Sessions watching the
    /// token leave their rooms.
    pub fn unregister(&self, id: &ClientId) -> bool {
        match self.clients.remove(id) {
            Some((_, client)) => {
                client.closed.cancel();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &ClientId) -> Option<Arc<Client>> {
        self.clients.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn count(&self) -> usize {
        self.clients.len()
    }

    pub fn authenticated_count(&self) -> usize {
        self.clients
            .iter()
            .filter(|entry| entry.value().principal.read().is_some())
            .count()
    }

    /// Unregister clients idle past the timeout. Returns how many went.
    pub fn reap_idle(&self) -> usize {
        let idle: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|entry| entry.value().idle_for() >= self.idle_timeout)
            .map(|entry| entry.key().clone())
            .collect();

        idle.iter()
            .filter(|id| {
                let removed = self.unregister(id);
                if removed {
                    info!(client_id = %id, "Idle client reaped");
                }
                removed
            })
            .count()
    }

    pub fn close_all(&self) {
        let ids: Vec<ClientId> = self.clients.iter().map(|entry| entry.key().clone()).collect();
        for id in &ids {
            self.unregister(id);
        }
    }
}

/// Pump one socket until either side finishes, then unregister the client.
///
/// Text frames are handed to `inbound`; pings go out every
/// `heartbeat_interval`.
pub async fn run_connection(
    socket: WebSocket,
    client: Arc<Client>,
    outbound: mpsc::Receiver<String>,
    registry: Arc<ClientRegistry>,
    inbound: mpsc::Sender<(ClientId, String)>,
    heartbeat_interval: Duration,
) {
    let (sink, stream) = socket.split();

    let mut writer = tokio::spawn(write_loop(sink, Arc::clone(&client), outbound, heartbeat_interval));
    let mut reader = tokio::spawn(read_loop(stream, Arc::clone(&client), inbound));

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => {
            client.closed.cancel();
            let _ = writer.await;
        }
    }

    registry.unregister(&client.id);
    info!(client_id = %client.id, "WebSocket client disconnected");
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    client: Arc<Client>,
    mut outbound: mpsc::Receiver<String>,
    heartbeat_interval: Duration,
) {
    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + heartbeat_interval,
        heartbeat_interval,
    );

    loop {
        let message = tokio::select! {
            () = client.closed.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(text) => Message::Text(text.into()),
                None => break,
            },
            _ = heartbeat.tick() => {
                trace!(client_id = %client.id, "Heartbeat ping");
                Message::Ping(Vec::new().into())
            }
        };
        if let Err(e) = sink.send(message).await {
            debug!(client_id = %client.id, error = %e, "Socket write failed");
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    client: Arc<Client>,
    inbound: mpsc::Sender<(ClientId, String)>,
) {
    while let Some(Ok(message)) = stream.next().await {
        client.touch();
        match message {
            Message::Text(text) => {
                if inbound.send((client.id.clone(), text.to_string())).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}

/// Periodically reap idle clients until `shutdown` fires.
pub fn spawn_reaper(
    registry: Arc<ClientRegistry>,
    every: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let reaped = registry.reap_idle();
                    if reaped > 0 {
                        info!(reaped, remaining = registry.count(), "Idle clients reaped");
                    }
                }
            }
        }
    })
}
