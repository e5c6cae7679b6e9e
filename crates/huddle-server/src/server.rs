use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use huddle_core::PrincipalId;
use huddle_engine::RoomService;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{self, Authenticator};
use crate::client::{self, ClientId, ClientRegistry};
use crate::handlers::{self, HandlerState};
use crate::rpc::{RpcRequest, RpcResponse};

/// How long `shutdown` waits for the HTTP server to drain.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_send_queue: usize,
    pub heartbeat_interval: Duration,
    pub cleanup_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 9090,
            max_send_queue: 256,
            heartbeat_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub handler_state: Arc<HandlerState>,
    pub client_registry: Arc<ClientRegistry>,
    pub message_tx: mpsc::Sender<(ClientId, String)>,
    pub heartbeat_interval: Duration,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and start serving. The returned handle owns the background tasks.
pub async fn start(
    config: ServerConfig,
    service: Arc<RoomService>,
    authenticator: Arc<dyn Authenticator>,
) -> Result<ServerHandle, std::io::Error> {
    let client_registry = Arc::new(ClientRegistry::new(config.max_send_queue, config.heartbeat_interval));
    let shutdown = CancellationToken::new();

    let cleanup = client::spawn_reaper(
        Arc::clone(&client_registry),
        config.cleanup_interval,
        shutdown.clone(),
    );

    let (msg_tx, msg_rx) = mpsc::channel::<(ClientId, String)>(1024);

    let handler_state = Arc::new(HandlerState::new(
        service,
        authenticator,
        Arc::clone(&client_registry),
    ));

    let app_state = AppState {
        handler_state: Arc::clone(&handler_state),
        client_registry: Arc::clone(&client_registry),
        message_tx: msg_tx,
        heartbeat_interval: config.heartbeat_interval,
    };

    let rpc = tokio::spawn(process_rpc_messages(
        msg_rx,
        Arc::clone(&handler_state),
        Arc::clone(&client_registry),
    ));

    let router = build_router(app_state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, "Huddle server started");

    let graceful = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { graceful.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "Server error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown,
        clients: client_registry,
        server,
        rpc,
        cleanup,
    })
}

/// Handle returned by `start()`. Dropping it leaves the server running.
pub struct ServerHandle {
    pub port: u16,
    shutdown: CancellationToken,
    clients: Arc<ClientRegistry>,
    server: JoinHandle<()>,
    rpc: JoinHandle<()>,
    cleanup: JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections, disconnect every client and wait for the
    /// HTTP server to drain.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.clients.close_all();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.server).await.is_err() {
            tracing::warn!("Server did not drain in time");
        }
        self.rpc.abort();
        self.cleanup.abort();
        tracing::info!("Huddle server stopped");
    }
}

/// WebSocket upgrade handler. A valid token in the `Authorization` header or
/// `token` query parameter authenticates the connection up front; anything
/// else connects unauthenticated.
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(auth::bearer_token)
        .or_else(|| query.get("token").and_then(|t| auth::bearer_token(t)))
        .map(str::to_owned);

    let principal = token.and_then(|token| match state.handler_state.authenticator.authenticate(&token) {
        Ok(principal) => Some(principal),
        Err(e) => {
            tracing::debug!(error = %e, "Upgrade token rejected, connecting unauthenticated");
            None
        }
    });

    ws.on_upgrade(move |socket| handle_socket(socket, state, principal))
}

/// Handle a new WebSocket connection.
async fn handle_socket(socket: WebSocket, state: AppState, principal: Option<PrincipalId>) {
    let (client, rx) = state.client_registry.register(principal);
    tracing::info!(
        client_id = %client.id,
        authenticated = client.principal().is_some(),
        "WebSocket client connected"
    );

    client::run_connection(
        socket,
        client,
        rx,
        state.client_registry,
        state.message_tx,
        state.heartbeat_interval,
    )
    .await;
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(handlers::health_status(&state.handler_state))
}

/// Process incoming RPC messages from WebSocket clients. Each message runs on
/// its own task so a slow join cannot stall other clients.
async fn process_rpc_messages(
    mut rx: mpsc::Receiver<(ClientId, String)>,
    state: Arc<HandlerState>,
    registry: Arc<ClientRegistry>,
) {
    while let Some((client_id, raw_message)) = rx.recv().await {
        let Some(client) = registry.get(&client_id) else {
            tracing::debug!(client_id = %client_id, "Message from unregistered client dropped");
            continue;
        };
        let state = Arc::clone(&state);

        tokio::spawn(async move {
            let response = match serde_json::from_str::<RpcRequest>(&raw_message) {
                Ok(request) => {
                    tracing::debug!(client_id = %client.id, method = %request.method, "RPC request");
                    handlers::handle_request(&state, &client, request).await
                }
                Err(e) => {
                    tracing::debug!(client_id = %client.id, error = %e, "Malformed RPC message");
                    Some(RpcResponse::parse_error())
                }
            };

            if let Some(json) = response.and_then(|r| r.to_json()) {
                if !client.try_send(json) {
                    tracing::debug!(client_id = %client.id, "RPC response dropped");
                }
            }
        });
    }
}
