//! RPC method handlers.

use std::sync::Arc;
use std::time::Instant;

use huddle_core::{PrincipalId, RoomId};
use huddle_engine::RoomService;
use serde_json::{json, Value};

use crate::auth::Authenticator;
use crate::client::{Client, ClientRegistry};
use crate::rpc::{ErrorCode, Params, RpcRequest, RpcResponse};
use crate::session::{SessionError, StreamingSession};
use crate::wire;

/// Shared state available to all RPC handlers.
pub struct HandlerState {
    pub service: Arc<RoomService>,
    pub authenticator: Arc<dyn Authenticator>,
    pub clients: Arc<ClientRegistry>,
    started_at: Instant,
}

impl HandlerState {
    pub fn new(
        service: Arc<RoomService>,
        authenticator: Arc<dyn Authenticator>,
        clients: Arc<ClientRegistry>,
    ) -> Self {
        Self {
            service,
            authenticator,
            clients,
            started_at: Instant::now(),
        }
    }
}

/// Route one request. `None` means the handler already replied on the
/// client's queue.
pub async fn handle_request(
    state: &Arc<HandlerState>,
    client: &Arc<Client>,
    request: RpcRequest,
) -> Option<RpcResponse> {
    let params = request.params.unwrap_or_else(|| json!({}));
    if request.method == "room.join" {
        return room_join(state, client, &params, request.id).await;
    }
    Some(dispatch(state, client, &request.method, &params, request.id).await)
}

/// Dispatch a unary RPC method to the appropriate handler.
pub async fn dispatch(
    state: &Arc<HandlerState>,
    client: &Client,
    method: &str,
    params: &Value,
    id: Option<Value>,
) -> RpcResponse {
    match method {
        // Auth
        "auth.authenticate" => auth_authenticate(state, client, params, id),

        // Room
        "room.create" => room_create(state, client, params, id).await,
        "room.leave" => room_leave(state, client, params, id).await,
        "room.get" => room_get(state, client, params, id).await,
        "room.list" => room_list(state, client, id).await,
        "room.stats" => room_stats(state, client, params, id).await,
        "room.members" => room_members(state, client, params, id).await,
        "room.delete" => room_delete(state, client, params, id).await,

        // System
        "system.ping" => system_ping(id),
        "health" => health(state, id),

        _ => RpcResponse::method_not_found(id, method),
    }
}

/// Principal of the calling client, or the error response to return.
fn require_principal(client: &Client, id: &Option<Value>) -> Result<PrincipalId, RpcResponse> {
    client
        .principal()
        .ok_or_else(|| RpcResponse::unauthenticated(id.clone()))
}

fn require_room_id(params: &Value, id: &Option<Value>) -> Result<RoomId, RpcResponse> {
    Params::new(params)
        .str("roomId")
        .map(RoomId::from_raw)
        .map_err(|e| RpcResponse::invalid_params(id.clone(), e))
}

// ── Auth ──

fn auth_authenticate(
    state: &Arc<HandlerState>,
    client: &Client,
    params: &Value,
    id: Option<Value>,
) -> RpcResponse {
    let token = match Params::new(params).str("token") {
        Ok(t) => t,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    match state.authenticator.authenticate(token) {
        Ok(principal) => {
            tracing::info!(client_id = %client.id, principal = %principal, "Client authenticated");
            client.set_principal(principal.clone());
            RpcResponse::success(id, json!({"authenticated": true, "userId": principal}))
        }
        Err(e) => {
            tracing::debug!(client_id = %client.id, error = %e, "Authentication failed");
            RpcResponse::error(id, ErrorCode::Unauthenticated, e.to_string())
        }
    }
}

// ── Room ──

async fn room_create(
    state: &Arc<HandlerState>,
    client: &Client,
    params: &Value,
    id: Option<Value>,
) -> RpcResponse {
    let principal = match require_principal(client, &id) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let params = Params::new(params);
    let name = match params.str("name") {
        Ok(n) => n,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let is_private = params.opt_bool("isPrivate").unwrap_or(false);

    match state.service.create_room(name, &principal, is_private).await {
        Ok(room) => RpcResponse::success(id, wire::room_json(&room)),
        Err(e) => RpcResponse::from_room_error(id, &e),
    }
}

/// Streaming join. On success the ack goes out on the client's queue ahead
/// of any event notification, and a session task takes over.
pub async fn room_join(
    state: &Arc<HandlerState>,
    client: &Arc<Client>,
    params: &Value,
    id: Option<Value>,
) -> Option<RpcResponse> {
    let principal = match require_principal(client, &id) {
        Ok(p) => p,
        Err(resp) => return Some(resp),
    };
    let room_id = match require_room_id(params, &id) {
        Ok(r) => r,
        Err(resp) => return Some(resp),
    };

    let mut session = StreamingSession::new(
        Arc::clone(&state.service),
        Arc::clone(client),
        room_id.clone(),
        principal,
    );
    let events = match session.join().await {
        Ok(events) => events,
        Err(SessionError::Join(e)) => return Some(RpcResponse::from_room_error(id, &e)),
        Err(e) => return Some(RpcResponse::error(id, ErrorCode::InternalError, e.to_string())),
    };

    let ack = RpcResponse::success(id, wire::join_ack(&room_id));
    let delivered = ack.to_json().is_some_and(|json| client.try_send(json));
    if !delivered {
        session.leave().await;
        return None;
    }

    let client_id = client.id.clone();
    tokio::spawn(async move {
        if let Err(e) = session.forward(events).await {
            tracing::debug!(client_id = %client_id, room_id = %room_id, error = %e, "Join session ended with error");
        }
    });
    None
}

async fn room_leave(
    state: &Arc<HandlerState>,
    client: &Client,
    params: &Value,
    id: Option<Value>,
) -> RpcResponse {
    let principal = match require_principal(client, &id) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let room_id = match require_room_id(params, &id) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    if let Some(user_id) = Params::new(params).opt_str("userId") {
        if user_id != principal.as_str() {
            return RpcResponse::invalid_params(id, "Cannot leave on behalf of another user");
        }
    }

    match state.service.leave_room(&room_id, &principal).await {
        Ok(()) => RpcResponse::success(id, json!({"left": true})),
        Err(e) => RpcResponse::from_room_error(id, &e),
    }
}

async fn room_get(
    state: &Arc<HandlerState>,
    client: &Client,
    params: &Value,
    id: Option<Value>,
) -> RpcResponse {
    if let Err(resp) = require_principal(client, &id) {
        return resp;
    }
    let room_id = match require_room_id(params, &id) {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    match state.service.get_room(&room_id).await {
        Ok(room) => RpcResponse::success(id, wire::room_json(&room)),
        Err(e) => RpcResponse::from_room_error(id, &e),
    }
}

async fn room_list(state: &Arc<HandlerState>, client: &Client, id: Option<Value>) -> RpcResponse {
    if let Err(resp) = require_principal(client, &id) {
        return resp;
    }

    match state.service.list_rooms().await {
        Ok(rooms) => {
            let rooms: Vec<Value> = rooms.iter().map(wire::room_json).collect();
            RpcResponse::success(id, json!({"rooms": rooms}))
        }
        Err(e) => RpcResponse::from_room_error(id, &e),
    }
}

async fn room_stats(
    state: &Arc<HandlerState>,
    client: &Client,
    params: &Value,
    id: Option<Value>,
) -> RpcResponse {
    if let Err(resp) = require_principal(client, &id) {
        return resp;
    }
    let room_id = match require_room_id(params, &id) {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    match state.service.room_stats(&room_id).await {
        Ok(stats) => RpcResponse::success(id, wire::stats_json(&stats)),
        Err(e) => RpcResponse::from_room_error(id, &e),
    }
}

async fn room_members(
    state: &Arc<HandlerState>,
    client: &Client,
    params: &Value,
    id: Option<Value>,
) -> RpcResponse {
    if let Err(resp) = require_principal(client, &id) {
        return resp;
    }
    let room_id = match require_room_id(params, &id) {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    match state.service.get_room_members(&room_id).await {
        Ok(members) => RpcResponse::success(id, json!({"roomId": room_id, "userIds": members})),
        Err(e) => RpcResponse::from_room_error(id, &e),
    }
}

async fn room_delete(
    state: &Arc<HandlerState>,
    client: &Client,
    params: &Value,
    id: Option<Value>,
) -> RpcResponse {
    let principal = match require_principal(client, &id) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let room_id = match require_room_id(params, &id) {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    match state.service.delete_room(&room_id, &principal).await {
        Ok(()) => RpcResponse::success(id, json!({"deleted": true})),
        Err(e) => RpcResponse::from_room_error(id, &e),
    }
}

// ── System ──

fn system_ping(id: Option<Value>) -> RpcResponse {
    RpcResponse::success(
        id,
        json!({"pong": true, "timestamp": chrono::Utc::now().to_rfc3339()}),
    )
}

fn health(state: &Arc<HandlerState>, id: Option<Value>) -> RpcResponse {
    RpcResponse::success(id, health_status(state))
}

/// Body shared by the `health` method and the HTTP health endpoint.
pub fn health_status(state: &HandlerState) -> Value {
    json!({
        "status": "healthy",
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "clients": state.clients.count(),
        "authenticatedClients": state.clients.authenticated_count(),
        "activeRooms": state.service.registry().active_rooms().len(),
    })
}
