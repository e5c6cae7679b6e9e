//! WebSocket front end for the huddle room engine.
//!
//! Clients speak a small JSON-RPC dialect over `/ws`. `room.join` is the one
//! streaming method: after its ack, presence events for the room arrive as
//! `room.event` notifications on the same connection until the client leaves
//! or disconnects.

pub mod auth;
pub mod client;
pub mod handlers;
pub mod rpc;
pub mod server;
pub mod session;
pub mod wire;

pub use auth::{Authenticator, JwtAuthenticator};
pub use server::{start, ServerConfig, ServerHandle};
pub use session::{FrameSink, SessionState, StreamingSession};
