//! Real-time room session engine.
//!
//! [`RoomService`] is the entry point. It keeps durable membership in a
//! [`PersistenceGateway`](huddle_store::PersistenceGateway), tracks which
//! principals hold a stream on this process in a [`RoomRegistry`], and runs
//! one [`EventBridge`] task per room with local members.

pub mod bridge;
pub mod error;
pub mod registry;
pub mod service;

pub use bridge::EventBridge;
pub use error::RoomError;
pub use registry::{LocalJoin, LocalLeave, Registration, RoomRegistry, Teardown};
pub use service::{RoomConfig, RoomService};
