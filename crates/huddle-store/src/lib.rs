//! Durable room storage and the pub/sub bus behind it.
//!
//! The engine only sees [`PersistenceGateway`]. Two implementations ship
//! here: [`MemoryGateway`] for tests and single-process use, and
//! [`SqliteGateway`] which keeps rooms and memberships on disk.

pub mod bus;
pub mod database;
pub mod error;
pub mod gateway;
pub mod memory;
pub mod schema;
pub mod sqlite;

pub use bus::MessageBus;
pub use database::Database;
pub use error::StoreError;
pub use gateway::{room_channel, PersistenceGateway, Subscription};
pub use memory::MemoryGateway;
pub use sqlite::SqliteGateway;
