//! Settings sections. Every field has a compiled default, so a partial file
//! or a single env var is enough to override one value.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Development signing key used when none is configured.
pub const DEV_JWT_SECRET: &str = "huddle-dev-secret";

/// Root settings object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HuddleSettings {
    pub server: ServerSettings,
    pub rooms: RoomSettings,
    pub auth: AuthSettings,
    pub store: StoreSettings,
    pub logging: LoggingSettings,
}

impl HuddleSettings {
    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(invalid("server.port must be non-zero"));
        }
        if self.server.max_send_queue == 0 {
            return Err(invalid("server.max_send_queue must be non-zero"));
        }
        if self.server.heartbeat_interval_secs == 0 {
            return Err(invalid("server.heartbeat_interval_secs must be non-zero"));
        }
        if self.rooms.event_buffer == 0 {
            return Err(invalid("rooms.event_buffer must be non-zero"));
        }
        if self.auth.jwt_secret.trim().is_empty() {
            return Err(invalid("auth.jwt_secret must not be empty"));
        }
        if self.store.backend == StoreBackend::Sqlite && self.store.sqlite_path.as_os_str().is_empty() {
            return Err(invalid("store.sqlite_path is required for the sqlite backend"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> SettingsError {
    SettingsError::InvalidValue(msg.to_string())
}

/// Listener and per-connection settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// WebSocket and health port.
    pub port: u16,
    /// Outbound frames buffered per client before sends start failing.
    pub max_send_queue: usize,
    /// Seconds between heartbeat pings.
    pub heartbeat_interval_secs: u64,
}

impl ServerSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9090,
            max_send_queue: 256,
            heartbeat_interval_secs: 30,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomSettings {
    /// Per-member event channel capacity.
    pub event_buffer: usize,
    /// Rooms with local members allowed at once. 0 is unlimited.
    pub max_active_rooms: usize,
    pub bridge_shutdown_timeout_ms: u64,
}

impl RoomSettings {
    pub fn bridge_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.bridge_shutdown_timeout_ms)
    }
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            event_buffer: 10,
            max_active_rooms: 0,
            bridge_shutdown_timeout_ms: 5_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// HS256 signing key.
    pub jwt_secret: String,
    /// Expected `iss` claim.
    pub issuer: String,
    /// Lifetime of tokens issued by the server.
    pub token_ttl_secs: u64,
}

impl AuthSettings {
    pub fn uses_dev_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: DEV_JWT_SECRET.to_string(),
            issuer: "huddle".to_string(),
            token_ttl_secs: 86_400,
        }
    }
}

/// Which persistence gateway backs the server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    pub sqlite_path: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            sqlite_path: crate::loader::huddle_dir().join("huddle.db"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Base level ("trace" through "error").
    pub level: String,
    /// Emit JSON lines.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
