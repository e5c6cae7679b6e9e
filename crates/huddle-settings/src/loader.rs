//! Settings loading.
//!
//! Loading flow:
//! 1. Start with compiled [`HuddleSettings::default()`]
//! 2. If a JSON settings file exists, merge its values over the defaults
//! 3. Apply `HUDDLE_*` environment variables, nested with `__`
//!    (`HUDDLE_SERVER__PORT=9000` sets `server.port`)
//! 4. Apply command-line [`SettingsOverrides`]
//!
//! The result is validated before it is returned.

use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Json, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::Result;
use crate::types::{HuddleSettings, StoreBackend};

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "HUDDLE_";

/// `~/.huddle`, or `/tmp/.huddle` without a home directory.
pub fn huddle_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".huddle")
}

/// Resolve the path to the settings file (`~/.huddle/settings.json`).
pub fn settings_path() -> PathBuf {
    huddle_dir().join("settings.json")
}

/// Defaults, then `path` (if present), then environment variables under
/// `env_prefix`.
pub fn figment(path: &Path, env_prefix: &str) -> Figment {
    if path.exists() {
        debug!(?path, "loading settings from file");
    } else {
        debug!(?path, "settings file not found, using defaults");
    }
    Figment::new()
        .merge(Serialized::defaults(HuddleSettings::default()))
        .merge(Json::file(path))
        .merge(Env::prefixed(env_prefix).split("__"))
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<HuddleSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file is not an error; malformed JSON or mistyped values are.
pub fn load_settings_from_path(path: &Path) -> Result<HuddleSettings> {
    load(figment(path, ENV_PREFIX), &SettingsOverrides::default())
}

/// Extract from `figment`, apply `overrides` and validate.
pub fn load(figment: Figment, overrides: &SettingsOverrides) -> Result<HuddleSettings> {
    let mut settings: HuddleSettings = figment.extract()?;
    overrides.apply(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Values supplied on the command line. `None` leaves the loaded value alone.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SettingsOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub store_backend: Option<StoreBackend>,
    pub sqlite_path: Option<PathBuf>,
    pub log_level: Option<String>,
    pub json_logs: Option<bool>,
}

impl SettingsOverrides {
    pub fn apply(&self, settings: &mut HuddleSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(backend) = self.store_backend {
            settings.store.backend = backend;
        }
        if let Some(path) = &self.sqlite_path {
            settings.store.sqlite_path.clone_from(path);
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if let Some(json) = self.json_logs {
            settings.logging.json = json;
        }
    }
}
