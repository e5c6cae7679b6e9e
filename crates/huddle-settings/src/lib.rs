//! # huddle-settings
//!
//! Layered configuration for the huddle server.
//!
//! Settings are loaded from four layers (in priority order):
//! 1. **Compiled defaults**: [`HuddleSettings::default()`]
//! 2. **Settings file**: `~/.huddle/settings.json` or an explicit path
//! 3. **Environment variables**: `HUDDLE_*`, nested with `__`
//! 4. **Command line**: [`SettingsOverrides`] (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    figment, huddle_dir, load, load_settings, load_settings_from_path, settings_path,
    SettingsOverrides, ENV_PREFIX,
};
pub use types::*;
