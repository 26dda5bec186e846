//! Configuration for reportage.
//!
//! Handles the settings file, environment variable expansion, and cache
//! backend selection.

mod settings;

pub use settings::{
    expand_env_vars, CacheBackend, CacheSettings, DatabaseSettings, LoggingSettings, Settings,
    SettingsError,
};
