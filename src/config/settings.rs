//! TOML-based configuration for reportage.
//!
//! Supports a config file (reportage.toml) with environment variable
//! expansion in paths.
//!
//! Example configuration:
//! ```toml
//! [cache]
//! backend = "local"
//! path = "${REPORTAGE_HOME}/cache.db"
//! default_ttl_seconds = 1800
//!
//! [database]
//! path = "./data/reporting.db"
//!
//! [logging]
//! filter = "reportage=debug"
//! ```

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheResult, LocalCache, MemoryCache, ReportCache};
use crate::report::DEFAULT_CACHE_TTL;

/// Error type for settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub cache: CacheSettings,
    pub database: DatabaseSettings,
    pub logging: LoggingSettings,
}

/// Which report cache implementation to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    /// SQLite file shared between processes.
    #[default]
    Local,
    /// Process-local map.
    Memory,
}

/// Report cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheSettings {
    pub backend: CacheBackend,

    /// Cache database path (supports ${ENV_VAR} expansion). Defaults to
    /// `~/.reportage/cache.db`.
    pub path: Option<String>,

    /// TTL for reports that do not set their own.
    pub default_ttl_seconds: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Local,
            path: None,
            default_ttl_seconds: DEFAULT_CACHE_TTL.as_secs(),
        }
    }
}

impl CacheSettings {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_seconds)
    }

    /// Configured cache path with environment variables expanded.
    pub fn resolved_path(&self) -> Result<Option<PathBuf>, SettingsError> {
        self.path
            .as_deref()
            .map(|p| expand_env_vars(p).map(PathBuf::from))
            .transpose()
    }

    /// Opens the configured backend.
    pub fn open(&self) -> CacheResult<Arc<dyn ReportCache>> {
        match self.backend {
            CacheBackend::Memory => Ok(Arc::new(MemoryCache::new())),
            CacheBackend::Local => Ok(Arc::new(self.open_local()?)),
        }
    }

    /// Opens the SQLite cache regardless of the configured backend.
    pub fn open_local(&self) -> CacheResult<LocalCache> {
        let path = match self.resolved_path() {
            Ok(Some(path)) => path,
            Ok(None) => LocalCache::cache_path()?,
            Err(e) => {
                tracing::warn!(error = %e, "cache path not expanded, using default location");
                LocalCache::cache_path()?
            }
        };
        tracing::debug!(path = %path.display(), "opening local cache");
        LocalCache::open_at(path)
    }
}

/// Reporting database configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// SQLite database path (supports ${ENV_VAR} expansion).
    pub path: Option<String>,
}

impl DatabaseSettings {
    pub fn resolved_path(&self) -> Result<Option<PathBuf>, SettingsError> {
        self.path
            .as_deref()
            .map(|p| expand_env_vars(p).map(PathBuf::from))
            .transpose()
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        Ok(settings)
    }

    /// Load settings from the default config file locations.
    ///
    /// Searches in order:
    /// 1. Environment variable `REPORTAGE_CONFIG`
    /// 2. `./reportage.toml`
    /// 3. `~/.config/reportage/reportage.toml`
    pub fn load() -> Result<Self, SettingsError> {
        if let Ok(path) = env::var("REPORTAGE_CONFIG") {
            return Self::from_file(&path);
        }

        let local_config = PathBuf::from("reportage.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("reportage").join("reportage.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        Ok(Settings::default())
    }
}

/// Expand environment variables in a string.
///
/// Supports `${VAR}` and `$VAR` syntax.
pub fn expand_env_vars(s: &str) -> Result<String, SettingsError> {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }

        let name: String = if chars.peek() == Some(&'{') {
            chars.next();
            chars.by_ref().take_while(|&ch| ch != '}').collect()
        } else {
            let mut name = String::new();
            while let Some(ch) = chars.next_if(|ch| ch.is_alphanumeric() || *ch == '_') {
                name.push(ch);
            }
            if name.is_empty() {
                // lone $
                result.push('$');
                continue;
            }
            name
        };
        let value = env::var(&name).map_err(|_| SettingsError::MissingEnvVar(name.clone()))?;
        result.push_str(&value);
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars_braces() {
        env::set_var("REPORTAGE_TEST_VAR", "hello");
        assert_eq!(expand_env_vars("${REPORTAGE_TEST_VAR}").unwrap(), "hello");
        assert_eq!(
            expand_env_vars("prefix_${REPORTAGE_TEST_VAR}_suffix").unwrap(),
            "prefix_hello_suffix"
        );
        env::remove_var("REPORTAGE_TEST_VAR");
    }

    #[test]
    fn test_expand_env_vars_no_braces() {
        env::set_var("REPORTAGE_TEST_VAR2", "world");
        assert_eq!(expand_env_vars("$REPORTAGE_TEST_VAR2").unwrap(), "world");
        assert_eq!(expand_env_vars("$REPORTAGE_TEST_VAR2/x").unwrap(), "world/x");
        assert_eq!(expand_env_vars("cost $ 5").unwrap(), "cost $ 5");
        env::remove_var("REPORTAGE_TEST_VAR2");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("${NONEXISTENT_VAR_12345}");
        assert!(matches!(result, Err(SettingsError::MissingEnvVar(name)) if name == "NONEXISTENT_VAR_12345"));
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
[cache]
backend = "memory"
default_ttl_seconds = 60

[database]
path = "./data/reporting.db"

[logging]
filter = "reportage=debug"
"#;

        let settings: Settings = toml::from_str(toml).unwrap();

        assert_eq!(settings.cache.backend, CacheBackend::Memory);
        assert_eq!(settings.cache.default_ttl(), Duration::from_secs(60));
        assert_eq!(settings.cache.path, None);
        assert_eq!(
            settings.database.resolved_path().unwrap(),
            Some(PathBuf::from("./data/reporting.db"))
        );
        assert_eq!(settings.logging.filter, "reportage=debug");
    }

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();

        assert_eq!(settings.cache.backend, CacheBackend::Local);
        assert_eq!(settings.cache.default_ttl_seconds, 1800);
        assert!(settings.database.path.is_none());
        assert_eq!(settings.logging.filter, "info");
    }

    #[test]
    fn test_partial_table_keeps_defaults() {
        let settings: Settings = toml::from_str("[cache]\nbackend = \"local\"\n").unwrap();
        assert_eq!(settings.cache.default_ttl_seconds, 1800);
        assert_eq!(settings.logging.filter, "info");
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = Settings::from_file(dir.path().join("absent.toml"));
        assert!(matches!(result, Err(SettingsError::FileNotFound(_))));
    }

    #[test]
    fn test_memory_backend_opens() {
        let settings = CacheSettings {
            backend: CacheBackend::Memory,
            ..CacheSettings::default()
        };
        let cache = settings.open().unwrap();
        assert!(cache.list_instances().unwrap().is_empty());
    }
}
