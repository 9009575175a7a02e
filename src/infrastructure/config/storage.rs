//! Reading and writing `config.toml`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

use crate::infrastructure::image::ImageCacheConfig;

use super::app_config::AppConfig;

/// Errors raised while locating or persisting the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform has no per-user configuration directory.
    #[error("no configuration directory for this platform")]
    ConfigDirNotFound,
    /// Reading or writing the file failed.
    #[error("config file io error: {0}")]
    Io(#[from] std::io::Error),
    /// The configuration could not be rendered as TOML.
    #[error("failed to serialize config: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

/// A configuration file on disk.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    /// The per-user `config.toml`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigDirNotFound` if the platform has no configuration directory.
    pub fn user_default() -> Result<Self, ConfigError> {
        AppConfig::default_config_path()
            .map(Self::at)
            .ok_or(ConfigError::ConfigDirNotFound)
    }

    /// A store backed by `path`.
    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Uses `path_override` when given, otherwise the per-user file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigDirNotFound` if no override is given and the platform has no
    /// configuration directory.
    pub fn resolve(path_override: Option<&Path>) -> Result<Self, ConfigError> {
        path_override.map_or_else(Self::user_default, |path| Ok(Self::at(path)))
    }

    /// Location of the file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the configuration, writing defaults first if the file does not exist.
    ///
    /// A file that does not parse is left untouched and defaults are used. Out of
    /// range `[cache]` values are replaced with usable ones, and a relative
    /// `cache_dir` is taken relative to the file's directory.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or the defaults cannot be written.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = if self.path.exists() {
            let content = fs::read_to_string(&self.path)?;
            toml::from_str::<AppConfig>(&content).unwrap_or_else(|e| {
                warn!(path = %self.path.display(), error = %e, "Malformed config file, using defaults");
                AppConfig::default()
            })
        } else {
            info!(path = %self.path.display(), "Writing default config file");
            let config = AppConfig::default();
            self.save(&config)?;
            config
        };

        sanitize_cache(&mut config.cache, self.path.parent());
        config.config = Some(self.path.clone());
        Ok(config)
    }

    /// Writes `config` atomically, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if serialization or any file operation fails.
    pub fn save(&self, config: &AppConfig) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(config)?;

        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let mut staged = tempfile::NamedTempFile::new_in(dir)?;
        staged.write_all(content.as_bytes())?;
        staged.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

/// Replaces values that would leave the cache unusable with the defaults.
fn sanitize_cache(cache: &mut ImageCacheConfig, base: Option<&Path>) {
    let defaults = ImageCacheConfig::default();

    if cache.memory_max_entries == 0 {
        warn!(default = defaults.memory_max_entries, "memory_max_entries must be positive");
        cache.memory_max_entries = defaults.memory_max_entries;
    }
    if cache.memory_max_bytes == 0 {
        warn!(default = defaults.memory_max_bytes, "memory_max_bytes must be positive");
        cache.memory_max_bytes = defaults.memory_max_bytes;
    }
    if cache.max_concurrent_prefetch == 0 {
        warn!("max_concurrent_prefetch must be positive, using 1");
        cache.max_concurrent_prefetch = 1;
    }
    if cache.timeout_secs == 0 {
        warn!(default = defaults.timeout_secs, "timeout_secs must be positive");
        cache.timeout_secs = defaults.timeout_secs;
    }
    if cache.disk_max_bytes == Some(0) {
        warn!("disk_max_bytes of 0 disables the quota");
        cache.disk_max_bytes = None;
    }

    if let Some(dir) = cache.cache_dir.take() {
        cache.cache_dir = Some(match base {
            Some(base) if dir.is_relative() => base.join(dir),
            _ => dir,
        });
    }
}
