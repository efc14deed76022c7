//! Cache configuration.
//!
//! User configuration may be specified in a TOML file. Only two knobs are
//! part of the cache contract: where the cache lives on disk and how many
//! 4 KiB blocks of file content it may hold.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid TOML for this schema.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// The cache section of the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CacheConfig {
    /// The directory holding the on-disk cache tree.
    pub path: PathBuf,

    /// The maximum number of content blocks the cache may hold. `0` means
    /// unlimited: every admission request is granted without eviction.
    pub max_blocks: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/cache/stashfs"),
            max_blocks: 0,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    /// Cache location and quota.
    pub cache: CacheConfig,
}

impl Config {
    /// Load a configuration from a TOML file.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// Check the configuration for problems that would only surface later.
    ///
    /// Returns a list of human-readable messages; an empty `Ok` means the
    /// configuration is usable.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();

        if self.cache.path.as_os_str().is_empty() {
            problems.push("cache.path must not be empty".to_owned());
        }
        if self.cache.path.is_relative() {
            problems.push(format!(
                "cache.path should be absolute, got {}",
                self.cache.path.display()
            ));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn load_parses_kebab_case_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            "[cache]\npath = \"/srv/stash\"\nmax-blocks = 262144\n",
        )
        .unwrap();

        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.cache.path, PathBuf::from("/srv/stash"));
        assert_eq!(config.cache.max_blocks, 262_144);
    }

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "").unwrap();

        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn relative_cache_path_is_flagged() {
        let config = Config {
            cache: CacheConfig {
                path: PathBuf::from("relative/cache"),
                max_blocks: 0,
            },
        };
        let problems = config.validate().unwrap_err();
        assert_eq!(problems.len(), 1, "expected exactly one problem");
        assert!(problems[0].contains("absolute"));
    }
}
