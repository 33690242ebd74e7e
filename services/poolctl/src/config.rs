//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! `POOL_DATABASE` overrides `[store] database` so one definitions directory
//! can be pointed at different stores.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub pools: PoolsConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

/// Where pool definitions live
#[derive(Debug, Deserialize)]
pub struct PoolsConfig {
    pub definitions_dir: PathBuf,
}

/// Backing store for SQL and unified pools. Without `database` only file
/// pools can be opened.
#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub database: Option<PathBuf>,
    #[serde(default)]
    pub storage_dir: Option<PathBuf>,
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database: None,
            storage_dir: None,
            query_timeout_secs: default_query_timeout(),
        }
    }
}

fn default_query_timeout() -> u64 {
    30
}

impl StoreConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(database) = std::env::var("POOL_DATABASE")
            && !database.trim().is_empty()
        {
            config.store.database = Some(PathBuf::from(database.trim()));
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if self.pools.definitions_dir.as_os_str().is_empty() {
            return Err(common::Error::Config(
                "definitions_dir must not be empty".into(),
            ));
        }

        if self.store.query_timeout_secs == 0 {
            return Err(common::Error::Config(
                "query_timeout_secs must be greater than 0".into(),
            ));
        }

        // Unified pools write imported and materialized files there
        if self.store.database.is_some() && self.store.storage_dir.is_none() {
            return Err(common::Error::Config(
                "storage_dir is required when a database is configured".into(),
            ));
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("account-pool.toml")
    }
}
