//! Configuration utilities for ferrule
//!
//! Settings are read from `CLICKHOUSE_*` environment variables. Per-team
//! block size overrides use the nested form
//! `CLICKHOUSE_MAX_BLOCK_SIZE_OVERRIDES__<team_id>=<rows>`.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Environment prefix for ClickHouse settings
pub const ENV_PREFIX: &str = "CLICKHOUSE";

/// ClickHouse connection and resource-limit settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClickHouseSettings {
    /// Primary HTTP interface URL
    pub url: String,
    /// HTTP URL of the offline cluster used for exports (falls back to `url`)
    pub offline_http_url: Option<String>,
    /// User sent as `X-ClickHouse-User`
    pub user: String,
    /// Password sent as `X-ClickHouse-Key`
    pub password: String,
    /// Target database
    pub database: String,
    /// `max_execution_time` in seconds (0 = unlimited)
    pub max_execution_time: u64,
    /// `max_memory_usage` in bytes (0 = server default)
    pub max_memory_usage: u64,
    /// `max_block_size` applied when no per-team override exists
    pub max_block_size_default: u64,
    /// `max_block_size` overrides keyed by team id
    pub max_block_size_overrides: HashMap<String, u64>,
    /// Verify the server TLS certificate
    pub verify: bool,
    /// Path to a PEM CA bundle trusted in addition to the system roots
    pub ca_path: Option<String>,
}

impl Default for ClickHouseSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:8123".into(),
            offline_http_url: None,
            user: "default".into(),
            password: String::new(),
            database: "default".into(),
            max_execution_time: 0,
            max_memory_usage: 0,
            max_block_size_default: 10_000,
            max_block_size_overrides: HashMap::new(),
            verify: true,
            ca_path: None,
        }
    }
}

impl ClickHouseSettings {
    /// Load settings from `CLICKHOUSE_*` environment variables
    pub fn from_env() -> Result<Self> {
        load_from_env(ENV_PREFIX)
    }

    /// Deserialize settings from an already built configuration
    pub fn from_config(source: config::Config) -> Result<Self> {
        Ok(source.try_deserialize()?)
    }

    /// URL used for export queries: the offline cluster when configured
    pub fn export_url(&self) -> &str {
        self.offline_http_url.as_deref().unwrap_or(&self.url)
    }

    /// Resolve `max_block_size` for a team, falling back to the global default
    pub fn max_block_size_for(&self, team_id: Option<i64>) -> u64 {
        team_id
            .and_then(|id| self.max_block_size_overrides.get(&id.to_string()).copied())
            .unwrap_or(self.max_block_size_default)
    }
}

/// Load configuration from environment variables
pub fn load_from_env<T: for<'de> Deserialize<'de>>(prefix: &str) -> Result<T> {
    Ok(config::Config::builder()
        .add_source(
            config::Environment::with_prefix(prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?)
}

/// Get environment variable as parsed type with default
pub fn env_parse_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = ClickHouseSettings::default();
        assert_eq!(settings.url, "http://localhost:8123");
        assert_eq!(settings.database, "default");
        assert_eq!(settings.export_url(), "http://localhost:8123");
    }

    #[test]
    fn test_from_config_with_overrides() {
        let source = config::Config::builder()
            .set_override("url", "http://ch:8123")
            .unwrap()
            .set_override("offline_http_url", "http://ch-offline:8123")
            .unwrap()
            .set_override("max_block_size_default", 5000)
            .unwrap()
            .set_override("max_block_size_overrides.42", 100)
            .unwrap()
            .build()
            .unwrap();

        let settings = ClickHouseSettings::from_config(source).unwrap();
        assert_eq!(settings.export_url(), "http://ch-offline:8123");
        assert_eq!(settings.user, "default");
        assert_eq!(settings.max_block_size_for(Some(42)), 100);
        assert_eq!(settings.max_block_size_for(Some(7)), 5000);
        assert_eq!(settings.max_block_size_for(None), 5000);
    }

    #[test]
    fn test_env_parse_or_default_missing() {
        let value: usize = env_parse_or_default("FERRULE_TEST_SURELY_UNSET_VAR", 16);
        assert_eq!(value, 16);
    }
}
