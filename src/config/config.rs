//! Configuration structures and loading (spec §6 "Configuration").

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level engine configuration, loaded from a TOML file. Every field
/// recognized by spec §6 has a default so a minimal or empty file is valid.
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    /// Unique identifier for multi-instance lease coordination.
    #[serde(default = "default_engine_id")]
    pub engine_id: String,

    /// Where the SQLite-backed Persistence Gateway keeps its database file.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Default polling period for the Image-Version Watcher.
    #[serde(default = "default_watch_interval_sec")]
    pub watch_interval_sec: u64,

    /// Upper bound on concurrent registry `resolve` calls.
    #[serde(default = "default_registry_concurrency")]
    pub registry_concurrency: usize,

    /// Size of the Executor worker pool.
    #[serde(default = "default_executor_workers")]
    pub executor_workers: usize,

    /// Default TTL for the in-memory digest cache.
    #[serde(default = "default_digest_cache_ttl_sec")]
    pub digest_cache_ttl_sec: i64,

    /// Max wait on hard cancel (engine shutdown) before abandoning tasks.
    #[serde(default = "default_shutdown_grace_sec")]
    pub shutdown_grace_sec: u64,

    /// Used when a container's `UpdatePolicy` omits `stop_timeout_sec`.
    #[serde(default = "default_stop_timeout_sec")]
    pub default_stop_timeout_sec: u64,

    /// Used when a container's `UpdatePolicy` omits `health_check_timeout_sec`.
    #[serde(default = "default_health_timeout_sec")]
    pub default_health_timeout_sec: u64,

    /// Used when a container's `UpdatePolicy` omits `max_retries`.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,

    /// Used when a container's `UpdatePolicy` omits `retry_backoff_sec`.
    #[serde(default = "default_retry_backoff")]
    pub default_retry_backoff: Vec<u64>,

    /// Logging configuration for the `tracing-subscriber` bootstrap.
    #[serde(default)]
    pub log: LogConfiguration,
}

fn default_engine_id() -> String {
    format!("engine-{}", uuid::Uuid::new_v4())
}

fn default_database_path() -> String {
    "update-engine.db".to_string()
}

fn default_watch_interval_sec() -> u64 {
    3600
}

fn default_registry_concurrency() -> usize {
    8
}

fn default_executor_workers() -> usize {
    5
}

fn default_digest_cache_ttl_sec() -> i64 {
    300
}

fn default_shutdown_grace_sec() -> u64 {
    30
}

fn default_stop_timeout_sec() -> u64 {
    30
}

fn default_health_timeout_sec() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff() -> Vec<u64> {
    vec![30, 60, 120]
}

/// `tracing-subscriber` bootstrap knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfiguration {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfiguration {
    fn default() -> Self {
        Self { level: default_log_level(), json: false }
    }
}

impl Configuration {
    /// Loads configuration from a TOML file. Any field absent from the file
    /// falls back to its spec-mandated default.
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path))?;
        toml::from_str(&content).with_context(|| format!("failed to parse config file: {}", path))
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            engine_id: default_engine_id(),
            database_path: default_database_path(),
            watch_interval_sec: default_watch_interval_sec(),
            registry_concurrency: default_registry_concurrency(),
            executor_workers: default_executor_workers(),
            digest_cache_ttl_sec: default_digest_cache_ttl_sec(),
            shutdown_grace_sec: default_shutdown_grace_sec(),
            default_stop_timeout_sec: default_stop_timeout_sec(),
            default_health_timeout_sec: default_health_timeout_sec(),
            default_max_retries: default_max_retries(),
            default_retry_backoff: default_retry_backoff(),
            log: LogConfiguration::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_every_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "").unwrap();

        let config = Configuration::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.watch_interval_sec, 3600);
        assert_eq!(config.executor_workers, 5);
        assert_eq!(config.default_retry_backoff, vec![30, 60, 120]);
    }

    #[test]
    fn partial_file_overrides_only_named_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "executor_workers = 10\nengine_id = \"node-a\"\n").unwrap();

        let config = Configuration::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.executor_workers, 10);
        assert_eq!(config.engine_id, "node-a");
        assert_eq!(config.registry_concurrency, 8);
    }
}
