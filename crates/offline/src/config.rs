//! Sync configuration.

use std::path::PathBuf;
use std::time::Duration;

use guardian_core::EntityKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::default_cache_path;
use crate::engine::EngineOptions;

const ENV_PREFIX: &str = "GUARDIAN_";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: String,
        value: String,
        reason: String,
    },

    #[error("could not resolve an application data directory for the cache")]
    DataDir,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Base URL of the remote backend
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Optional bearer token sent with every request
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Cache database file; defaults to the OS data directory
    #[serde(default)]
    pub cache_path: Option<PathBuf>,

    /// Connectivity debounce window in milliseconds
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Hard timeout per remote call in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Periodic sync interval in seconds
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,

    /// Health probe interval in seconds
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,

    #[serde(default = "default_max_concurrent_pushes")]
    pub max_concurrent_pushes: usize,

    /// Entity kinds pulled at startup for offline use
    #[serde(default = "default_preload")]
    pub preload: Vec<EntityKind>,
}

fn default_api_url() -> String { "http://localhost:5000".to_string() }
fn default_debounce_ms() -> u64 { 1000 }
fn default_request_timeout_ms() -> u64 { 10_000 }
fn default_sync_interval_secs() -> u64 { 60 }
fn default_probe_interval_secs() -> u64 { 5 }
fn default_max_concurrent_pushes() -> usize { 4 }
fn default_preload() -> Vec<EntityKind> { vec![EntityKind::User] }

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            auth_token: None,
            cache_path: None,
            debounce_ms: default_debounce_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            sync_interval_secs: default_sync_interval_secs(),
            probe_interval_secs: default_probe_interval_secs(),
            max_concurrent_pushes: default_max_concurrent_pushes(),
            preload: default_preload(),
        }
    }
}

impl SyncConfig {
    /// Build from `GUARDIAN_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; absent or blank values keep defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |suffix: &str| {
            let var = format!("{ENV_PREFIX}{suffix}");
            lookup(&var)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(|v| (var, v))
        };

        let mut config = Self::default();
        if let Some((_, url)) = get("API_URL") {
            config.api_url = url;
        }
        if let Some((_, token)) = get("AUTH_TOKEN") {
            config.auth_token = Some(token);
        }
        if let Some((_, path)) = get("CACHE_PATH") {
            config.cache_path = Some(PathBuf::from(path));
        }
        if let Some((var, raw)) = get("DEBOUNCE_MS") {
            config.debounce_ms = parse_number(&var, &raw)?;
        }
        if let Some((var, raw)) = get("REQUEST_TIMEOUT_MS") {
            config.request_timeout_ms = parse_positive(&var, &raw)?;
        }
        if let Some((var, raw)) = get("SYNC_INTERVAL_SECS") {
            config.sync_interval_secs = parse_positive(&var, &raw)?;
        }
        if let Some((var, raw)) = get("PROBE_INTERVAL_SECS") {
            config.probe_interval_secs = parse_positive(&var, &raw)?;
        }
        if let Some((var, raw)) = get("MAX_CONCURRENT_PUSHES") {
            config.max_concurrent_pushes = parse_positive(&var, &raw)? as usize;
        }
        if let Some((var, raw)) = get("PRELOAD") {
            config.preload = parse_kinds(&var, &raw)?;
        }
        Ok(config)
    }

    /// Cache location, resolving the OS data directory when unset.
    pub fn resolve_cache_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.cache_path {
            Some(path) => Ok(path.clone()),
            None => default_cache_path().ok_or(ConfigError::DataDir),
        }
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            request_timeout: self.request_timeout(),
            max_concurrent_pushes: self.max_concurrent_pushes.max(1),
            preload: self.preload.clone(),
        }
    }
}

fn invalid(var: &str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var: var.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse_number(var: &str, raw: &str) -> Result<u64, ConfigError> {
    raw.parse::<u64>().map_err(|e| invalid(var, raw, e.to_string()))
}

fn parse_positive(var: &str, raw: &str) -> Result<u64, ConfigError> {
    match parse_number(var, raw)? {
        0 => Err(invalid(var, raw, "must be greater than zero")),
        n => Ok(n),
    }
}

/// Comma-separated kind names; `none` disables preloading.
fn parse_kinds(var: &str, raw: &str) -> Result<Vec<EntityKind>, ConfigError> {
    if raw.eq_ignore_ascii_case("none") {
        return Ok(Vec::new());
    }
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<EntityKind>().map_err(|e| invalid(var, raw, e.to_string())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = SyncConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.api_url, "http://localhost:5000");
        assert_eq!(config.debounce(), Duration::from_secs(1));
        assert_eq!(config.preload, vec![EntityKind::User]);
    }

    #[test]
    fn env_overrides_defaults() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("GUARDIAN_API_URL", "https://guardian.example.org"),
            ("GUARDIAN_AUTH_TOKEN", "secret"),
            ("GUARDIAN_CACHE_PATH", "/tmp/guardian.db"),
            ("GUARDIAN_REQUEST_TIMEOUT_MS", "2500"),
            ("GUARDIAN_PRELOAD", "user, child"),
            ("GUARDIAN_DEBOUNCE_MS", "  "),
        ]))
        .unwrap();

        assert_eq!(config.api_url, "https://guardian.example.org");
        assert_eq!(config.auth_token.as_deref(), Some("secret"));
        assert_eq!(config.resolve_cache_path().unwrap(), PathBuf::from("/tmp/guardian.db"));
        assert_eq!(config.engine_options().request_timeout, Duration::from_millis(2500));
        assert_eq!(config.preload, vec![EntityKind::User, EntityKind::Child]);
        assert_eq!(config.debounce_ms, 1000);
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = SyncConfig::from_lookup(lookup(&[("GUARDIAN_SYNC_INTERVAL_SECS", "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref var, .. } if var == "GUARDIAN_SYNC_INTERVAL_SECS"));

        assert!(SyncConfig::from_lookup(lookup(&[("GUARDIAN_MAX_CONCURRENT_PUSHES", "0")])).is_err());
        assert!(SyncConfig::from_lookup(lookup(&[("GUARDIAN_PRELOAD", "user,invoice")])).is_err());
    }

    #[test]
    fn preload_can_be_disabled() {
        let config = SyncConfig::from_lookup(lookup(&[("GUARDIAN_PRELOAD", "none")])).unwrap();
        assert!(config.preload.is_empty());
    }

    #[test]
    fn deserializes_with_partial_fields() {
        let config: SyncConfig =
            serde_json::from_str(r#"{ "api_url": "http://10.0.0.2:5000", "preload": ["child"] }"#).unwrap();
        assert_eq!(config.sync_interval_secs, 60);
        assert_eq!(config.preload, vec![EntityKind::Child]);
    }
}
