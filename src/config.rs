//!
//! appgroup configuration
//! ----------------------
//! Settings come from built-in defaults, then an optional JSON file named by
//! `APPGROUP_CONFIG`, then individual `APPGROUP_*` environment variables.

use std::env;
use std::path::PathBuf;
use std::time::Duration;
use serde::Deserialize;

use crate::error::{AppError, AppResult};
use crate::storage::PersistenceSettings;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub http_port: u16,
    pub data_dir: PathBuf,
    /// Write periodic snapshots of the store under `data_dir`
    pub persist: bool,
    pub snapshot_interval_ms: u64,
    pub default_token_ttl_secs: u64,
    pub max_token_ttl_secs: u64,
    /// 0 disables the background tidy of expired UserIDs
    pub tidy_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            http_port: 8200,
            data_dir: PathBuf::from("data"),
            persist: true,
            snapshot_interval_ms: 5000,
            default_token_ttl_secs: 2_764_800,
            max_token_ttl_secs: 2_764_800,
            tidy_interval_secs: 60,
        }
    }
}

fn parse_port_env(name: &str) -> Option<u16> {
    match env::var(name) {
        Ok(val) => val.parse::<u16>().ok(),
        Err(_) => None,
    }
}

fn parse_u64_env(name: &str) -> Option<u64> {
    env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

fn parse_bool_env(name: &str) -> Option<bool> {
    match env::var(name) {
        Ok(v) => {
            let s = v.to_lowercase();
            match s.as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" => Some(false),
                _ => None,
            }
        }
        Err(_) => None,
    }
}

impl Settings {
    /// Defaults, then the `APPGROUP_CONFIG` file if set, then env overrides.
    pub fn from_env() -> AppResult<Self> {
        let mut s = match env::var("APPGROUP_CONFIG") {
            Ok(path) if !path.trim().is_empty() => Self::from_file(path.trim())?,
            _ => Self::default(),
        };
        s.apply_env();
        s.validate()?;
        Ok(s)
    }

    pub fn from_file(path: impl Into<PathBuf>) -> AppResult<Self> {
        let path = path.into();
        let text = std::fs::read_to_string(&path)
            .map_err(|e| AppError::validation("config_unreadable", format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&text)
            .map_err(|e| AppError::validation("config_invalid", format!("{}: {}", path.display(), e)))
    }

    fn apply_env(&mut self) {
        if let Some(p) = parse_port_env("APPGROUP_HTTP_PORT") { self.http_port = p; }
        if let Ok(dir) = env::var("APPGROUP_DATA_DIR") {
            if !dir.trim().is_empty() { self.data_dir = PathBuf::from(dir.trim()); }
        }
        if let Some(b) = parse_bool_env("APPGROUP_PERSIST") { self.persist = b; }
        if let Some(v) = parse_u64_env("APPGROUP_SNAPSHOT_INTERVAL_MS") { self.snapshot_interval_ms = v; }
        if let Some(v) = parse_u64_env("APPGROUP_DEFAULT_TOKEN_TTL_SECS") { self.default_token_ttl_secs = v; }
        if let Some(v) = parse_u64_env("APPGROUP_MAX_TOKEN_TTL_SECS") { self.max_token_ttl_secs = v; }
        if let Some(v) = parse_u64_env("APPGROUP_TIDY_INTERVAL_SECS") { self.tidy_interval_secs = v; }
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.max_token_ttl_secs == 0 {
            return Err(AppError::validation("max_token_ttl", "max token ttl must be positive"));
        }
        if self.default_token_ttl_secs > self.max_token_ttl_secs {
            return Err(AppError::validation("default_token_ttl", "default token ttl exceeds the max token ttl"));
        }
        Ok(())
    }

    pub fn persistence(&self) -> PersistenceSettings {
        PersistenceSettings { enabled: self.persist, interval_ms: self.snapshot_interval_ms.max(1) }
    }

    pub fn default_token_ttl(&self) -> Duration { Duration::from_secs(self.default_token_ttl_secs) }
    pub fn max_token_ttl(&self) -> Duration { Duration::from_secs(self.max_token_ttl_secs) }

    pub fn tidy_interval(&self) -> Option<Duration> {
        (self.tidy_interval_secs > 0).then_some(Duration::from_secs(self.tidy_interval_secs))
    }
}
