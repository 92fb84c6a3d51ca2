// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Service configuration.
//!
//! Sources, later ones winning: built-in defaults, the JSON config file
//! (`~/.harvester/config.json` unless `--config` is given), `HARVESTER_*`
//! environment variables, then command-line flags.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::rpc::{EngineOptions, RpcSettings};
use crate::utils::mask_sensitive;

pub const ENV_RPC_SECRET: &str = "HARVESTER_RPC_SECRET";
pub const ENV_DOWNLOAD_DIR: &str = "HARVESTER_DOWNLOAD_DIR";
pub const ENV_RPC_URL: &str = "HARVESTER_RPC_URL";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub rpc_host: String,
    pub rpc_port: u16,
    /// Full endpoint; overrides host and port when set
    pub rpc_url: Option<String>,
    pub rpc_secret: Option<String>,
    pub rpc_timeout_secs: u64,
    pub rpc_connect_timeout_secs: u64,
    pub rpc_max_attempts: u32,
    pub download_dir: PathBuf,
    pub poll_interval_ms: u64,
    pub max_retries: u32,
    /// Drop finished downloads from the registry after this long
    pub retention_secs: Option<u64>,
    pub max_connection_per_server: u32,
    pub max_concurrent_downloads: u32,
    pub bind_address: String,
    pub port: u16,
    pub rate_limit_per_minute: u32,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rpc_host: "127.0.0.1".to_string(),
            rpc_port: 6800,
            rpc_url: None,
            rpc_secret: None,
            rpc_timeout_secs: 10,
            rpc_connect_timeout_secs: 3,
            rpc_max_attempts: 3,
            download_dir: default_download_dir(),
            poll_interval_ms: 2000,
            max_retries: 3,
            retention_secs: None,
            max_connection_per_server: 4,
            max_concurrent_downloads: 10,
            bind_address: "127.0.0.1".to_string(),
            port: 5000,
            rate_limit_per_minute: 60,
            log_level: "info".to_string(),
        }
    }
}

fn default_download_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join("Downloads")))
        .unwrap_or_else(|| PathBuf::from("downloads"))
        .join("harvester")
}

/// Directory holding `config.json`.
pub fn get_config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not find home directory")?;
    Ok(home.join(".harvester"))
}

/// Default config file location.
pub fn default_config_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join("config.json"))
}

impl Config {
    /// Load from `path` (or the default location), then apply the environment.
    ///
    /// A missing file at the default location yields the defaults; a missing
    /// file given explicitly is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => {
                let default_path = default_config_path()?;
                if default_path.exists() {
                    Self::from_file(&default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Apply `HARVESTER_*` overrides using `lookup` to read variables.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(secret) = lookup(ENV_RPC_SECRET) {
            self.rpc_secret = Some(secret).filter(|s| !s.is_empty());
        }
        if let Some(dir) = lookup(ENV_DOWNLOAD_DIR).filter(|d| !d.is_empty()) {
            self.download_dir = PathBuf::from(dir);
        }
        if let Some(url) = lookup(ENV_RPC_URL).filter(|u| !u.is_empty()) {
            self.rpc_url = Some(url);
        }
    }

    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            bail!("poll_interval_ms must be greater than zero");
        }
        if self.rpc_timeout_secs == 0 || self.rpc_connect_timeout_secs == 0 {
            bail!("RPC timeouts must be greater than zero");
        }
        if self.rpc_max_attempts == 0 {
            bail!("rpc_max_attempts must be at least 1");
        }
        if self.download_dir.as_os_str().is_empty() {
            bail!("download_dir must not be empty");
        }
        if self.rate_limit_per_minute == 0 {
            bail!("rate_limit_per_minute must be greater than zero");
        }
        if self.max_connection_per_server == 0 || self.max_connection_per_server > 16 {
            bail!("max_connection_per_server must be between 1 and 16");
        }
        if self.rpc_url.is_none() && self.rpc_host.trim().is_empty() {
            bail!("rpc_host must not be empty");
        }
        if let Some(url) = &self.rpc_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                bail!("rpc_url must be an http(s) URL, got '{}'", url);
            }
        }
        if let Some(0) = self.retention_secs {
            bail!("retention_secs must be greater than zero when set");
        }
        if parse_level(&self.log_level).is_none() {
            bail!("unknown log_level '{}'", self.log_level);
        }
        Ok(())
    }

    /// JSON-RPC endpoint URL.
    pub fn rpc_endpoint(&self) -> String {
        match &self.rpc_url {
            Some(url) => url.clone(),
            None => format!("http://{}:{}/jsonrpc", self.rpc_host, self.rpc_port),
        }
    }

    pub fn rpc_settings(&self) -> RpcSettings {
        RpcSettings::new(self.rpc_endpoint())
            .with_secret(self.rpc_secret.clone())
            .with_timeouts(
                Duration::from_secs(self.rpc_timeout_secs),
                Duration::from_secs(self.rpc_connect_timeout_secs),
            )
            .with_max_attempts(self.rpc_max_attempts)
    }

    /// Options sent with every submission.
    pub fn default_engine_options(&self) -> EngineOptions {
        let mut options = EngineOptions::new();
        options.insert(
            "max-connection-per-server".to_string(),
            serde_json::Value::String(self.max_connection_per_server.to_string()),
        );
        options
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retention(&self) -> Option<Duration> {
        self.retention_secs.map(Duration::from_secs)
    }

    /// Copy safe to print: the secret is masked.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.rpc_secret = copy.rpc_secret.as_deref().map(|s| mask_sensitive(s, 2));
        copy
    }
}

/// Map a config log level to a tracing level.
pub fn parse_level(level: &str) -> Option<tracing::Level> {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Some(tracing::Level::TRACE),
        "debug" => Some(tracing::Level::DEBUG),
        "info" => Some(tracing::Level::INFO),
        "warn" | "warning" => Some(tracing::Level::WARN),
        "error" => Some(tracing::Level::ERROR),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.rpc_endpoint(), "http://127.0.0.1:6800/jsonrpc");
        assert_eq!(config.poll_interval(), Duration::from_millis(2000));
        assert_eq!(config.retention(), None);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"rpc_port": 6900, "rpc_secret": "abc", "retention_secs": 600}"#).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.rpc_port, 6900);
        assert_eq!(config.rpc_secret.as_deref(), Some("abc"));
        assert_eq!(config.retention(), Some(Duration::from_secs(600)));
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let dir = TempDir::new().unwrap();
        assert!(Config::load(Some(&dir.path().join("nope.json"))).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_RPC_SECRET, "from-env"),
            (ENV_DOWNLOAD_DIR, "/srv/downloads"),
            (ENV_RPC_URL, "http://aria2:6800/jsonrpc"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.rpc_secret.as_deref(), Some("from-env"));
        assert_eq!(config.download_dir, PathBuf::from("/srv/downloads"));
        assert_eq!(config.rpc_endpoint(), "http://aria2:6800/jsonrpc");
    }

    #[test]
    fn test_validation_failures() {
        let cases: Vec<Box<dyn Fn(&mut Config)>> = vec![
            Box::new(|c| c.poll_interval_ms = 0),
            Box::new(|c| c.rpc_timeout_secs = 0),
            Box::new(|c| c.rpc_max_attempts = 0),
            Box::new(|c| c.download_dir = PathBuf::new()),
            Box::new(|c| c.max_connection_per_server = 17),
            Box::new(|c| c.rpc_url = Some("ftp://x".into())),
            Box::new(|c| c.retention_secs = Some(0)),
            Box::new(|c| c.log_level = "loud".into()),
        ];
        for mutate in cases {
            let mut config = Config::default();
            mutate(&mut config);
            assert!(config.validate().is_err(), "expected invalid: {:?}", config);
        }
    }

    #[test]
    fn test_redacted_masks_secret() {
        let config = Config {
            rpc_secret: Some("supersecret".into()),
            ..Config::default()
        };
        let shown = serde_json::to_string(&config.redacted()).unwrap();
        assert!(!shown.contains("supersecret"));
        assert!(shown.contains("su..."));
    }

    #[test]
    fn test_engine_options() {
        let options = Config::default().default_engine_options();
        assert_eq!(options["max-connection-per-server"], "4");
    }
}
