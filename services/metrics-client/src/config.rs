//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The password is loaded from the METRICS_PASSWORD env var or
//! password_file, never stored in the TOML directly to avoid leaking secrets.

use common::Secret;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    pub session: SessionConfig,
    #[serde(default)]
    pub stream: StreamConfig,
}

/// Backend connection settings
#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    /// Connect timeout; streaming responses are not bounded by it.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Where the token pair is persisted between runs
#[derive(Debug, Default, Deserialize)]
pub struct StorageConfig {
    /// When unset, tokens live in memory for the life of the process.
    #[serde(default)]
    pub credentials_path: Option<PathBuf>,
}

/// Login and inactivity settings
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    pub email: String,
    #[serde(skip)]
    pub password: Option<Secret<String>>,
    /// Path to a file containing the password (alternative to METRICS_PASSWORD)
    #[serde(default)]
    pub password_file: Option<PathBuf>,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

/// Metrics stream settings
#[derive(Debug, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_time_period")]
    pub time_period: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            time_period: default_time_period(),
        }
    }
}

fn default_timeout() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    900
}

fn default_time_period() -> u32 {
    90
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Password resolution order:
    /// 1. METRICS_PASSWORD env var
    /// 2. password_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        if let Ok(password) = std::env::var("METRICS_PASSWORD") {
            config.session.password = Some(Secret::new(password));
        } else if let Some(ref password_file) = config.session.password_file {
            let password = std::fs::read_to_string(password_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read password_file {}: {e}",
                    password_file.display()
                ))
            })?;
            let password = password.trim_end_matches(['\r', '\n']).to_owned();
            if !password.is_empty() {
                config.session.password = Some(Secret::new(password));
            }
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.api.base_url.starts_with("http://") && !self.api.base_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {}",
                self.api.base_url
            )));
        }
        if self.api.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }
        if self.session.idle_timeout_secs == 0 {
            return Err(common::Error::Config(
                "idle_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.stream.time_period == 0 {
            return Err(common::Error::Config(
                "time_period must be greater than 0".into(),
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
        PathBuf::from("metrics-client.toml")
    }
}
