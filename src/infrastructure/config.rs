use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::domain::retry::RetryPolicy;

/// Environment override prefix: `DBMIRROR__REMOTE__PASSWORD=...`.
const ENV_PREFIX: &str = "DBMIRROR";

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub local: EndpointConfig,
    pub remote: EndpointConfig,
    #[serde(default)]
    pub settings: SyncSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EndpointConfig {
    /// Role label, filled in by the loader ("local" / "remote").
    #[serde(default)]
    pub name: String,
    /// Database driver: "mysql" (default), "mariadb", "postgres" or "sqlite".
    #[serde(default = "default_driver")]
    pub driver: String,
    #[serde(default = "default_host")]
    pub host: String,
    /// Defaults to the driver's standard port.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// Database name, or file path for SQLite.
    pub database: String,
}

fn default_driver() -> String {
    "mysql".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct SyncSettings {
    pub batch_size: usize,
    pub delete_missing: bool,
    pub dry_run: bool,
    pub parallel: bool,
    pub pool_size: usize,
    /// Upsert count above which the bulk-transfer fallback is used; 0 disables it.
    pub threshold: usize,
    /// Largest snapshot held in memory for one side of one table.
    pub max_snapshot_rows: usize,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            delete_missing: true,
            dry_run: false,
            parallel: false,
            pool_size: 5,
            threshold: 10_000,
            max_snapshot_rows: 1_000_000,
            retry_attempts: 3,
            retry_delay_ms: 1_000,
        }
    }
}

impl SyncSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts,
            delay: Duration::from_millis(self.retry_delay_ms),
        }
    }
}

impl EndpointConfig {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(match self.driver.as_str() {
            "postgres" => 5432,
            _ => 3306,
        })
    }

    /// Build a sqlx-compatible connection URL from this config.
    pub fn url(&self) -> String {
        match self.driver.as_str() {
            "postgres" => format!(
                "postgres://{}:{}@{}:{}/{}",
                self.user,
                self.password,
                self.host,
                self.port(),
                self.database
            ),
            "sqlite" => format!("sqlite://{}", self.database),
            _ => format!(
                "mysql://{}:{}@{}:{}/{}",
                self.user,
                self.password,
                self.host,
                self.port(),
                self.database
            ),
        }
    }
}

impl AppConfig {
    /// Load a TOML file, then apply `DBMIRROR__*` environment overrides.
    pub fn load(path: &str) -> Result<Self> {
        let builder = Config::builder()
            .add_source(File::new(path, FileFormat::Toml))
            .add_source(env_source());
        let cfg = builder
            .build()
            .with_context(|| format!("Failed to read config file: {}", path))?;
        Self::finish(cfg)
    }

    /// Parse a TOML document (no environment overrides).
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let cfg = Config::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()
            .context("Failed to parse config TOML")?;
        Self::finish(cfg)
    }

    fn finish(cfg: Config) -> Result<Self> {
        let mut app: AppConfig = cfg
            .try_deserialize()
            .context("Invalid configuration")?;
        if app.local.name.is_empty() {
            app.local.name = "local".to_string();
        }
        if app.remote.name.is_empty() {
            app.remote.name = "remote".to_string();
        }
        Ok(app)
    }

    /// `./dbmirror.toml` when present, else `<config dir>/dbmirror/config.toml`.
    pub fn default_path() -> PathBuf {
        let local = PathBuf::from("dbmirror.toml");
        if local.exists() {
            return local;
        }
        dirs::config_dir()
            .map(|dir| dir.join("dbmirror").join("config.toml"))
            .unwrap_or(local)
    }
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}
