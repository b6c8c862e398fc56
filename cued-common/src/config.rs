//! Configuration loading and resolution
//!
//! Resolution priority (highest first):
//! 1. Command-line argument (applied by the binary)
//! 2. Environment variable (`CUED_*`)
//! 3. TOML config file
//! 4. Compiled default

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Default poll cadence
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;
/// Default runs per session (~2h at 5s cadence)
pub const DEFAULT_TOTAL_RUNS: u32 = 1_440;
/// Default minimum spacing between credential refresh attempts (30 min)
pub const DEFAULT_REFRESH_COOLDOWN_MS: u64 = 1_800_000;
/// Default multiple of the poll interval inside which an iteration acts
pub const DEFAULT_SAFETY_MARGIN_MULTIPLIER: u32 = 2;
/// Default number of schedulers run in parallel
pub const DEFAULT_WORKER_CONCURRENCY: usize = 5;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 5790;
pub const DEFAULT_API_BASE_URL: &str = "https://api.spotify.com/v1";
pub const DEFAULT_TOKEN_URL: &str = "https://accounts.spotify.com/api/token";

/// Top-level service configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CuedConfig {
    pub poll_interval_ms: u64,
    pub total_runs: u32,
    pub refresh_cooldown_ms: u64,
    pub safety_margin_multiplier: u32,
    pub worker_concurrency: usize,
    /// Upper bound on a single remote call; falls back to `poll_interval_ms`
    pub request_timeout_ms: Option<u64>,
    pub database_path: Option<PathBuf>,
    pub server: ServerConfig,
    pub spotify: SpotifyConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SpotifyConfig {
    pub client_id: Option<String>,
    pub api_base_url: String,
    pub token_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for CuedConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            total_runs: DEFAULT_TOTAL_RUNS,
            refresh_cooldown_ms: DEFAULT_REFRESH_COOLDOWN_MS,
            safety_margin_multiplier: DEFAULT_SAFETY_MARGIN_MULTIPLIER,
            worker_concurrency: DEFAULT_WORKER_CONCURRENCY,
            request_timeout_ms: None,
            database_path: None,
            server: ServerConfig::default(),
            spotify: SpotifyConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl Default for SpotifyConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl CuedConfig {
    /// Reject values the scheduler cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(Error::Config("poll_interval_ms must be greater than 0".to_string()));
        }
        if self.worker_concurrency == 0 {
            return Err(Error::Config("worker_concurrency must be greater than 0".to_string()));
        }
        if self.safety_margin_multiplier == 0 {
            return Err(Error::Config(
                "safety_margin_multiplier must be greater than 0".to_string(),
            ));
        }
        if self.request_timeout_ms == Some(0) {
            return Err(Error::Config("request_timeout_ms must be greater than 0".to_string()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn refresh_cooldown(&self) -> Duration {
        Duration::from_millis(self.refresh_cooldown_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.unwrap_or(self.poll_interval_ms))
    }

    /// Configured database path, or the platform default
    pub fn resolved_database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(default_database_path)
    }

    /// Overlay `CUED_*` environment variables onto this configuration
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(v) = env_parse::<u64>("CUED_POLL_INTERVAL_MS")? {
            self.poll_interval_ms = v;
        }
        if let Some(v) = env_parse::<u32>("CUED_TOTAL_RUNS")? {
            self.total_runs = v;
        }
        if let Some(v) = env_parse::<u64>("CUED_REFRESH_COOLDOWN_MS")? {
            self.refresh_cooldown_ms = v;
        }
        if let Some(v) = env_parse::<u32>("CUED_SAFETY_MARGIN_MULTIPLIER")? {
            self.safety_margin_multiplier = v;
        }
        if let Some(v) = env_parse::<usize>("CUED_WORKER_CONCURRENCY")? {
            self.worker_concurrency = v;
        }
        if let Some(v) = env_parse::<u64>("CUED_REQUEST_TIMEOUT_MS")? {
            self.request_timeout_ms = Some(v);
        }
        if let Ok(path) = std::env::var("CUED_DATABASE_PATH") {
            self.database_path = Some(PathBuf::from(path));
        }
        if let Ok(client_id) = std::env::var("CUED_SPOTIFY_CLIENT_ID") {
            if !client_id.trim().is_empty() {
                self.spotify.client_id = Some(client_id);
            }
        }
        if let Ok(url) = std::env::var("CUED_SPOTIFY_API_BASE_URL") {
            self.spotify.api_base_url = url;
        }
        if let Ok(url) = std::env::var("CUED_SPOTIFY_TOKEN_URL") {
            self.spotify.token_url = url;
        }
        if let Ok(level) = std::env::var("CUED_LOG_LEVEL") {
            self.logging.level = level;
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| Error::Config(format!("{}={:?} is invalid: {}", name, raw, e))),
        Err(_) => Ok(None),
    }
}

/// Load configuration from a TOML file
///
/// A missing file is not an error: a warning is logged and defaults apply.
pub fn load_toml_config(path: &Path) -> Result<CuedConfig> {
    if !path.exists() {
        warn!("Config file not found at {}, using defaults", path.display());
        return Ok(CuedConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: CuedConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))?;

    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

/// Full resolution: TOML file (if any), then environment, then validation
pub fn resolve_config(config_path: Option<&Path>) -> Result<CuedConfig> {
    let mut config = match config_path
        .map(Path::to_path_buf)
        .or_else(default_config_path)
    {
        Some(path) => load_toml_config(&path)?,
        None => {
            warn!("No config directory available on this platform, using defaults");
            CuedConfig::default()
        }
    };
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

/// Write configuration to a TOML file (temp file + rename)
pub fn write_toml_config(config: &CuedConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("toml.tmp");
    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// `~/.config/cued/cued.toml` (platform equivalent elsewhere)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("cued").join("cued.toml"))
}

/// `~/.local/share/cued/cued.db` (platform equivalent elsewhere)
pub fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("cued"))
        .unwrap_or_else(|| PathBuf::from("./cued_data"))
        .join("cued.db")
}
