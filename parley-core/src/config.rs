// ABOUTME: Configuration parsing from TOML file with environment variable overrides
// ABOUTME: Every section is optional; credentials never appear here (each call carries its own)
use crate::backlog::{DEFAULT_FALLBACK_WINDOW, DEFAULT_PAGE_SIZE};
use crate::paths;
use crate::session::SessionMode;
use crate::traits::MAX_HISTORY_LIMIT;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub backlog: BacklogConfig,
    #[serde(default)]
    pub waiter: WaiterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding watermarks.db (default: XDG data dir)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// "discord" or "memory"
    #[serde(default = "default_provider_kind")]
    pub kind: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: default_provider_kind(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacklogConfig {
    /// Recent messages returned when a scope has no watermark yet
    #[serde(default = "default_fallback_window")]
    pub fallback_window: usize,
    #[serde(default = "default_page_size")]
    pub default_page_size: usize,
}

impl Default for BacklogConfig {
    fn default() -> Self {
        Self {
            fallback_window: default_fallback_window(),
            default_page_size: default_page_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaiterConfig {
    /// Upper bound for a single wait; 0 means unlimited
    #[serde(default = "default_max_timeout_secs")]
    pub max_timeout_secs: u64,
    #[serde(default = "default_wait_mode")]
    pub wait_mode: SessionMode,
}

impl Default for WaiterConfig {
    fn default() -> Self {
        Self {
            max_timeout_secs: default_max_timeout_secs(),
            wait_mode: default_wait_mode(),
        }
    }
}

impl WaiterConfig {
    /// Deadline for a request. A missing or zero timeout waits indefinitely,
    /// or up to `max_timeout_secs` when the operator set one. A timeout above
    /// that limit is rejected rather than shortened.
    pub fn effective_timeout(&self, requested_secs: Option<f64>) -> Result<Option<Duration>> {
        let max = (self.max_timeout_secs > 0).then(|| Duration::from_secs(self.max_timeout_secs));
        let requested = match requested_secs {
            None => None,
            Some(secs) if !secs.is_finite() || secs < 0.0 => {
                anyhow::bail!("timeout must be a non-negative number of seconds, got {}", secs)
            }
            Some(secs) if secs == 0.0 => None,
            Some(secs) => Some(Duration::from_secs_f64(secs)),
        };
        match (requested, max) {
            (Some(requested), Some(max)) if requested > max => anyhow::bail!(
                "timeout of {}s exceeds the server maximum of {}s",
                requested.as_secs_f64(),
                max.as_secs()
            ),
            (Some(requested), _) => Ok(Some(requested)),
            (None, max) => Ok(max),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    13100
}

fn default_provider_kind() -> String {
    "discord".to_string()
}

fn default_fallback_window() -> usize {
    DEFAULT_FALLBACK_WINDOW
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

fn default_max_timeout_secs() -> u64 {
    0
}

fn default_wait_mode() -> SessionMode {
    SessionMode::Stateful
}

impl Config {
    /// Find config file in order of precedence:
    /// 1. PARLEY_CONFIG_PATH env var (if set)
    /// 2. ./parley.toml
    /// 3. ~/.config/parley/config.toml
    fn find_config_file() -> Option<PathBuf> {
        if let Ok(env_path) = std::env::var("PARLEY_CONFIG_PATH") {
            let path = PathBuf::from(env_path);
            if path.exists() {
                return Some(path);
            }
            tracing::warn!(path = %path.display(), "PARLEY_CONFIG_PATH does not exist, ignoring");
        }

        let local_config = PathBuf::from("parley.toml");
        if local_config.exists() {
            return Some(local_config);
        }

        let xdg_config = paths::config_file();
        if xdg_config.exists() {
            return Some(xdg_config);
        }

        None
    }

    /// Load configuration with environment variable overrides
    pub fn load() -> Result<Self> {
        let mut config = if let Some(config_path) = Self::find_config_file() {
            tracing::info!(
                path = %config_path.display(),
                "Loading configuration from file"
            );
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            Self::from_toml_str(&content)
                .with_context(|| format!("Failed to parse {}", config_path.display()))?
        } else {
            tracing::info!("No config file found, using environment variables and defaults");
            Config::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str::<Config>(content)?)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(val) = std::env::var("PARLEY_HOST") {
            self.server.host = val;
        }
        if let Ok(val) = std::env::var("PARLEY_PORT") {
            self.server.port = val.parse().with_context(|| {
                format!("PARLEY_PORT must be a valid port number, got: {}", val)
            })?;
        }
        if let Ok(val) = std::env::var("PARLEY_DATA_DIR") {
            self.storage.path = Some(val);
        }
        if let Ok(val) = std::env::var("PARLEY_PROVIDER") {
            self.provider.kind = val;
        }
        if let Ok(val) = std::env::var("PARLEY_FALLBACK_WINDOW") {
            self.backlog.fallback_window = val.parse().with_context(|| {
                format!("PARLEY_FALLBACK_WINDOW must be a number, got: {}", val)
            })?;
        }
        if let Ok(val) = std::env::var("PARLEY_PAGE_SIZE") {
            self.backlog.default_page_size = val
                .parse()
                .with_context(|| format!("PARLEY_PAGE_SIZE must be a number, got: {}", val))?;
        }
        if let Ok(val) = std::env::var("PARLEY_MAX_WAIT_SECS") {
            self.waiter.max_timeout_secs = val.parse().with_context(|| {
                format!("PARLEY_MAX_WAIT_SECS must be a number of seconds, got: {}", val)
            })?;
        }
        if let Ok(val) = std::env::var("PARLEY_WAIT_MODE") {
            self.waiter.wait_mode = val.parse()?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.host.trim().is_empty() {
            anyhow::bail!("server.host must not be empty");
        }
        if !(1..=MAX_HISTORY_LIMIT).contains(&self.backlog.fallback_window) {
            anyhow::bail!(
                "backlog.fallback_window must be between 1 and {}, got {}",
                MAX_HISTORY_LIMIT,
                self.backlog.fallback_window
            );
        }
        if !(1..=MAX_HISTORY_LIMIT).contains(&self.backlog.default_page_size) {
            anyhow::bail!(
                "backlog.default_page_size must be between 1 and {}, got {}",
                MAX_HISTORY_LIMIT,
                self.backlog.default_page_size
            );
        }
        match self.provider.kind.as_str() {
            "discord" | "memory" => Ok(()),
            other => anyhow::bail!("Unknown provider kind: {} (expected discord or memory)", other),
        }
    }

    /// Directory for the watermark database
    pub fn data_dir(&self) -> PathBuf {
        self.storage
            .path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(paths::data_dir)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
