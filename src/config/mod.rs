use crate::usage::display::DisplayMode;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory name under the platform data directory.
const APP_DIR_NAME: &str = "usagebar";

/// Complete UsageBar configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UsageBarConfig {
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub display: DisplayConfig,
}

/// Polling interval and its bounds
#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    #[serde(default = "default_min_interval_seconds")]
    pub min_interval_seconds: u64,
    #[serde(default = "default_max_interval_seconds")]
    pub max_interval_seconds: u64,
}

fn default_interval_seconds() -> u64 {
    60
}

fn default_min_interval_seconds() -> u64 {
    30
}

fn default_max_interval_seconds() -> u64 {
    600
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval_seconds(),
            min_interval_seconds: default_min_interval_seconds(),
            max_interval_seconds: default_max_interval_seconds(),
        }
    }
}

impl PollingConfig {
    /// Clamps `seconds` into `[min_interval_seconds, max_interval_seconds]`.
    ///
    /// A misconfigured range (min above max) collapses to `min`.
    pub fn clamp(&self, seconds: u64) -> u64 {
        let max = self.max_interval_seconds.max(self.min_interval_seconds);
        seconds.clamp(self.min_interval_seconds, max)
    }

    /// Configured interval, already clamped.
    pub fn effective_interval(&self) -> u64 {
        self.clamp(self.interval_seconds)
    }
}

/// Provider HTTP settings
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_base_url() -> String {
    "https://claude.ai".to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    60
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36".to_string()
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            connect_timeout_seconds: default_connect_timeout(),
            request_timeout_seconds: default_request_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

impl ProviderConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

/// Where the encrypted credential file lives
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Defaults to `<platform data dir>/usagebar`
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_file_name")]
    pub file_name: String,
}

fn default_file_name() -> String {
    "credentials.enc".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            directory: None,
            file_name: default_file_name(),
        }
    }
}

/// Automatic session extraction settings
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractionConfig {
    #[serde(default = "default_sign_in_url")]
    pub sign_in_url: String,
    /// Host (and its subdomains) considered part of the provider
    #[serde(default = "default_provider_host")]
    pub provider_host: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_session_cookie_name")]
    pub session_cookie_name: String,
}

fn default_sign_in_url() -> String {
    "https://claude.ai/login".to_string()
}

fn default_provider_host() -> String {
    "claude.ai".to_string()
}

fn default_max_attempts() -> u32 {
    10
}

fn default_retry_delay_ms() -> u64 {
    1500
}

fn default_session_cookie_name() -> String {
    crate::credentials::SESSION_COOKIE_NAME.to_string()
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            sign_in_url: default_sign_in_url(),
            provider_host: default_provider_host(),
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            session_cookie_name: default_session_cookie_name(),
        }
    }
}

impl ExtractionConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Indicator rendering
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DisplayConfig {
    #[serde(default)]
    pub mode: DisplayMode,
}

impl UsageBarConfig {
    /// Applies `USAGEBAR_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Applies overrides from `lookup`. Unparseable values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("USAGEBAR_INTERVAL_SECONDS") {
            if let Ok(n) = v.trim().parse::<u64>() {
                self.polling.interval_seconds = n;
            }
        }
        if let Some(v) = lookup("USAGEBAR_BASE_URL") {
            let v = v.trim();
            if !v.is_empty() {
                self.provider.base_url = v.trim_end_matches('/').to_string();
            }
        }
        if let Some(v) = lookup("USAGEBAR_DATA_DIR") {
            let v = v.trim();
            if !v.is_empty() {
                self.storage.directory = Some(PathBuf::from(v));
            }
        }
    }

    /// Directory holding the credential file.
    pub fn data_directory(&self) -> PathBuf {
        if let Some(dir) = &self.storage.directory {
            return dir.clone();
        }

        dirs::data_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR_NAME)
    }

    /// Full path of the encrypted credential file.
    pub fn credentials_path(&self) -> PathBuf {
        self.data_directory().join(&self.storage.file_name)
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &Path) -> Result<UsageBarConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: UsageBarConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// Like [`load_config`], but a missing file yields the defaults.
pub fn load_or_default(path: Option<&Path>) -> Result<UsageBarConfig> {
    match path {
        Some(path) if path.exists() => load_config(path),
        _ => Ok(UsageBarConfig::default()),
    }
}
