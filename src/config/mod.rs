//! Configuration management.
//!
//! The configuration file is YAML by default; a `.toml` extension selects
//! TOML. Only `telegram` and `feeds` are required, every other section has
//! defaults.
//!
//! ```yaml
//! telegram:
//!   bot_token: "123:abc"
//!   check_interval: 300
//! feeds:
//!   - name: example
//!     url: https://example.com/feed.xml
//!     channels: ["@example"]
//! ```
//!
//! # Environment Overrides
//!
//! | Variable | Overrides |
//! |----------|-----------|
//! | `FEEDRELAY_BOT_TOKEN` | `telegram.bot_token` |
//! | `FEEDRELAY_DATA_DIR` | `storage.data_dir` |
//! | `FEEDRELAY_LOG_FORMAT` | `observability.logging.format` |
//! | `FEEDRELAY_METRICS_ENABLED` | `observability.metrics.enabled` |
//! | `FEEDRELAY_METRICS_PORT` | `observability.metrics.port` |

mod reload;

pub use reload::ConfigWatcher;

use crate::dedup::{FilterParams, StoreConfig};
use crate::observability::LogFormat;
use crate::pipeline::RetryPolicy;
use crate::transport::DEFAULT_API_BASE;
use crate::{Error, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_ENV: &str = "FEEDRELAY_CONFIG_PATH";

/// Article expiration used when a feed does not set one (30 days).
pub const DEFAULT_ARTICLE_EXPIRATION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

const DEFAULT_DATA_DIR_NAME: &str = "feedrelay-data";

/// Complete relay configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Bot credentials and polling cadence.
    pub telegram: TelegramConfig,
    /// Dedup store settings.
    #[serde(default)]
    pub storage: StorageSettings,
    /// Concurrency and retry tunables.
    #[serde(default)]
    pub delivery: DeliverySettings,
    /// Logging and metrics.
    #[serde(default)]
    pub observability: ObservabilitySettings,
    /// Feeds to relay.
    #[serde(default)]
    pub feeds: Vec<FeedConfig>,
}

/// Telegram section.
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    /// Bot API token.
    #[serde(default = "empty_secret", deserialize_with = "secret_string_serde::deserialize")]
    pub bot_token: SecretString,
    /// Seconds between polling cycles.
    #[serde(default)]
    pub check_interval: u64,
    /// Bot API base URL.
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl TelegramConfig {
    /// Polling interval.
    #[must_use]
    pub const fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval)
    }

    /// Request timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Storage section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Bucket directory; relative paths are resolved against the config file's directory.
    pub data_dir: Option<PathBuf>,
    /// Filter capacity.
    pub expected_items: u64,
    /// Target false-positive rate.
    pub false_positive_rate: f64,
    /// Days a bucket may go without a mark before it is reset.
    pub expiration_days: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        let filter = FilterParams::default();
        Self {
            data_dir: None,
            expected_items: filter.expected_items,
            false_positive_rate: filter.false_positive_rate,
            expiration_days: 30,
        }
    }
}

impl StorageSettings {
    /// Resolves the data directory for a config file at `config_path`.
    #[must_use]
    pub fn resolve_data_dir(&self, config_path: &Path) -> PathBuf {
        let base = config_path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        match &self.data_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => base.join(dir),
            None => base.join(DEFAULT_DATA_DIR_NAME),
        }
    }

    /// Builds the store configuration for a config file at `config_path`.
    #[must_use]
    pub fn store_config(&self, config_path: &Path) -> StoreConfig {
        StoreConfig::new(self.resolve_data_dir(config_path))
            .with_filter(FilterParams::new(
                self.expected_items,
                self.false_positive_rate,
            ))
            .with_expiration(Duration::from_secs(
                self.expiration_days.saturating_mul(24 * 60 * 60),
            ))
    }
}

/// Delivery section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DeliverySettings {
    /// Feeds processed at once.
    pub feed_concurrency: usize,
    /// Sends in flight at once within one feed.
    pub channel_concurrency: usize,
    /// Send attempts per message, including the first.
    pub max_attempts: u32,
    /// Backoff base in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound of the random backoff jitter in milliseconds.
    pub max_jitter_ms: u64,
    /// Pause after each successful send in milliseconds.
    pub cooldown_ms: u64,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            feed_concurrency: 2,
            channel_concurrency: 2,
            max_attempts: 3,
            base_delay_ms: 1000,
            max_jitter_ms: 500,
            cooldown_ms: 1000,
        }
    }
}

impl DeliverySettings {
    /// The retry policy these settings describe.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_jitter: Duration::from_millis(self.max_jitter_ms),
            cooldown: Duration::from_millis(self.cooldown_ms),
        }
    }
}

/// Observability section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ObservabilitySettings {
    /// Log output.
    pub logging: LoggingSettings,
    /// Prometheus metrics.
    pub metrics: MetricsSettings,
}

/// Logging settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Output format.
    pub format: LogFormat,
    /// Append logs to this file instead of stderr.
    pub file: Option<PathBuf>,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: Option<String>,
}

/// Metrics settings.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    /// Whether to install the Prometheus recorder.
    pub enabled: bool,
    /// Port of the scrape endpoint.
    pub port: u16,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

/// One relayed feed.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FeedConfig {
    /// Unique display name.
    #[serde(default)]
    pub name: String,
    /// Feed URL; also the dedup bucket key.
    #[serde(default)]
    pub url: String,
    /// Items published longer ago than this are skipped.
    #[serde(default)]
    pub article_expiration_duration_hours: Option<u64>,
    /// Send the existing backlog on first sight instead of recording it silently.
    #[serde(default)]
    pub first_push: bool,
    /// Destination channels.
    #[serde(default)]
    pub channels: Vec<String>,
    /// Message template; empty uses the default.
    #[serde(default)]
    pub template: String,
}

impl FeedConfig {
    /// Creates a feed with defaults for everything but name, URL, and channels.
    #[must_use]
    pub fn new(name: impl Into<String>, url: impl Into<String>, channels: &[&str]) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            article_expiration_duration_hours: None,
            first_push: false,
            channels: channels.iter().map(ToString::to_string).collect(),
            template: String::new(),
        }
    }

    /// Age beyond which an item is considered stale.
    #[must_use]
    pub fn article_expiration(&self) -> Duration {
        self.article_expiration_duration_hours
            .map_or(DEFAULT_ARTICLE_EXPIRATION, |hours| {
                Duration::from_secs(hours.saturating_mul(60 * 60))
            })
    }
}

/// Configuration file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// YAML (default).
    Yaml,
    /// TOML.
    Toml,
}

impl ConfigFormat {
    /// Picks the format from the file extension.
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => Self::Toml,
            _ => Self::Yaml,
        }
    }
}

impl RelayConfig {
    /// Loads, overrides from the environment, and validates a config file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OperationFailed`] if the file cannot be read or
    /// parsed and [`Error::InvalidInput`] if validation fails.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::OperationFailed {
            operation: "read_config_file".to_string(),
            cause: format!("{}: {e}", path.display()),
        })?;

        let mut config = Self::parse(&contents, ConfigFormat::from_path(path))?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parses configuration text without validating it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OperationFailed`] on syntax or type errors.
    pub fn parse(contents: &str, format: ConfigFormat) -> Result<Self> {
        let parsed = match format {
            ConfigFormat::Yaml => serde_yaml_ng::from_str(contents).map_err(|e| e.to_string()),
            ConfigFormat::Toml => toml::from_str(contents).map_err(|e| e.to_string()),
        };
        parsed.map_err(|cause| Error::OperationFailed {
            operation: "parse_config_file".to_string(),
            cause,
        })
    }

    /// Applies `FEEDRELAY_*` overrides using `lookup` to read variables.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(token) = lookup("FEEDRELAY_BOT_TOKEN") {
            self.telegram.bot_token = SecretString::from(token);
        }
        if let Some(dir) = lookup("FEEDRELAY_DATA_DIR") {
            self.storage.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(format) = lookup("FEEDRELAY_LOG_FORMAT") {
            self.observability.logging.format = LogFormat::parse(&format);
        }
        if let Some(enabled) = lookup("FEEDRELAY_METRICS_ENABLED") {
            let enabled = enabled.to_lowercase();
            self.observability.metrics.enabled = enabled == "true" || enabled == "1" || enabled == "yes";
        }
        if let Some(port) = lookup("FEEDRELAY_METRICS_PORT").and_then(|p| p.parse().ok()) {
            self.observability.metrics.port = port;
        }
    }

    /// Checks the configuration for consistency.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.telegram.bot_token.expose_secret().is_empty() {
            return Err(invalid("telegram bot token is required"));
        }
        if self.telegram.check_interval == 0 {
            return Err(invalid("telegram check interval must be positive"));
        }
        if self.feeds.is_empty() {
            return Err(invalid("at least one feed must be configured"));
        }

        let mut names = HashSet::new();
        let mut pairs = HashSet::new();
        for feed in &self.feeds {
            if feed.name.is_empty() {
                return Err(invalid("feed name is required"));
            }
            if feed.url.is_empty() {
                return Err(invalid("feed URL is required"));
            }
            if feed.channels.is_empty() {
                return Err(invalid(&format!(
                    "feed {} must have at least one channel",
                    feed.name
                )));
            }
            if !names.insert(feed.name.as_str()) {
                return Err(invalid(&format!("duplicate feed name found: {}", feed.name)));
            }
            let pair = format!("{}|{}", feed.name, feed.url);
            if !pairs.insert(pair.clone()) {
                return Err(invalid(&format!(
                    "duplicate feed name and URL combination found: {pair}"
                )));
            }
        }

        let delivery = &self.delivery;
        if delivery.feed_concurrency == 0 || delivery.channel_concurrency == 0 {
            return Err(invalid("delivery concurrency limits must be positive"));
        }
        if delivery.max_attempts == 0 {
            return Err(invalid("delivery max_attempts must be positive"));
        }
        if self.storage.expiration_days == 0 {
            return Err(invalid("storage expiration_days must be positive"));
        }

        FilterParams::new(self.storage.expected_items, self.storage.false_positive_rate)
            .validate()
    }
}

/// Returns the default configuration path.
///
/// Uses `FEEDRELAY_CONFIG_PATH` when set, otherwise
/// `<platform config dir>/feedrelay/config.yaml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_PATH_ENV).filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(path));
    }
    let base_dirs = directories::BaseDirs::new()?;
    Some(base_dirs.config_dir().join("feedrelay").join("config.yaml"))
}

fn invalid(message: &str) -> Error {
    Error::InvalidInput(message.to_string())
}

fn empty_secret() -> SecretString {
    SecretString::from(String::new())
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

const fn default_timeout_secs() -> u64 {
    30
}

/// Serde helper for `SecretString` fields.
mod secret_string_serde {
    use secrecy::SecretString;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(SecretString::from(s))
    }
}
