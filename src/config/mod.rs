use crate::detector::{DetectorConfig, WhalePolicy};
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub dashboard: DashboardConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Local path of the exporter's JSON snapshot.
    #[serde(default = "default_snapshot_path")]
    pub path: String,
    /// HTTP URL of the snapshot; takes precedence over `path` when set.
    #[serde(default)]
    pub url: String,
    /// How long interactive reads may reuse a cached snapshot.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_load_timeout_ms")]
    pub load_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Valkey/Redis URL. Empty = in-memory store.
    #[serde(default = "default_store_url")]
    pub url: String,
    /// Key namespace.
    #[serde(default = "default_store_prefix")]
    pub prefix: String,
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    /// Bot token - loaded from env TELEGRAM_BOT_TOKEN
    #[serde(default)]
    pub bot_token: String,
    /// Chat id of the public alert channel.
    #[serde(default)]
    pub public_channel_id: String,
    #[serde(default = "default_telegram_api_url")]
    pub api_url: String,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertsConfig {
    /// Whale alert threshold in whole units.
    #[serde(default = "default_whale_threshold")]
    pub whale_threshold: u64,
    /// Base units per whole unit.
    #[serde(default = "default_unit_scale")]
    pub unit_scale: u64,
    /// Skip alert limit given to new subscriptions.
    #[serde(default = "default_skip_limit")]
    pub default_skip_limit: u64,
    #[serde(default)]
    pub whale_policy: WhalePolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    /// Seconds between reconciliation cycles.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Delay before the first cycle.
    #[serde(default = "default_warmup_secs")]
    pub warmup_secs: u64,
    /// Deadline for the pre-dispatch part of a cycle.
    #[serde(default = "default_cycle_timeout_secs")]
    pub cycle_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DashboardConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_dashboard_bind")]
    pub bind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_snapshot_path() -> String {
    "all_validator_data.json".to_string()
}
fn default_ttl_secs() -> u64 {
    30
}
fn default_load_timeout_ms() -> u64 {
    5_000
}
fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_store_prefix() -> String {
    "valwatch".to_string()
}
fn default_store_timeout_ms() -> u64 {
    3_000
}
fn default_telegram_api_url() -> String {
    "https://api.telegram.org".to_string()
}
fn default_send_timeout_ms() -> u64 {
    10_000
}
fn default_whale_threshold() -> u64 {
    50_000
}
fn default_unit_scale() -> u64 {
    1_000_000_000
}
fn default_skip_limit() -> u64 {
    1
}
fn default_interval_secs() -> u64 {
    180
}
fn default_warmup_secs() -> u64 {
    10
}
fn default_cycle_timeout_secs() -> u64 {
    60
}
fn default_true() -> bool {
    true
}
fn default_dashboard_bind() -> String {
    "127.0.0.1:8090".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            path: default_snapshot_path(),
            url: String::new(),
            ttl_secs: default_ttl_secs(),
            load_timeout_ms: default_load_timeout_ms(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            prefix: default_store_prefix(),
            timeout_ms: default_store_timeout_ms(),
        }
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            public_channel_id: String::new(),
            api_url: default_telegram_api_url(),
            send_timeout_ms: default_send_timeout_ms(),
        }
    }
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            whale_threshold: default_whale_threshold(),
            unit_scale: default_unit_scale(),
            default_skip_limit: default_skip_limit(),
            whale_policy: WhalePolicy::default(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            warmup_secs: default_warmup_secs(),
            cycle_timeout_secs: default_cycle_timeout_secs(),
        }
    }
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_dashboard_bind(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl AlertsConfig {
    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            whale_threshold: self.whale_threshold,
            unit_scale: self.unit_scale,
            whale_policy: self.whale_policy,
        }
    }
}

impl Config {
    /// Load config from a TOML file, then overlay environment variables for secrets.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(contents)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides (no file needed).
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env();
        config
    }

    // Secrets are never stored in the config file.
    fn apply_env(&mut self) {
        if let Ok(token) = std::env::var("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = token;
        }
        if let Ok(channel) = std::env::var("TELEGRAM_PUBLIC_CHANNEL_ID") {
            self.telegram.public_channel_id = channel;
        }
        if let Ok(path) = std::env::var("VALWATCH_SNAPSHOT_PATH") {
            self.source.path = path;
        }
        if let Ok(url) = std::env::var("VALWATCH_SNAPSHOT_URL") {
            self.source.url = url;
        }
        if let Ok(url) = std::env::var("VALWATCH_STORE_URL") {
            self.store.url = url;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.alerts.unit_scale == 0 {
            return Err(ConfigError::Invalid("alerts.unit_scale must be > 0".to_string()));
        }
        if self.schedule.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "schedule.interval_secs must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn has_telegram(&self) -> bool {
        !self.telegram.bot_token.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.source.ttl_secs, 30);
        assert_eq!(config.schedule.interval_secs, 180);
        assert_eq!(config.schedule.warmup_secs, 10);
        assert_eq!(config.alerts.whale_threshold, 50_000);
        assert_eq!(config.alerts.default_skip_limit, 1);
        assert_eq!(config.alerts.whale_policy, WhalePolicy::Hysteresis);
        assert_eq!(config.store.prefix, "valwatch");
    }

    #[test]
    fn test_sections_override_defaults() {
        let config = Config::from_toml(
            r#"
            [alerts]
            whale_threshold = 10000
            whale_policy = "every_cycle"

            [schedule]
            interval_secs = 60

            [telegram]
            public_channel_id = "-100123"
            "#,
        )
        .unwrap();
        assert_eq!(config.alerts.whale_threshold, 10_000);
        assert_eq!(config.alerts.whale_policy, WhalePolicy::EveryCycle);
        assert_eq!(config.alerts.unit_scale, 1_000_000_000);
        assert_eq!(config.schedule.interval_secs, 60);
        assert_eq!(config.telegram.public_channel_id, "-100123");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = Config::from_toml("[alerts]\nunit_scale = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = Config::from_toml("[schedule]\ninterval_secs = \"soon\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
