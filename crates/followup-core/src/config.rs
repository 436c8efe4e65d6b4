//! Follow-up scheduler configuration system.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{FollowUpError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowUpConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub personalization: PersonalizationConfig,
    #[serde(default)]
    pub predictor: PredictorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_database_path() -> String { "~/.followup/followup.db".into() }

impl Default for FollowUpConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            worker: WorkerConfig::default(),
            queue: QueueConfig::default(),
            sweeper: SweeperConfig::default(),
            delivery: DeliveryConfig::default(),
            personalization: PersonalizationConfig::default(),
            predictor: PredictorConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl FollowUpConfig {
    /// Load config from the default path (~/.followup/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides(|k| std::env::var(k).ok());
        Ok(config)
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| FollowUpError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| FollowUpError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| FollowUpError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the follow-up home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".followup")
    }

    /// Database path with `~` and `$VARS` expanded.
    pub fn resolved_database_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::full(&self.database_path)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| self.database_path.clone()))
    }

    /// Secrets may come from the environment instead of the file.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("FOLLOWUP_WEBHOOK_URL").filter(|v| !v.is_empty()) {
            self.delivery.webhook_url = url;
        }
        if let Some(token) = lookup("FOLLOWUP_TELEGRAM_BOT_TOKEN").filter(|v| !v.is_empty()) {
            self.delivery.telegram_bot_token = token;
        }
        if let Some(key) = lookup("FOLLOWUP_LLM_API_KEY").filter(|v| !v.is_empty()) {
            self.personalization.api_key = key;
        }
    }

    /// Catch values that would stall or spin the workers.
    pub fn validate(&self) -> Result<()> {
        if self.worker.concurrency == 0 {
            return Err(FollowUpError::Config("worker.concurrency must be >= 1".into()));
        }
        if self.delivery.max_per_minute == 0 {
            return Err(FollowUpError::Config("delivery.max_per_minute must be >= 1".into()));
        }
        if self.sweeper.interval_secs == 0 {
            return Err(FollowUpError::Config("sweeper.interval_secs must be >= 1".into()));
        }
        if self.predictor.default_hour > 23 {
            return Err(FollowUpError::Config("predictor.default_hour must be 0-23".into()));
        }
        let windows = [
            ("predictor.response_window_days", self.predictor.response_window_days, MAX_WINDOW_DAYS),
            ("predictor.engagement_window_days", self.predictor.engagement_window_days, MAX_WINDOW_DAYS),
            ("queue.failed_keep_days", self.queue.failed_keep_days, MAX_WINDOW_DAYS),
            ("queue.completed_keep_hours", self.queue.completed_keep_hours, MAX_WINDOW_DAYS * 24),
        ];
        for (key, value, max) in windows {
            if !(1..=max).contains(&value) {
                return Err(FollowUpError::Config(format!("{key} must be 1-{max}, got {value}")));
            }
        }
        match self.delivery.channel.as_str() {
            "webhook" | "telegram" => Ok(()),
            other => Err(FollowUpError::Config(format!(
                "unknown delivery.channel '{other}' (expected webhook or telegram)"
            ))),
        }
    }
}

/// Ten years; longer look-back or retention windows are rejected.
pub const MAX_WINDOW_DAYS: i64 = 3650;

fn bool_true() -> bool { true }

/// Worker pool consuming the dispatch queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_concurrency() -> usize { 5 }
fn default_poll_interval_ms() -> u64 { 1000 }

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Dispatch queue retry and retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_completed_keep_count")]
    pub completed_keep_count: usize,
    #[serde(default = "default_completed_keep_hours")]
    pub completed_keep_hours: i64,
    #[serde(default = "default_failed_keep_count")]
    pub failed_keep_count: usize,
    #[serde(default = "default_failed_keep_days")]
    pub failed_keep_days: i64,
    #[serde(default = "default_prune_interval_secs")]
    pub prune_interval_secs: u64,
}

fn default_max_retries() -> u32 { 3 }
fn default_backoff_base_secs() -> u64 { 5 }
fn default_completed_keep_count() -> usize { 2000 }
fn default_completed_keep_hours() -> i64 { 48 }
fn default_failed_keep_count() -> usize { 5000 }
fn default_failed_keep_days() -> i64 { 7 }
fn default_prune_interval_secs() -> u64 { 600 }

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_secs: default_backoff_base_secs(),
            completed_keep_count: default_completed_keep_count(),
            completed_keep_hours: default_completed_keep_hours(),
            failed_keep_count: default_failed_keep_count(),
            failed_keep_days: default_failed_keep_days(),
            prune_interval_secs: default_prune_interval_secs(),
        }
    }
}

/// Proactive sweeper backstop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_sweep_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
    #[serde(default = "default_inter_send_delay_ms")]
    pub inter_send_delay_ms: u64,
}

fn default_sweep_interval_secs() -> u64 { 300 }
fn default_batch_limit() -> usize { 50 }
fn default_inter_send_delay_ms() -> u64 { 2000 }

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_sweep_interval_secs(),
            batch_limit: default_batch_limit(),
            inter_send_delay_ms: default_inter_send_delay_ms(),
        }
    }
}

/// Outbound delivery channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// "webhook" or "telegram".
    #[serde(default = "default_channel")]
    pub channel: String,
    #[serde(default)]
    pub webhook_url: String,
    /// Extra headers on every webhook request, e.g. a bridge auth token.
    #[serde(default)]
    pub webhook_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub telegram_bot_token: String,
    #[serde(default = "default_delivery_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_per_minute")]
    pub max_per_minute: u32,
}

fn default_channel() -> String { "webhook".into() }
fn default_delivery_timeout_ms() -> u64 { 10_000 }
fn default_max_per_minute() -> u32 { 10 }

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            webhook_url: String::new(),
            webhook_headers: BTreeMap::new(),
            telegram_bot_token: String::new(),
            timeout_ms: default_delivery_timeout_ms(),
            max_per_minute: default_max_per_minute(),
        }
    }
}

/// LLM-backed message personalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonalizationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_personalize_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_llm_endpoint() -> String { "https://api.openai.com/v1".into() }
fn default_llm_model() -> String { "gpt-4o-mini".into() }
fn default_personalize_timeout_ms() -> u64 { 15_000 }

impl Default for PersonalizationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_llm_endpoint(),
            api_key: String::new(),
            model: default_llm_model(),
            timeout_ms: default_personalize_timeout_ms(),
        }
    }
}

/// Send-time predictor windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictorConfig {
    #[serde(default = "default_response_window_days")]
    pub response_window_days: i64,
    #[serde(default = "default_engagement_window_days")]
    pub engagement_window_days: i64,
    #[serde(default = "default_hour")]
    pub default_hour: u32,
}

fn default_response_window_days() -> i64 { 90 }
fn default_engagement_window_days() -> i64 { 60 }
fn default_hour() -> u32 { 10 }

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            response_window_days: default_response_window_days(),
            engagement_window_days: default_engagement_window_days(),
            default_hour: default_hour(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "pretty" or "json".
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String { "info".into() }
fn default_log_format() -> String { "pretty".into() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = FollowUpConfig::default();
        assert_eq!(c.worker.concurrency, 5);
        assert_eq!(c.queue.max_retries, 3);
        assert_eq!(c.queue.backoff_base_secs, 5);
        assert_eq!(c.sweeper.batch_limit, 50);
        assert_eq!(c.delivery.max_per_minute, 10);
        assert_eq!(c.predictor.default_hour, 10);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let c: FollowUpConfig = toml::from_str(
            r#"
            database_path = "/tmp/fu.db"
            [worker]
            concurrency = 2
            [delivery]
            channel = "telegram"
            "#,
        )
        .unwrap();
        assert_eq!(c.database_path, "/tmp/fu.db");
        assert_eq!(c.worker.concurrency, 2);
        assert_eq!(c.worker.poll_interval_ms, 1000);
        assert_eq!(c.delivery.channel, "telegram");
        assert_eq!(c.sweeper.interval_secs, 300);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = std::env::temp_dir().join(format!("followup-cfg-{}", uuid::Uuid::new_v4()));
        let path = dir.join("config.toml");
        let mut c = FollowUpConfig::default();
        c.queue.max_retries = 5;
        c.save_to(&path).unwrap();
        let loaded = FollowUpConfig::load_from(&path).unwrap();
        assert_eq!(loaded.queue.max_retries, 5);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_env_overrides() {
        let mut c = FollowUpConfig::default();
        c.apply_env_overrides(|k| match k {
            "FOLLOWUP_WEBHOOK_URL" => Some("https://hooks.example/x".into()),
            "FOLLOWUP_LLM_API_KEY" => Some(String::new()),
            _ => None,
        });
        assert_eq!(c.delivery.webhook_url, "https://hooks.example/x");
        assert!(c.personalization.api_key.is_empty());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut c = FollowUpConfig::default();
        c.worker.concurrency = 0;
        assert!(c.validate().is_err());

        let mut c = FollowUpConfig::default();
        c.delivery.channel = "carrier_pigeon".into();
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_validate_bounds_windows() {
        let mut c = FollowUpConfig::default();
        c.predictor.response_window_days = i64::MAX;
        assert!(c.validate().is_err());

        let mut c = FollowUpConfig::default();
        c.predictor.engagement_window_days = 0;
        assert!(c.validate().is_err());

        let mut c = FollowUpConfig::default();
        c.queue.completed_keep_hours = -1;
        assert!(c.validate().is_err());

        let mut c = FollowUpConfig::default();
        c.queue.failed_keep_days = MAX_WINDOW_DAYS;
        assert!(c.validate().is_ok());
        c.queue.failed_keep_days = MAX_WINDOW_DAYS + 1;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_webhook_headers_from_toml() {
        let c: FollowUpConfig = toml::from_str(
            r#"
            [delivery]
            webhook_url = "https://bridge.example.com/sms"
            [delivery.webhook_headers]
            Authorization = "Bearer abc"
            X-Tenant = "clinic-7"
            "#,
        )
        .unwrap();
        assert_eq!(c.delivery.webhook_headers.len(), 2);
        assert_eq!(c.delivery.webhook_headers["Authorization"], "Bearer abc");
        assert!(FollowUpConfig::default().delivery.webhook_headers.is_empty());
    }
}
