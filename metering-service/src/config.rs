use serde::Deserialize;
use std::{fs, time::Duration};
use time::{macros::format_description, UtcOffset};

use crate::{ingest::PollSettings, scheduler::SchedulerSettings};

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TuyaConfig {
    #[serde(default = "default_tuya_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub access_id: String,
    #[serde(default)]
    pub access_secret: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Use the built-in device emulator instead of the provider API.
    #[serde(default)]
    pub emulator: bool,
}

impl Default for TuyaConfig {
    fn default() -> Self {
        Self {
            base_url: default_tuya_base_url(),
            access_id: String::new(),
            access_secret: String::new(),
            request_timeout_ms: default_request_timeout_ms(),
            emulator: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,
    #[serde(default = "default_parallel")]
    pub parallel: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_interval_secs(),
            max_jitter_ms: default_max_jitter_ms(),
            parallel: default_parallel(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_device_timeout_ms")]
    pub device_timeout_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            device_timeout_ms: default_device_timeout_ms(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BillingConfig {
    /// Local offset of billing months, e.g. `+07:00`.
    #[serde(default = "default_utc_offset")]
    pub utc_offset: String,
    /// Refresh stored monthly summaries after each building poll.
    #[serde(default)]
    pub billing_enabled: bool,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            utc_offset: default_utc_offset(),
            billing_enabled: false,
        }
    }
}

impl BillingConfig {
    pub fn offset(&self) -> anyhow::Result<UtcOffset> {
        UtcOffset::parse(
            self.utc_offset.trim(),
            format_description!("[offset_hour sign:mandatory]:[offset_minute]"),
        )
        .map_err(|e| anyhow::anyhow!("invalid billing.utc_offset '{}': {e}", self.utc_offset))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub http: HttpConfig,
    #[serde(default)]
    pub tuya: TuyaConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub billing: BillingConfig,
    pub metrics: Option<MetricsConfig>,
}

fn default_max_connections() -> u32 {
    10
}
fn default_tuya_base_url() -> String {
    "https://openapi.tuyaus.com".to_string()
}
fn default_request_timeout_ms() -> u64 {
    10_000
}
fn default_true() -> bool {
    true
}
fn default_interval_secs() -> u64 {
    60
}
fn default_max_jitter_ms() -> u64 {
    12_000
}
fn default_parallel() -> usize {
    3
}
fn default_device_timeout_ms() -> u64 {
    10_000
}
fn default_batch_size() -> usize {
    50
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    200
}
fn default_utc_offset() -> String {
    "+07:00".to_string()
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path = env::var("METERING_CONFIG").unwrap_or_else(|_| "metering-config.toml".to_string());
        let contents = fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("reading config '{path}': {e}"))?;
        let mut cfg = Self::from_toml_str(&contents)?;
        cfg.override_tuya_credentials(env::var("TUYA_ACCESS_ID").ok(), env::var("TUYA_ACCESS_SECRET").ok());
        Ok(cfg)
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let cfg: AppConfig = toml::from_str(contents)?;
        cfg.billing.offset()?;
        Ok(cfg)
    }

    /// Non-empty values replace the file's credentials.
    pub fn override_tuya_credentials(&mut self, access_id: Option<String>, access_secret: Option<String>) {
        if let Some(id) = access_id.filter(|s| !s.is_empty()) {
            self.tuya.access_id = id;
        }
        if let Some(secret) = access_secret.filter(|s| !s.is_empty()) {
            self.tuya.access_secret = secret;
        }
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            parallel: self.scheduler.parallel.max(1),
            device_timeout: Duration::from_millis(self.ingest.device_timeout_ms),
            dry_run: false,
            batch_size: self.ingest.batch_size.max(1),
            max_retries: self.ingest.max_retries,
            retry_backoff: Duration::from_millis(self.ingest.retry_backoff_ms),
        }
    }

    pub fn scheduler_settings(&self) -> anyhow::Result<SchedulerSettings> {
        Ok(SchedulerSettings {
            interval: Duration::from_secs(self.scheduler.interval_secs.max(1)),
            max_jitter: Duration::from_millis(self.scheduler.max_jitter_ms),
            billing_enabled: self.billing.billing_enabled,
            utc_offset: self.billing.offset()?,
            poll: self.poll_settings(),
        })
    }
}
