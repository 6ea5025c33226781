//! Application settings and configuration management

use crate::error::{AppError, Result};
use crate::job::SubscriptionTier;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub credits: CreditsConfig,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub events: EventsConfig,
}

/// Per-tier values, one field per subscription tier
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TierTable<T> {
    pub starter: T,
    pub pro: T,
    pub growth: T,
}

impl<T> TierTable<T> {
    pub fn get(&self, tier: SubscriptionTier) -> &T {
        match tier {
            SubscriptionTier::Starter => &self.starter,
            SubscriptionTier::Pro => &self.pro,
            SubscriptionTier::Growth => &self.growth,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Retention policy for terminal jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct RetentionConfig {
    pub max_count: usize,
    pub max_age_secs: u64,
}

/// Queue and worker pool configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    /// Number of concurrent workers
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Total delivery attempts per job, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay for exponential redelivery backoff
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// How long a claimed job stays invisible before it is redelivered
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    /// Upper bound on how long an idle worker sleeps between queue polls
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_completed_retention")]
    pub completed_retention: RetentionConfig,
    #[serde(default = "default_failed_retention")]
    pub failed_retention: RetentionConfig,
    #[serde(default = "default_tier_priority")]
    pub tier_priority: TierTable<u8>,
}

fn default_concurrency() -> usize {
    5
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_lease_secs() -> u64 {
    300
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_completed_retention() -> RetentionConfig {
    RetentionConfig {
        max_count: 100,
        max_age_secs: 3600,
    }
}

fn default_failed_retention() -> RetentionConfig {
    RetentionConfig {
        max_count: 1000,
        max_age_secs: 7 * 24 * 3600,
    }
}

fn default_tier_priority() -> TierTable<u8> {
    TierTable {
        starter: 5,
        pro: 3,
        growth: 1,
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            lease_secs: default_lease_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            completed_retention: default_completed_retention(),
            failed_retention: default_failed_retention(),
            tier_priority: default_tier_priority(),
        }
    }
}

/// Submission caps for one tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct RateCaps {
    pub per_minute: u32,
    pub per_hour: u32,
}

/// Admission control configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdmissionConfig {
    #[serde(default = "default_tier_caps")]
    pub tiers: TierTable<RateCaps>,
}

fn default_tier_caps() -> TierTable<RateCaps> {
    TierTable {
        starter: RateCaps {
            per_minute: 2,
            per_hour: 20,
        },
        pro: RateCaps {
            per_minute: 10,
            per_hour: 100,
        },
        growth: RateCaps {
            per_minute: 20,
            per_hour: 300,
        },
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            tiers: default_tier_caps(),
        }
    }
}

/// Credit pricing configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CreditsConfig {
    #[serde(default = "default_base_cost")]
    pub base_cost: u32,
    /// Added above one megapixel
    #[serde(default = "default_high_res_surcharge")]
    pub high_res_surcharge: u32,
    /// Added on top of the high-res surcharge above four megapixels
    #[serde(default = "default_ultra_res_surcharge")]
    pub ultra_res_surcharge: u32,
    #[serde(default)]
    pub high_quality_surcharge: u32,
    #[serde(default = "default_high_quality_threshold")]
    pub high_quality_threshold: u8,
    #[serde(default = "default_billing_multiplier")]
    pub billing_multiplier: f64,
    /// Opening balances seeded into the in-process credit store
    #[serde(default)]
    pub initial_balances: HashMap<String, i64>,
}

fn default_base_cost() -> u32 {
    1
}

fn default_high_res_surcharge() -> u32 {
    1
}

fn default_ultra_res_surcharge() -> u32 {
    2
}

fn default_high_quality_threshold() -> u8 {
    75
}

fn default_billing_multiplier() -> f64 {
    1.0
}

impl Default for CreditsConfig {
    fn default() -> Self {
        Self {
            base_cost: default_base_cost(),
            high_res_surcharge: default_high_res_surcharge(),
            ultra_res_surcharge: default_ultra_res_surcharge(),
            high_quality_surcharge: 0,
            high_quality_threshold: default_high_quality_threshold(),
            billing_multiplier: default_billing_multiplier(),
            initial_balances: HashMap::new(),
        }
    }
}

/// Quality gate configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QualityConfig {
    #[serde(default = "default_min_score")]
    pub min_score: f64,
    /// Perceptual-hash similarity (0..=1) at which a render counts as a duplicate
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    /// Number of recent approved renders kept for duplicate detection
    #[serde(default = "default_duplicate_window")]
    pub duplicate_window: usize,
    #[serde(default)]
    pub force_manual_review: bool,
    /// Requested quality above which renders are held for review; unset disables the rule
    #[serde(default)]
    pub high_quality_review_threshold: Option<u8>,
}

fn default_min_score() -> f64 {
    0.7
}

fn default_similarity_threshold() -> f64 {
    0.95
}

fn default_duplicate_window() -> usize {
    500
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_score: default_min_score(),
            similarity_threshold: default_similarity_threshold(),
            duplicate_window: default_duplicate_window(),
            force_manual_review: false,
            high_quality_review_threshold: None,
        }
    }
}

/// Object storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_thumbnail_prefix")]
    pub thumbnail_prefix: String,
    #[serde(default = "default_storage_path")]
    pub base_path: String,
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
    #[serde(default = "default_thumbnail_size")]
    pub thumbnail_size: u32,
    /// Limit for fetching a provider image by URL
    #[serde(default = "default_download_timeout")]
    pub download_timeout_ms: u64,
}

fn default_bucket() -> String {
    "renders".to_string()
}

fn default_key_prefix() -> String {
    "renders".to_string()
}

fn default_thumbnail_prefix() -> String {
    "thumbnails".to_string()
}

fn default_storage_path() -> String {
    "./render-storage".to_string()
}

fn default_public_base_url() -> String {
    "http://localhost:8080/assets".to_string()
}

fn default_thumbnail_size() -> u32 {
    256
}

fn default_download_timeout() -> u64 {
    60000
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: default_bucket(),
            key_prefix: default_key_prefix(),
            thumbnail_prefix: default_thumbnail_prefix(),
            base_path: default_storage_path(),
            public_base_url: default_public_base_url(),
            thumbnail_size: default_thumbnail_size(),
            download_timeout_ms: default_download_timeout(),
        }
    }
}

/// Image generation provider configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_provider_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_provider_retries")]
    pub max_retries: u32,
    #[serde(default = "default_provider_backoff")]
    pub retry_backoff_ms: u64,
}

fn default_provider_timeout() -> u64 {
    60_000
}

fn default_provider_retries() -> u32 {
    3
}

fn default_provider_backoff() -> u64 {
    1000
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            api_key: None,
            model: None,
            timeout_ms: default_provider_timeout(),
            max_retries: default_provider_retries(),
            retry_backoff_ms: default_provider_backoff(),
        }
    }
}

/// All supported providers
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub google_imagen: ProviderConfig,
    #[serde(default)]
    pub openai_gpt_image: ProviderConfig,
}

/// Failure monitor configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_interval")]
    pub interval_secs: u64,
    /// Sliding window over which failures are counted
    #[serde(default = "default_monitor_window")]
    pub window_secs: u64,
    #[serde(default = "default_failure_rate_threshold")]
    pub failure_rate_threshold: f64,
    /// Outcomes required in the window before the failure rate is trusted
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    #[serde(default = "default_max_active_alerts")]
    pub max_active_alerts: usize,
    /// Occurrences of one failure signature that count as a pattern
    #[serde(default = "default_pattern_threshold")]
    pub pattern_threshold: usize,
    #[serde(default = "default_alert_cooldown")]
    pub alert_cooldown_secs: u64,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

fn default_monitor_interval() -> u64 {
    300
}

fn default_monitor_window() -> u64 {
    900
}

fn default_failure_rate_threshold() -> f64 {
    0.25
}

fn default_min_samples() -> usize {
    10
}

fn default_max_active_alerts() -> usize {
    5
}

fn default_pattern_threshold() -> usize {
    5
}

fn default_alert_cooldown() -> u64 {
    900
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_monitor_interval(),
            window_secs: default_monitor_window(),
            failure_rate_threshold: default_failure_rate_threshold(),
            min_samples: default_min_samples(),
            max_active_alerts: default_max_active_alerts(),
            pattern_threshold: default_pattern_threshold(),
            alert_cooldown_secs: default_alert_cooldown(),
            webhook_url: None,
        }
    }
}

/// Metrics flush configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
}

fn default_flush_interval() -> u64 {
    15
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: default_flush_interval(),
        }
    }
}

/// Progress event bus configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EventsConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_max_subscribers")]
    pub max_subscribers_per_job: usize,
}

fn default_channel_capacity() -> usize {
    64
}

fn default_max_subscribers() -> usize {
    16
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            max_subscribers_per_job: default_max_subscribers(),
        }
    }
}

impl Settings {
    /// Load settings from configuration files and environment variables
    pub fn load() -> Result<Self> {
        Self::load_from_path("config/default.toml")
    }

    /// Load settings from a specific configuration file path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from(path.as_ref()).required(false))
            // Override with environment variables (prefixed with RENDER_QUEUE__)
            .add_source(
                Environment::with_prefix("RENDER_QUEUE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(invalid("Server port cannot be 0"));
        }

        if self.queue.concurrency == 0 {
            return Err(invalid("Queue concurrency must be at least 1"));
        }

        if self.queue.max_attempts == 0 {
            return Err(invalid("Queue max_attempts must be at least 1"));
        }

        let threshold = self.quality.similarity_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(invalid(format!(
                "Similarity threshold {threshold} must be in (0, 1]"
            )));
        }

        if !(0.0..=1.0).contains(&self.quality.min_score) {
            return Err(invalid(format!(
                "Quality min_score {} must be in [0, 1]",
                self.quality.min_score
            )));
        }

        for tier in SubscriptionTier::ALL {
            let caps = self.admission.tiers.get(tier);
            if caps.per_minute == 0 || caps.per_hour == 0 {
                return Err(invalid(format!(
                    "Tier '{}' must allow at least one render per minute and per hour",
                    tier.as_str()
                )));
            }
        }

        for (name, provider) in [
            ("google_imagen", &self.providers.google_imagen),
            ("openai_gpt_image", &self.providers.openai_gpt_image),
        ] {
            if provider.enabled && provider.endpoint.is_empty() {
                return Err(invalid(format!(
                    "Provider '{name}' is enabled but has no endpoint"
                )));
            }
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> AppError {
    AppError::Config(config::ConfigError::Message(message.into()))
}
