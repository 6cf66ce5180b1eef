//! Configuration for Parley

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Messaging gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Campaign dispatch configuration
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Inbound webhook configuration
    #[serde(default)]
    pub webhook: WebhookConfig,

    /// Background worker configuration
    #[serde(default)]
    pub workers: WorkerConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// HTTP port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Externally reachable base URL, used to build webhook URLs handed to the gateway
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            public_base_url: default_public_base_url(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_public_base_url() -> String {
    "http://localhost:8080".to_string()
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database backend: "postgres" or "memory"
    #[serde(default = "default_db_backend")]
    pub backend: String,

    /// Database URL (for postgres)
    pub url: Option<String>,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Seconds to wait for a free pooled connection
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: default_db_backend(),
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
        }
    }
}

impl DatabaseConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

fn default_db_backend() -> String {
    "postgres".to_string()
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    5
}

fn default_acquire_timeout_secs() -> u64 {
    30
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// Messaging gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Base URL of the gateway HTTP API
    #[serde(default = "default_gateway_url")]
    pub base_url: String,

    /// Global API key sent with every request
    #[serde(default)]
    pub api_key: String,

    /// Request timeout in seconds
    #[serde(default = "default_gateway_timeout")]
    pub timeout_secs: u64,

    /// Country code prepended to phone numbers that lack one
    #[serde(default = "default_country_code")]
    pub default_country_code: String,

    /// Longest phone number (in digits) that is still considered national
    #[serde(default = "default_national_number_max_len")]
    pub national_number_max_len: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_gateway_url(),
            api_key: String::new(),
            timeout_secs: default_gateway_timeout(),
            default_country_code: default_country_code(),
            national_number_max_len: default_national_number_max_len(),
        }
    }
}

impl GatewayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_gateway_url() -> String {
    "http://localhost:8081".to_string()
}

fn default_gateway_timeout() -> u64 {
    30
}

fn default_country_code() -> String {
    "55".to_string()
}

fn default_national_number_max_len() -> usize {
    11
}

/// Campaign dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Items claimed per scheduler activation
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,

    /// Delay before the next activation when pending items remain
    #[serde(default = "default_rearm_delay_ms")]
    pub rearm_delay_ms: u64,

    /// Delay before retrying when every remaining item is claimed elsewhere
    #[serde(default = "default_locked_retry_delay_ms")]
    pub locked_retry_delay_ms: u64,

    /// Sleep a length-dependent random interval before each send
    #[serde(default = "default_true")]
    pub pacing_enabled: bool,

    /// Delay before retrying a campaign whose session exhausted its daily quota
    #[serde(default = "default_quota_backoff_secs")]
    pub quota_backoff_secs: u64,

    /// Age after which a QUEUED claim is considered orphaned
    #[serde(default = "default_stale_claim_after_secs")]
    pub stale_claim_after_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            rearm_delay_ms: default_rearm_delay_ms(),
            locked_retry_delay_ms: default_locked_retry_delay_ms(),
            pacing_enabled: true,
            quota_backoff_secs: default_quota_backoff_secs(),
            stale_claim_after_secs: default_stale_claim_after_secs(),
        }
    }
}

impl DispatchConfig {
    pub fn rearm_delay(&self) -> Duration {
        Duration::from_millis(self.rearm_delay_ms)
    }

    pub fn locked_retry_delay(&self) -> Duration {
        Duration::from_millis(self.locked_retry_delay_ms)
    }

    pub fn quota_backoff(&self) -> Duration {
        Duration::from_secs(self.quota_backoff_secs)
    }

    pub fn stale_claim_after(&self) -> Duration {
        Duration::from_secs(self.stale_claim_after_secs)
    }
}

fn default_batch_size() -> i64 {
    10
}

fn default_rearm_delay_ms() -> u64 {
    2_000
}

fn default_locked_retry_delay_ms() -> u64 {
    5_000
}

fn default_quota_backoff_secs() -> u64 {
    300
}

fn default_stale_claim_after_secs() -> u64 {
    900
}

fn default_true() -> bool {
    true
}

/// Inbound webhook configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Maximum clock distance accepted for signed timestamps
    #[serde(default = "default_replay_window_secs")]
    pub replay_window_secs: i64,

    /// How long a reconciliation attempt holds a log entry
    #[serde(default = "default_processing_lease_secs")]
    pub processing_lease_secs: u64,

    /// Unprocessed entries older than this are re-enqueued by the sweep
    #[serde(default = "default_sweep_after_secs")]
    pub sweep_after_secs: u64,

    /// Maximum entries re-enqueued per tenant per sweep
    #[serde(default = "default_sweep_batch")]
    pub sweep_batch: i64,

    /// Processing attempts after which the sweep stops re-enqueueing an entry
    #[serde(default = "default_webhook_max_attempts")]
    pub max_attempts: i32,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            replay_window_secs: default_replay_window_secs(),
            processing_lease_secs: default_processing_lease_secs(),
            sweep_after_secs: default_sweep_after_secs(),
            sweep_batch: default_sweep_batch(),
            max_attempts: default_webhook_max_attempts(),
        }
    }
}

impl WebhookConfig {
    pub fn processing_lease(&self) -> Duration {
        Duration::from_secs(self.processing_lease_secs)
    }

    pub fn sweep_after(&self) -> Duration {
        Duration::from_secs(self.sweep_after_secs)
    }
}

fn default_replay_window_secs() -> i64 {
    300
}

fn default_processing_lease_secs() -> u64 {
    120
}

fn default_sweep_after_secs() -> u64 {
    60
}

fn default_sweep_batch() -> i64 {
    100
}

fn default_webhook_max_attempts() -> i32 {
    5
}

/// Background worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Concurrent workers pulling campaign batch activations
    #[serde(default = "default_dispatch_concurrency")]
    pub dispatch_concurrency: usize,

    /// Concurrent workers pulling webhook reconciliation jobs
    #[serde(default = "default_reconcile_concurrency")]
    pub reconcile_concurrency: usize,

    /// Idle poll interval when a queue is empty
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Attempts before a job is marked failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,

    /// Seconds a running job may hold its lock before it is requeued
    #[serde(default = "default_job_lease_secs")]
    pub job_lease_secs: u64,

    /// Interval of the maintenance sweep
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,

    /// Interval between gateway session health checks
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            dispatch_concurrency: default_dispatch_concurrency(),
            reconcile_concurrency: default_reconcile_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            max_attempts: default_max_attempts(),
            job_lease_secs: default_job_lease_secs(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
            health_check_interval_secs: default_health_check_interval_secs(),
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn job_lease(&self) -> Duration {
        Duration::from_secs(self.job_lease_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

fn default_dispatch_concurrency() -> usize {
    4
}

fn default_reconcile_concurrency() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_max_attempts() -> i32 {
    5
}

fn default_job_lease_secs() -> u64 {
    600
}

fn default_maintenance_interval_secs() -> u64 {
    30
}

fn default_health_check_interval_secs() -> u64 {
    300
}

impl Config {
    /// Load configuration from a TOML file, with `PARLEY__SECTION__KEY`
    /// environment variables taking precedence over file values
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::new(
                &path.to_string_lossy(),
                config::FileFormat::Toml,
            ))
            .add_source(
                config::Environment::with_prefix("PARLEY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        settings
            .try_deserialize()
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from `$PARLEY_CONFIG` or the default locations
    pub fn load() -> crate::Result<Self> {
        if let Ok(path) = std::env::var("PARLEY_CONFIG") {
            return Self::from_file(Path::new(&path));
        }

        let paths = [
            PathBuf::from("./config.toml"),
            PathBuf::from("/etc/parley/config.toml"),
        ];

        for path in paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Err(crate::Error::Config(
            "No configuration file found".to_string(),
        ))
    }
}
