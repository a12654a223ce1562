use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Backend name ("memory")
    #[serde(default = "default_store_backend")]
    pub backend: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    /// Wait after the first empty read, in milliseconds (grows with n^2)
    #[serde(default = "default_empty_wait_base_ms")]
    pub empty_wait_base_ms: u64,
    /// Upper bound for the empty-read wait, in milliseconds
    #[serde(default = "default_empty_wait_max_ms")]
    pub empty_wait_max_ms: u64,
    /// Empty-read run length after which the wait stops growing
    #[serde(default = "default_max_empty_count")]
    pub max_empty_count: u32,
    /// Consecutive read failures tolerated before the loop gives up
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
    /// First retry delay after a read failure, in milliseconds
    #[serde(default = "default_error_backoff_initial_ms")]
    pub error_backoff_initial_ms: u64,
    /// Upper bound for the read-failure retry delay, in milliseconds
    #[serde(default = "default_error_backoff_max_ms")]
    pub error_backoff_max_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_store_backend() -> String {
    "memory".to_string()
}

fn default_empty_wait_base_ms() -> u64 {
    100
}

fn default_empty_wait_max_ms() -> u64 {
    10_000 // 10 seconds
}

fn default_max_empty_count() -> u32 {
    10
}

fn default_max_consecutive_errors() -> u32 {
    5
}

fn default_error_backoff_initial_ms() -> u64 {
    100
}

fn default_error_backoff_max_ms() -> u64 {
    30_000 // 30 seconds
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            // Start with default values
            .set_default("dispatcher.store.backend", default_store_backend())?
            .set_default("dispatcher.policy.empty_wait_base_ms", default_empty_wait_base_ms() as i64)?
            .set_default("dispatcher.policy.empty_wait_max_ms", default_empty_wait_max_ms() as i64)?
            .set_default("dispatcher.policy.max_empty_count", default_max_empty_count() as i64)?
            .set_default("logging.level", default_log_level())?
            .set_default("logging.format", default_log_format())?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Load from environment variables
            // NOTIFY__DISPATCHER__POLICY__EMPTY_WAIT_MAX_MS, NOTIFY__LOGGING__FORMAT, etc.
            .add_source(
                Environment::with_prefix("NOTIFY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            empty_wait_base_ms: default_empty_wait_base_ms(),
            empty_wait_max_ms: default_empty_wait_max_ms(),
            max_empty_count: default_max_empty_count(),
            max_consecutive_errors: default_max_consecutive_errors(),
            error_backoff_initial_ms: default_error_backoff_initial_ms(),
            error_backoff_max_ms: default_error_backoff_max_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}
