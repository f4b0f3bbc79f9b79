//! Configuration management.
//!
//! leadflow configuration can come from:
//! - Environment variables (LEADFLOW_*)
//! - Config file (~/.config/leadflow/config.toml)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::nodes::{BackoffType, RetryPolicy};

/// leadflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    /// Scheduler and wake-up processing
    #[serde(default)]
    pub engine: EngineConfig,

    /// Email delivery
    #[serde(default)]
    pub email: EmailConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

fn default_port() -> u16 {
    8080
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Node evaluations allowed per scheduler invocation before the
    /// execution is failed as a probable cycle
    #[serde(default = "default_max_steps")]
    pub max_steps_per_invocation: u32,

    /// How often the wake-up processor polls for due wake-ups
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Maximum due wake-ups fetched per poll
    #[serde(default = "default_wakeup_batch_size")]
    pub wakeup_batch_size: usize,

    /// Maximum wake-ups resumed in parallel
    #[serde(default = "default_max_concurrent_wakeups")]
    pub max_concurrent_wakeups: usize,

    /// Delay before retrying a wake-up whose resume failed
    #[serde(default = "default_wakeup_retry_seconds")]
    pub wakeup_retry_seconds: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps_per_invocation: default_max_steps(),
            poll_interval_ms: default_poll_interval_ms(),
            wakeup_batch_size: default_wakeup_batch_size(),
            max_concurrent_wakeups: default_max_concurrent_wakeups(),
            wakeup_retry_seconds: default_wakeup_retry_seconds(),
        }
    }
}

fn default_max_steps() -> u32 {
    100
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_wakeup_batch_size() -> usize {
    100
}

fn default_max_concurrent_wakeups() -> usize {
    8
}

fn default_wakeup_retry_seconds() -> u64 {
    60
}

/// Email provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    /// "log" or "resend"
    #[serde(default = "default_email_provider")]
    pub provider: String,

    /// Default sender address
    #[serde(default = "default_email_from")]
    pub from: String,

    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,

    /// Override the provider API endpoint
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            provider: default_email_provider(),
            from: default_email_from(),
            api_key: None,
            endpoint: None,
            retry: RetryPolicy::default(),
        }
    }
}

fn default_email_provider() -> String {
    "log".to_string()
}

fn default_email_from() -> String {
    "noreply@leadflow.local".to_string()
}

impl Config {
    /// Load configuration from default locations.
    pub fn load() -> Self {
        let mut config = Self::default();

        let primary_path = Self::config_dir().join("config.toml");
        if let Ok(partial) = Self::load_partial_from_path(&primary_path) {
            config.apply_partial(partial);
        }

        config.apply_env_overrides();
        config
    }

    /// Get the data directory.
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("leadflow"))
            .unwrap_or_else(|| PathBuf::from(".leadflow"))
    }

    /// Get the config directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("leadflow"))
            .unwrap_or_else(|| PathBuf::from(".leadflow"))
    }

    /// Database path, falling back to the data directory.
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("leadflow.db"))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(port) = var("LEADFLOW_SERVER_PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
        if let Some(host) = var("LEADFLOW_SERVER_HOST") {
            self.server.host = host;
        }
        if let Some(path) = var("LEADFLOW_DATABASE_PATH") {
            self.storage.database_path = Some(PathBuf::from(path));
        }
        if let Some(steps) = var("LEADFLOW_MAX_STEPS").and_then(|v| v.parse().ok()) {
            self.engine.max_steps_per_invocation = steps;
        }
        if let Some(ms) = var("LEADFLOW_POLL_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.engine.poll_interval_ms = ms;
        }
        if let Some(n) = var("LEADFLOW_MAX_CONCURRENT_WAKEUPS").and_then(|v| v.parse().ok()) {
            self.engine.max_concurrent_wakeups = n;
        }
        if let Some(provider) = var("LEADFLOW_EMAIL_PROVIDER") {
            self.email.provider = provider;
        }
        if let Some(from) = var("LEADFLOW_EMAIL_FROM") {
            self.email.from = from;
        }
        if let Some(key) = var("LEADFLOW_EMAIL_API_KEY") {
            self.email.api_key = Some(key);
        }
        if let Some(endpoint) = var("LEADFLOW_EMAIL_ENDPOINT") {
            self.email.endpoint = Some(endpoint);
        }
        if let Some(attempts) = var("LEADFLOW_EMAIL_MAX_ATTEMPTS").and_then(|v| v.parse().ok()) {
            self.email.retry.max_attempts = attempts;
        }
        if let Some(backoff) = var("LEADFLOW_EMAIL_BACKOFF") {
            match backoff.as_str() {
                "fixed" => self.email.retry.backoff = BackoffType::Fixed,
                "linear" => self.email.retry.backoff = BackoffType::Linear,
                "exponential" => self.email.retry.backoff = BackoffType::Exponential,
                other => tracing::warn!("Ignoring unknown LEADFLOW_EMAIL_BACKOFF '{}'", other),
            }
        }
    }

    fn load_partial_from_path(path: &Path) -> std::result::Result<PartialConfig, ()> {
        let content = std::fs::read_to_string(path).map_err(|_| ())?;
        toml::from_str(&content).map_err(|_| ())
    }

    fn apply_partial(&mut self, partial: PartialConfig) {
        if let Some(server) = partial.server {
            self.server = server;
        }
        if let Some(storage) = partial.storage {
            self.storage = storage;
        }
        if let Some(engine) = partial.engine {
            self.engine = engine;
        }
        if let Some(email) = partial.email {
            self.email = email;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    server: Option<ServerConfig>,
    storage: Option<StorageConfig>,
    engine: Option<EngineConfig>,
    email: Option<EmailConfig>,
}
