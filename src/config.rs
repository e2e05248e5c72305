use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::broker::ProtocolPreference;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Broker integration switch; when false the service runs without a broker
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Broker host ("." or "localhost" for the local machine)
    pub host: String,
    /// Broker port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Per-call timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Connect attempts before giving up
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Fixed delay between a disconnect and the next connect
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Preferred addressing protocol for remote hosts
    #[serde(default)]
    pub protocol: ProtocolPreference,
    /// Try the other protocol when the preferred one fails
    #[serde(default = "default_true")]
    pub protocol_fallback: bool,
    /// Queues to probe when the remote host does not allow enumeration
    #[serde(default)]
    pub queues: Vec<String>,
    /// Queue path prefix
    #[serde(default = "default_queue_prefix")]
    pub queue_prefix: String,
    /// Program used by the shell adapter
    #[serde(default = "default_shell_program")]
    pub shell_program: String,
}

fn default_true() -> bool {
    true
}

fn default_port() -> u16 {
    1801
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_reconnect_delay_ms() -> u64 {
    5_000
}

fn default_queue_prefix() -> String {
    "private$".to_string()
}

fn default_shell_program() -> String {
    "powershell".to_string()
}

impl BrokerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// True when the host refers to the local machine
    pub fn is_local(&self) -> bool {
        crate::broker::is_local_host(&self.host)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: ".".to_string(),
            port: default_port(),
            timeout_ms: default_timeout_ms(),
            retry_attempts: default_retry_attempts(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            protocol: ProtocolPreference::default(),
            protocol_fallback: true,
            queues: Vec::new(),
            queue_prefix: default_queue_prefix(),
            shell_program: default_shell_program(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    /// Blocking peek/receive timeout per poll
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Peek without removing messages from the queue
    #[serde(default)]
    pub peek_only: bool,
    /// Consecutive failures before a listener stops itself
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Delay after a failed poll
    #[serde(default = "default_failure_backoff_ms")]
    pub failure_backoff_ms: u64,
    /// Queues to monitor; empty means every active inbound registry entry
    #[serde(default)]
    pub queues: Vec<String>,
    /// Start listeners during startup
    #[serde(default = "default_true")]
    pub auto_start: bool,
}

fn default_poll_timeout_ms() -> u64 {
    1_000
}

fn default_max_consecutive_failures() -> u32 {
    10
}

fn default_failure_backoff_ms() -> u64 {
    2_000
}

impl ListenerConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn failure_backoff(&self) -> Duration {
        Duration::from_millis(self.failure_backoff_ms)
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: default_poll_timeout_ms(),
            peek_only: false,
            max_consecutive_failures: default_max_consecutive_failures(),
            failure_backoff_ms: default_failure_backoff_ms(),
            queues: Vec::new(),
            auto_start: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Interval between scheduled reconciliation runs (0 disables the scheduler)
    #[serde(default = "default_sync_interval_secs")]
    pub interval_secs: u64,
    /// Run a full reconciliation during startup
    #[serde(default = "default_true")]
    pub run_on_startup: bool,
    /// Inactive registry rows older than this are eligible for purge
    #[serde(default = "default_purge_after_days")]
    pub purge_after_days: u32,
}

fn default_sync_interval_secs() -> u64 {
    300
}

fn default_purge_after_days() -> u32 {
    30
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sync_interval_secs(),
            run_on_startup: true,
            purge_after_days: default_purge_after_days(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for the rolling log file
    #[serde(default)]
    pub dir: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("broker.host", ".")?
            .set_default("broker.port", 1801)?
            .set_default("broker.timeout_ms", 30_000)?
            .set_default("broker.retry_attempts", 3)?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("database.max_connections", 5)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Environment-specific overrides (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("BROKERSYNC_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // BROKERSYNC_BROKER__HOST, BROKERSYNC_DATABASE__URL, ...
            .add_source(
                Environment::with_prefix("BROKERSYNC")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("broker.queues")
                    .with_list_parse_key("listener.queues")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Configuration for tests and one-off CLI use
    pub fn default_config(host: &str) -> Self {
        Self {
            broker: BrokerConfig {
                host: host.to_string(),
                ..BrokerConfig::default()
            },
            listener: ListenerConfig::default(),
            sync: SyncConfig::default(),
            database: DatabaseConfig {
                url: "postgres://localhost/brokersync".to_string(),
                max_connections: default_max_connections(),
            },
            logging: LoggingConfig::default(),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.broker.host.trim().is_empty() {
            errors.push("broker.host must not be empty".to_string());
        }
        if self.broker.port == 0 {
            errors.push("broker.port must be non-zero".to_string());
        }
        if self.broker.timeout_ms == 0 {
            errors.push("broker.timeout_ms must be positive".to_string());
        }
        if self.broker.retry_attempts == 0 {
            errors.push("broker.retry_attempts must be at least 1".to_string());
        }
        if self.listener.poll_timeout_ms == 0 {
            errors.push("listener.poll_timeout_ms must be positive".to_string());
        }
        if self.listener.poll_timeout_ms > self.broker.timeout_ms {
            errors.push(format!(
                "listener.poll_timeout_ms ({}) exceeds broker.timeout_ms ({})",
                self.listener.poll_timeout_ms, self.broker.timeout_ms
            ));
        }
        if self.listener.max_consecutive_failures == 0 {
            errors.push("listener.max_consecutive_failures must be at least 1".to_string());
        }
        for queue in self.broker.queues.iter().chain(self.listener.queues.iter()) {
            if let Err(e) = crate::validation::validate_queue_name(queue) {
                errors.push(e.to_string());
            }
        }
        if self.database.max_connections == 0 {
            errors.push("database.max_connections must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
