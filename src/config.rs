//! Configuration module for the event log agent.
//!
//! [`ConnectionConfig`] describes the broker endpoint consumed by the publish
//! pipeline. [`AgentConfig::from_env`] is the loader used by the binary; the
//! library components never read the environment themselves.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::queue::{OverflowPolicy, QueueConfig, DEFAULT_QUEUE_CAPACITY};

/// Default channels collected when none are configured
const DEFAULT_CHANNELS: &str = "System,Application";

/// Default lookback window in hours
const DEFAULT_LOOKBACK_HOURS: u64 = 1;

/// Maximum lookback window (30 days)
const MAX_LOOKBACK_HOURS: u64 = 720;

/// Maximum allowed queue capacity to bound memory use
const MAX_QUEUE_CAPACITY: usize = 1_000_000;

/// Default AMQP heartbeat interval in seconds
const DEFAULT_HEARTBEAT_SECS: u64 = 60;

/// Default timeout for establishing a broker connection in seconds
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Error type for configuration loading failures
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A variable is set but its value cannot be used
    #[error("Configuration error for {var}: {message}")]
    Invalid { var: String, message: String },
}

impl ConfigError {
    fn invalid(var: &str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            var: var.to_string(),
            message: message.into(),
        }
    }
}

/// Broker endpoint descriptor.
///
/// Immutable once handed to `PublishPipeline::connect`; reconnects reuse the
/// stored copy and a new `connect` replaces it wholesale.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub virtual_host: String,
    pub username: String,
    pub password: String,

    /// Topic exchange events are published to
    pub exchange: String,

    /// Routing key attached to every message
    pub routing_key: String,

    /// Whether the worker reconnects on its own after a connection loss
    pub auto_reconnect: bool,

    /// AMQP heartbeat interval
    pub heartbeat: Duration,

    /// Upper bound on a single connection attempt
    pub connect_timeout: Duration,
}

impl ConnectionConfig {
    /// Endpoint description for logs, without credentials.
    pub fn endpoint(&self) -> String {
        format!("amqp://{}:{}/{}", self.host, self.port, self.virtual_host.trim_start_matches('/'))
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            virtual_host: "/".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            exchange: "windows_logs".to_string(),
            routing_key: "system.logs".to_string(),
            auto_reconnect: true,
            heartbeat: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("virtual_host", &self.virtual_host)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("auto_reconnect", &self.auto_reconnect)
            .field("heartbeat", &self.heartbeat)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Directory holding the rotated agent log files
    pub directory: PathBuf,

    /// Default filter directive when `RUST_LOG` is not set
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("logs"),
            level: "info".to_string(),
        }
    }
}

/// Configuration for the agent binary.
///
/// All settings can be configured via environment variables:
/// - `EVENTLOG_AGENT_AMQP_HOST`, `_PORT`, `_VHOST`, `_USERNAME`, `_PASSWORD`,
///   `_EXCHANGE`, `_ROUTING_KEY`: broker endpoint
/// - `EVENTLOG_AGENT_AUTO_RECONNECT`: reconnect after failures (default: true)
/// - `EVENTLOG_AGENT_CHANNELS`: comma separated logs (default: System,Application)
/// - `EVENTLOG_AGENT_LOOKBACK_HOURS`: collection window (default: 1)
/// - `EVENTLOG_AGENT_FOLLOW_SECS`: keep polling every N seconds (default: unset)
/// - `EVENTLOG_AGENT_QUEUE_CAPACITY`: publish queue size (default: 10000)
/// - `EVENTLOG_AGENT_QUEUE_OVERFLOW`: `reject` or `drop-oldest` (default: reject)
/// - `EVENTLOG_AGENT_HOSTNAME`: host stamped on events
/// - `EVENTLOG_AGENT_LOG_DIR`, `EVENTLOG_AGENT_LOG_LEVEL`: agent logging
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub connection: ConnectionConfig,

    /// Log channels to collect
    pub channels: Vec<String>,

    /// How far back the first collection window reaches
    pub lookback: Duration,

    /// Poll interval for continuous collection; `None` runs once
    pub follow: Option<Duration>,

    pub queue: QueueConfig,

    /// Host name stamped on collected events
    pub origin_host: String,

    pub logging: LoggingConfig,
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// Unset variables fall back to defaults; set but invalid ones are errors.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use eventlog_agent::config::AgentConfig;
    ///
    /// let config = AgentConfig::from_env().expect("Failed to load config");
    /// println!("Broker: {}", config.connection.endpoint());
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = ConnectionConfig::default();

        let connection = ConnectionConfig {
            host: string_var("EVENTLOG_AGENT_AMQP_HOST", &defaults.host)?,
            port: parse_var("EVENTLOG_AGENT_AMQP_PORT", defaults.port)?,
            virtual_host: string_var("EVENTLOG_AGENT_AMQP_VHOST", &defaults.virtual_host)?,
            username: string_var("EVENTLOG_AGENT_AMQP_USERNAME", &defaults.username)?,
            password: env::var("EVENTLOG_AGENT_AMQP_PASSWORD").unwrap_or(defaults.password),
            exchange: string_var("EVENTLOG_AGENT_AMQP_EXCHANGE", &defaults.exchange)?,
            routing_key: env::var("EVENTLOG_AGENT_AMQP_ROUTING_KEY").unwrap_or(defaults.routing_key),
            auto_reconnect: parse_bool("EVENTLOG_AGENT_AUTO_RECONNECT", defaults.auto_reconnect)?,
            heartbeat: defaults.heartbeat,
            connect_timeout: defaults.connect_timeout,
        };

        if connection.port == 0 {
            return Err(ConfigError::invalid("EVENTLOG_AGENT_AMQP_PORT", "port must be greater than 0"));
        }

        let channels = Self::parse_channels()?;
        let lookback = Self::parse_lookback()?;
        let follow = Self::parse_follow()?;
        let queue = Self::parse_queue()?;

        let origin_host = env::var("EVENTLOG_AGENT_HOSTNAME")
            .or_else(|_| env::var("HOSTNAME"))
            .or_else(|_| env::var("COMPUTERNAME"))
            .ok()
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| "localhost".to_string());

        let logging = LoggingConfig {
            directory: env::var("EVENTLOG_AGENT_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| LoggingConfig::default().directory),
            level: env::var("EVENTLOG_AGENT_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        };

        Ok(Self {
            connection,
            channels,
            lookback,
            follow,
            queue,
            origin_host,
            logging,
        })
    }

    fn parse_channels() -> Result<Vec<String>, ConfigError> {
        let env_var = "EVENTLOG_AGENT_CHANNELS";
        let raw = env::var(env_var).unwrap_or_else(|_| DEFAULT_CHANNELS.to_string());

        let channels: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();

        if channels.is_empty() {
            return Err(ConfigError::invalid(env_var, "at least one channel is required"));
        }
        Ok(channels)
    }

    fn parse_lookback() -> Result<Duration, ConfigError> {
        let env_var = "EVENTLOG_AGENT_LOOKBACK_HOURS";
        let hours: u64 = parse_var(env_var, DEFAULT_LOOKBACK_HOURS)?;

        if hours == 0 {
            return Err(ConfigError::invalid(env_var, "lookback must be greater than 0"));
        }
        if hours > MAX_LOOKBACK_HOURS {
            return Err(ConfigError::invalid(
                env_var,
                format!("lookback {} exceeds maximum ({}h)", hours, MAX_LOOKBACK_HOURS),
            ));
        }
        Ok(Duration::from_secs(hours * 3600))
    }

    fn parse_follow() -> Result<Option<Duration>, ConfigError> {
        let env_var = "EVENTLOG_AGENT_FOLLOW_SECS";
        match env::var(env_var) {
            Ok(value) => {
                let secs: u64 = value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::invalid(env_var, format!("'{}' is not a valid number", value)))?;
                if secs == 0 {
                    return Err(ConfigError::invalid(env_var, "follow interval must be greater than 0"));
                }
                Ok(Some(Duration::from_secs(secs)))
            }
            Err(_) => Ok(None),
        }
    }

    fn parse_queue() -> Result<QueueConfig, ConfigError> {
        let capacity_var = "EVENTLOG_AGENT_QUEUE_CAPACITY";
        let capacity: usize = parse_var(capacity_var, DEFAULT_QUEUE_CAPACITY)?;

        if capacity == 0 {
            return Err(ConfigError::invalid(capacity_var, "queue capacity must be greater than 0"));
        }
        if capacity > MAX_QUEUE_CAPACITY {
            return Err(ConfigError::invalid(
                capacity_var,
                format!("queue capacity {} exceeds maximum allowed ({})", capacity, MAX_QUEUE_CAPACITY),
            ));
        }

        let overflow_var = "EVENTLOG_AGENT_QUEUE_OVERFLOW";
        let overflow = match env::var(overflow_var) {
            Ok(value) => value
                .parse::<OverflowPolicy>()
                .map_err(|message| ConfigError::invalid(overflow_var, message))?,
            Err(_) => OverflowPolicy::default(),
        };

        Ok(QueueConfig::new(capacity, overflow))
    }
}

impl Default for AgentConfig {
    /// Create a default configuration using default values.
    ///
    /// This is useful for testing or when environment variables are not set.
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            channels: DEFAULT_CHANNELS.split(',').map(str::to_string).collect(),
            lookback: Duration::from_secs(DEFAULT_LOOKBACK_HOURS * 3600),
            follow: None,
            queue: QueueConfig::default(),
            origin_host: "localhost".to_string(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Read a string variable that must not be blank when set.
fn string_var(name: &str, default: &str) -> Result<String, ConfigError> {
    match env::var(name) {
        Ok(value) if value.trim().is_empty() => Err(ConfigError::invalid(name, "value must not be empty")),
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => Ok(default.to_string()),
    }
}

/// Parse a numeric variable, falling back to `default` when unset.
fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::invalid(name, format!("'{}' is not a valid number", value))),
        Err(_) => Ok(default),
    }
}

fn parse_bool(name: &str, default: bool) -> Result<bool, ConfigError> {
    match env::var(name) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::invalid(name, format!("'{}' is not a valid boolean", value))),
        },
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    // Environment variables are process-wide; serialize tests touching them
    static ENV_LOCK: Mutex<()> = parking_lot::const_mutex(());

    // Helper to temporarily set environment variables for testing
    struct EnvGuard {
        key: String,
        original: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &str, value: &str) -> Self {
            let original = env::var(key).ok();
            env::set_var(key, value);
            Self {
                key: key.to_string(),
                original,
            }
        }

        fn remove(key: &str) -> Self {
            let original = env::var(key).ok();
            env::remove_var(key);
            Self {
                key: key.to_string(),
                original,
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.original {
                Some(val) => env::set_var(&self.key, val),
                None => env::remove_var(&self.key),
            }
        }
    }

    const ALL_VARS: &[&str] = &[
        "EVENTLOG_AGENT_AMQP_HOST",
        "EVENTLOG_AGENT_AMQP_PORT",
        "EVENTLOG_AGENT_AMQP_VHOST",
        "EVENTLOG_AGENT_AMQP_USERNAME",
        "EVENTLOG_AGENT_AMQP_PASSWORD",
        "EVENTLOG_AGENT_AMQP_EXCHANGE",
        "EVENTLOG_AGENT_AMQP_ROUTING_KEY",
        "EVENTLOG_AGENT_AUTO_RECONNECT",
        "EVENTLOG_AGENT_CHANNELS",
        "EVENTLOG_AGENT_LOOKBACK_HOURS",
        "EVENTLOG_AGENT_FOLLOW_SECS",
        "EVENTLOG_AGENT_QUEUE_CAPACITY",
        "EVENTLOG_AGENT_QUEUE_OVERFLOW",
        "EVENTLOG_AGENT_HOSTNAME",
        "EVENTLOG_AGENT_LOG_DIR",
        "EVENTLOG_AGENT_LOG_LEVEL",
    ];

    fn clear_all() -> Vec<EnvGuard> {
        ALL_VARS.iter().map(|var| EnvGuard::remove(var)).collect()
    }

    fn invalid_var(err: ConfigError) -> (String, String) {
        let ConfigError::Invalid { var, message } = err;
        (var, message)
    }

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.connection.host, "localhost");
        assert_eq!(config.connection.port, 5672);
        assert_eq!(config.connection.exchange, "windows_logs");
        assert_eq!(config.connection.routing_key, "system.logs");
        assert!(config.connection.auto_reconnect);
        assert_eq!(config.channels, vec!["System", "Application"]);
        assert_eq!(config.lookback, Duration::from_secs(3600));
        assert_eq!(config.queue.overflow, OverflowPolicy::Reject);
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_LOCK.lock();
        let _guards = clear_all();

        let config = AgentConfig::from_env().expect("Should load with defaults");
        assert_eq!(config.connection, ConnectionConfig::default());
        assert_eq!(config.channels, vec!["System", "Application"]);
        assert_eq!(config.lookback, Duration::from_secs(3600));
        assert_eq!(config.follow, None);
        assert_eq!(config.queue, QueueConfig::default());
        assert_eq!(config.logging, LoggingConfig::default());
    }

    #[test]
    fn test_config_from_env_custom_values() {
        let _lock = ENV_LOCK.lock();
        let _guards = clear_all();
        let _g1 = EnvGuard::set("EVENTLOG_AGENT_AMQP_HOST", "broker.internal");
        let _g2 = EnvGuard::set("EVENTLOG_AGENT_AMQP_PORT", "5673");
        let _g3 = EnvGuard::set("EVENTLOG_AGENT_AMQP_VHOST", "/win_logs");
        let _g4 = EnvGuard::set("EVENTLOG_AGENT_AUTO_RECONNECT", "false");
        let _g5 = EnvGuard::set("EVENTLOG_AGENT_CHANNELS", "System, Security ,,Setup");
        let _g6 = EnvGuard::set("EVENTLOG_AGENT_LOOKBACK_HOURS", "24");
        let _g7 = EnvGuard::set("EVENTLOG_AGENT_FOLLOW_SECS", "30");
        let _g8 = EnvGuard::set("EVENTLOG_AGENT_QUEUE_CAPACITY", "500");
        let _g9 = EnvGuard::set("EVENTLOG_AGENT_QUEUE_OVERFLOW", "drop-oldest");
        let _g10 = EnvGuard::set("EVENTLOG_AGENT_HOSTNAME", "ws-042");

        let config = AgentConfig::from_env().expect("Should load custom values");
        assert_eq!(config.connection.host, "broker.internal");
        assert_eq!(config.connection.port, 5673);
        assert_eq!(config.connection.virtual_host, "/win_logs");
        assert!(!config.connection.auto_reconnect);
        assert_eq!(config.channels, vec!["System", "Security", "Setup"]);
        assert_eq!(config.lookback, Duration::from_secs(24 * 3600));
        assert_eq!(config.follow, Some(Duration::from_secs(30)));
        assert_eq!(config.queue, QueueConfig::new(500, OverflowPolicy::DropOldest));
        assert_eq!(config.origin_host, "ws-042");
    }

    #[test]
    fn test_invalid_port() {
        let _lock = ENV_LOCK.lock();
        let _guards = clear_all();
        let _guard = EnvGuard::set("EVENTLOG_AGENT_AMQP_PORT", "not_a_number");

        let (var, message) = invalid_var(AgentConfig::from_env().unwrap_err());
        assert_eq!(var, "EVENTLOG_AGENT_AMQP_PORT");
        assert!(message.contains("not a valid number"));
    }

    #[test]
    fn test_zero_lookback() {
        let _lock = ENV_LOCK.lock();
        let _guards = clear_all();
        let _guard = EnvGuard::set("EVENTLOG_AGENT_LOOKBACK_HOURS", "0");

        let (_, message) = invalid_var(AgentConfig::from_env().unwrap_err());
        assert!(message.contains("greater than 0"));
    }

    #[test]
    fn test_lookback_exceeds_max() {
        let _lock = ENV_LOCK.lock();
        let _guards = clear_all();
        let _guard = EnvGuard::set("EVENTLOG_AGENT_LOOKBACK_HOURS", "9999");

        let (_, message) = invalid_var(AgentConfig::from_env().unwrap_err());
        assert!(message.contains("exceeds maximum"));
    }

    #[test]
    fn test_empty_channels() {
        let _lock = ENV_LOCK.lock();
        let _guards = clear_all();
        let _guard = EnvGuard::set("EVENTLOG_AGENT_CHANNELS", " , ");

        let (var, _) = invalid_var(AgentConfig::from_env().unwrap_err());
        assert_eq!(var, "EVENTLOG_AGENT_CHANNELS");
    }

    #[test]
    fn test_invalid_overflow_policy() {
        let _lock = ENV_LOCK.lock();
        let _guards = clear_all();
        let _guard = EnvGuard::set("EVENTLOG_AGENT_QUEUE_OVERFLOW", "block");

        let (_, message) = invalid_var(AgentConfig::from_env().unwrap_err());
        assert!(message.contains("not a valid overflow policy"));
    }

    #[test]
    fn test_invalid_bool() {
        let _lock = ENV_LOCK.lock();
        let _guards = clear_all();
        let _guard = EnvGuard::set("EVENTLOG_AGENT_AUTO_RECONNECT", "maybe");

        let (_, message) = invalid_var(AgentConfig::from_env().unwrap_err());
        assert!(message.contains("not a valid boolean"));
    }

    #[test]
    fn test_queue_capacity_exceeds_max() {
        let _lock = ENV_LOCK.lock();
        let _guards = clear_all();
        let _guard = EnvGuard::set("EVENTLOG_AGENT_QUEUE_CAPACITY", "99999999");

        let (_, message) = invalid_var(AgentConfig::from_env().unwrap_err());
        assert!(message.contains("exceeds maximum"));
    }

    #[test]
    fn test_endpoint_and_debug_hide_password() {
        let config = ConnectionConfig {
            password: "s3cret".to_string(),
            virtual_host: "/win_logs".to_string(),
            ..ConnectionConfig::default()
        };
        assert_eq!(config.endpoint(), "amqp://localhost:5672/win_logs");
        assert!(!format!("{:?}", config).contains("s3cret"));
    }

    #[test]
    fn test_config_error_display() {
        let error = ConfigError::invalid("TEST_VAR", "test error");
        assert_eq!(format!("{}", error), "Configuration error for TEST_VAR: test error");
    }
}
