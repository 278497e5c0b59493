//! Store configuration.
//!
//! Covers the connection target, pool limits, the default record TTL and the
//! reconnect monitor policy. Values come from defaults, optionally overridden by
//! environment variables, and are validated before use.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Policy for the background reconnect monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// How often the monitor wakes when no notification arrives.
    pub tick_interval: Duration,
    /// Miss count at which a reconnect sequence is considered.
    pub allowed_miss_count: u32,
    /// Miss count added by an explicit failure notification.
    pub failure_penalty: u32,
    /// Number of reconnect attempts before the store is declared lost.
    pub max_attempts: u32,
    /// Base delay; attempt `i` sleeps `base_delay * 2^i`.
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(20),
            allowed_miss_count: 3,
            failure_penalty: 3,
            max_attempts: 8,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl ReconnectPolicy {
    /// Delay slept before reconnect attempt `attempt` (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        // Shift capped so the multiplier cannot overflow.
        let multiplier = 1u32 << attempt.min(20);
        self.base_delay.saturating_mul(multiplier)
    }
}

/// Configuration for the store connection layer.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Store host name or address.
    pub host: String,
    /// Store TCP port.
    pub port: u16,
    /// Logical database index.
    pub database: i64,
    /// Maximum idle connections kept for reuse.
    pub pool_max_idle: usize,
    /// Maximum connections checked out at once.
    pub pool_max_active: usize,
    /// How long a caller waits for a free slot when the pool is exhausted.
    pub pool_wait_timeout: Duration,
    /// Dial timeout for new connections.
    pub connect_timeout: Duration,
    /// TTL applied by `set_struct` and the hash write operations.
    pub default_ttl: Duration,
    /// Capacity of the connection-status notification channel.
    pub notify_capacity: usize,
    /// Reconnect monitor policy.
    pub reconnect: ReconnectPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            database: 0,
            pool_max_idle: 80,
            pool_max_active: 12000,
            pool_wait_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            default_ttl: Duration::from_secs(86400), // 1 day
            notify_capacity: 16,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl StoreConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `STORE_HOST`: Store host (default: 127.0.0.1)
    /// - `STORE_PORT`: Store port (default: 6379)
    /// - `STORE_DB`: Database index (default: 0)
    /// - `STORE_POOL_MAX_IDLE`: Idle connections kept (default: 80)
    /// - `STORE_POOL_MAX_ACTIVE`: Concurrent connections (default: 12000)
    /// - `STORE_POOL_WAIT_SECS`: Wait for a free pool slot (default: 5)
    /// - `STORE_CONNECT_TIMEOUT_SECS`: Dial timeout (default: 5)
    /// - `STORE_EXPIRE_SECS`: Default record TTL (default: 86400)
    /// - `STORE_STATUS_EVENT_SECS`: Monitor tick interval (default: 20)
    /// - `STORE_STATUS_ALLOWED_MISS`: Miss threshold (default: 3)
    /// - `STORE_RETRY_MAX_ATTEMPT`: Reconnect attempts (default: 8)
    /// - `STORE_RETRY_BASE_MS`: Backoff base in milliseconds (default: 100)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the
    /// resulting configuration fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("STORE_HOST") {
            config.host = val;
        }

        if let Ok(val) = std::env::var("STORE_PORT") {
            config.port = parse_env_value(&val, "STORE_PORT")?;
        }

        if let Ok(val) = std::env::var("STORE_DB") {
            config.database = parse_env_value(&val, "STORE_DB")?;
        }

        // Pool settings
        if let Ok(val) = std::env::var("STORE_POOL_MAX_IDLE") {
            config.pool_max_idle = parse_env_value(&val, "STORE_POOL_MAX_IDLE")?;
        }

        if let Ok(val) = std::env::var("STORE_POOL_MAX_ACTIVE") {
            config.pool_max_active = parse_env_value(&val, "STORE_POOL_MAX_ACTIVE")?;
        }

        if let Ok(val) = std::env::var("STORE_POOL_WAIT_SECS") {
            let secs: u64 = parse_env_value(&val, "STORE_POOL_WAIT_SECS")?;
            config.pool_wait_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("STORE_CONNECT_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "STORE_CONNECT_TIMEOUT_SECS")?;
            config.connect_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("STORE_EXPIRE_SECS") {
            let secs: u64 = parse_env_value(&val, "STORE_EXPIRE_SECS")?;
            config.default_ttl = Duration::from_secs(secs);
        }

        // Reconnect monitor settings
        if let Ok(val) = std::env::var("STORE_STATUS_EVENT_SECS") {
            let secs: u64 = parse_env_value(&val, "STORE_STATUS_EVENT_SECS")?;
            config.reconnect.tick_interval = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("STORE_STATUS_ALLOWED_MISS") {
            config.reconnect.allowed_miss_count =
                parse_env_value(&val, "STORE_STATUS_ALLOWED_MISS")?;
        }

        if let Ok(val) = std::env::var("STORE_RETRY_MAX_ATTEMPT") {
            config.reconnect.max_attempts = parse_env_value(&val, "STORE_RETRY_MAX_ATTEMPT")?;
        }

        if let Ok(val) = std::env::var("STORE_RETRY_BASE_MS") {
            let ms: u64 = parse_env_value(&val, "STORE_RETRY_BASE_MS")?;
            config.reconnect.base_delay = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "host cannot be empty".to_string(),
            ));
        }

        if self.port == 0 {
            return Err(ConfigError::ValidationFailed(
                "port must be greater than 0".to_string(),
            ));
        }

        if self.database < 0 {
            return Err(ConfigError::ValidationFailed(
                "database cannot be negative".to_string(),
            ));
        }

        if self.pool_max_active == 0 {
            return Err(ConfigError::ValidationFailed(
                "pool_max_active must be greater than 0".to_string(),
            ));
        }

        if self.pool_max_idle > self.pool_max_active {
            return Err(ConfigError::ValidationFailed(
                "pool_max_idle cannot exceed pool_max_active".to_string(),
            ));
        }

        if self.connect_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "connect_timeout must be greater than 0".to_string(),
            ));
        }

        if self.default_ttl.as_secs() == 0 {
            return Err(ConfigError::ValidationFailed(
                "default_ttl must be at least one second".to_string(),
            ));
        }

        if self.notify_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "notify_capacity must be greater than 0".to_string(),
            ));
        }

        if self.reconnect.tick_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "reconnect tick_interval must be greater than 0".to_string(),
            ));
        }

        if self.reconnect.allowed_miss_count == 0 {
            return Err(ConfigError::ValidationFailed(
                "allowed_miss_count must be greater than 0".to_string(),
            ));
        }

        if self.reconnect.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_attempts must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Connection URL understood by the redis client.
    pub fn url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.database)
    }

    /// Builder method to set the store address.
    pub fn with_address(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    /// Builder method to set pool limits.
    pub fn with_pool_limits(mut self, max_idle: usize, max_active: usize) -> Self {
        self.pool_max_idle = max_idle;
        self.pool_max_active = max_active;
        self
    }

    /// Builder method to set the pool wait timeout.
    pub fn with_pool_wait_timeout(mut self, timeout: Duration) -> Self {
        self.pool_wait_timeout = timeout;
        self
    }

    /// Builder method to set the default record TTL.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Builder method to set the reconnect policy.
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Builder method to set the monitor notification buffer size.
    pub fn with_notify_capacity(mut self, capacity: usize) -> Self {
        self.notify_capacity = capacity;
        self
    }
}

/// Parses an environment variable value into the target type.
fn parse_env_value<T: std::str::FromStr>(val: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    val.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = StoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.url(), "redis://127.0.0.1:6379/0");
        assert_eq!(config.default_ttl, Duration::from_secs(86400));
    }

    #[test]
    fn test_validation_rejects_idle_above_active() {
        let config = StoreConfig::default().with_pool_limits(10, 5);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("pool_max_idle"));
    }

    #[test]
    fn test_validation_rejects_zero_ttl() {
        let config = StoreConfig::default().with_default_ttl(Duration::from_millis(500));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_attempts() {
        let policy = ReconnectPolicy {
            max_attempts: 0,
            ..Default::default()
        };
        let config = StoreConfig::default().with_reconnect_policy(policy);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_strictly_increases() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(400));
        assert_eq!(policy.backoff_delay(8), Duration::from_millis(25600));

        let delays: Vec<_> = (1..=policy.max_attempts)
            .map(|i| policy.backoff_delay(i))
            .collect();
        assert!(delays.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_parse_env_value() {
        let port: u16 = parse_env_value(" 6380 ", "STORE_PORT").unwrap();
        assert_eq!(port, 6380);

        let err = parse_env_value::<u16>("abc", "STORE_PORT").unwrap_err();
        assert!(err.to_string().contains("STORE_PORT"));
    }
}
