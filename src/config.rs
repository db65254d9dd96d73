use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Default host when none is configured
pub const DEFAULT_HOST: &str = "127.0.0.1";
/// Well-known port of the Redis-protocol cache service
pub const DEFAULT_PORT: u16 = 6379;
/// Default environment variable prefix used by [`ManagerConfig::from_env`]
pub const DEFAULT_ENV_PREFIX: &str = "CACHE";

/// Configuration for the connection manager.
///
/// Resolved once at process start and copied into the manager by
/// `initialize`; it is never mutated afterwards.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Where the cache service lives
    pub endpoint: Endpoint,
    /// Delay policy between reconnection attempts
    pub backoff: BackoffPolicy,
    /// Timeout for a single connection attempt
    pub connect_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            backoff: BackoffPolicy::default(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl ManagerConfig {
    /// Create a new builder for configuration
    pub fn builder() -> ManagerConfigBuilder {
        ManagerConfigBuilder::default()
    }

    /// Load configuration from `CACHE_*` environment variables.
    ///
    /// Recognised keys are `CACHE_HOST`, `CACHE_PORT`, `CACHE_BASE_DELAY_MS`,
    /// `CACHE_MAX_DELAY_MS` and `CACHE_CONNECT_TIMEOUT_MS`. Unset keys keep
    /// their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_prefixed(DEFAULT_ENV_PREFIX)
    }

    /// Same as [`from_env`](Self::from_env) with a custom prefix
    /// (e.g. `SESSION` reads `SESSION_HOST`, `SESSION_PORT`, ...).
    pub fn from_env_prefixed(prefix: &str) -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(format!("{}_{}", prefix, key)).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    ///
    /// Keys are passed without prefix: `HOST`, `PORT`, `BASE_DELAY_MS`,
    /// `MAX_DELAY_MS`, `CONNECT_TIMEOUT_MS`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = Self::builder();

        if let Some(host) = lookup("HOST") {
            builder = builder.host(host.trim());
        }
        if let Some(port) = parse_key::<u16>(&lookup, "PORT")? {
            builder = builder.port(port);
        }
        if let Some(ms) = parse_key::<u64>(&lookup, "BASE_DELAY_MS")? {
            builder = builder.base_delay(Duration::from_millis(ms));
        }
        if let Some(ms) = parse_key::<u64>(&lookup, "MAX_DELAY_MS")? {
            builder = builder.max_delay(Duration::from_millis(ms));
        }
        if let Some(ms) = parse_key::<u64>(&lookup, "CONNECT_TIMEOUT_MS")? {
            builder = builder.connect_timeout(Duration::from_millis(ms));
        }

        builder.build()
    }

    /// Check the configuration for errors that no retry could fix.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.endpoint.validate()?;
        self.backoff.validate()?;

        if self.connect_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "connect_timeout",
                reason: "must be > 0".to_string(),
            });
        }

        Ok(())
    }
}

fn parse_key<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key,
                reason: format!("cannot parse {:?}", raw),
            }),
    }
}

/// Builder for ManagerConfig
#[derive(Debug, Clone, Default)]
pub struct ManagerConfigBuilder {
    config: ManagerConfig,
    base_delay: Option<Duration>,
    max_delay: Option<Duration>,
}

impl ManagerConfigBuilder {
    /// Set the cache host (name or IP literal)
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.endpoint.host = host.into();
        self
    }

    /// Set the cache port
    pub fn port(mut self, port: u16) -> Self {
        self.config.endpoint.port = port;
        self
    }

    /// Set the linear backoff increment
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = Some(delay);
        self
    }

    /// Set the linear backoff cap
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Replace the backoff policy entirely.
    ///
    /// `base_delay`/`max_delay` still apply on top if the policy is linear.
    pub fn backoff(mut self, policy: BackoffPolicy) -> Self {
        self.config.backoff = policy;
        self
    }

    /// Set the timeout for a single connection attempt
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Build the configuration with validation.
    pub fn build(mut self) -> Result<ManagerConfig, ConfigError> {
        if let BackoffPolicy::Linear {
            base_delay,
            max_delay,
        } = &mut self.config.backoff
        {
            if let Some(base) = self.base_delay {
                *base_delay = base;
            }
            if let Some(max) = self.max_delay {
                *max_delay = max;
            }
        }

        self.config.validate()?;
        Ok(self.config)
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Host is empty or not a valid domain / IP literal
    #[error("Invalid host {host:?}: {reason}")]
    InvalidHost { host: String, reason: String },
    /// Port 0 cannot be connected to
    #[error("Invalid port: 0")]
    InvalidPort,
    /// Invalid backoff configuration
    #[error("Invalid backoff configuration: {0}")]
    InvalidBackoff(String),
    /// A setting (or environment variable) has an unusable value
    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

/// Host and port of the cache service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Reject hosts and ports that can never be connected to.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }

        if self.host.is_empty() {
            return Err(ConfigError::InvalidHost {
                host: self.host.clone(),
                reason: "empty host".to_string(),
            });
        }

        // Bare IPv6 literals are not accepted by the URL host parser
        if self.host.parse::<IpAddr>().is_ok() {
            return Ok(());
        }

        url::Host::parse(&self.host)
            .map(|_| ())
            .map_err(|e| ConfigError::InvalidHost {
                host: self.host.clone(),
                reason: e.to_string(),
            })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// A user-supplied mapping from attempt number to delay.
#[derive(Clone)]
pub struct CustomBackoff(Arc<dyn Fn(u32) -> Duration + Send + Sync>);

impl CustomBackoff {
    pub fn new(f: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }
}

impl fmt::Debug for CustomBackoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CustomBackoff(..)")
    }
}

/// Backoff policy for reconnection.
///
/// The default is a capped *linear* backoff: every failed attempt adds
/// `base_delay`, flattened at `max_delay`.
#[derive(Debug, Clone)]
pub enum BackoffPolicy {
    Linear {
        /// Increment added per failed attempt
        base_delay: Duration,
        /// Upper bound for any single delay
        max_delay: Duration,
    },
    Custom(CustomBackoff),
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::Linear {
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(2000),
        }
    }
}

impl BackoffPolicy {
    /// Linear policy with the given increment and cap
    pub fn linear(base_delay: Duration, max_delay: Duration) -> Self {
        Self::Linear {
            base_delay,
            max_delay,
        }
    }

    /// Policy backed by an arbitrary function
    pub fn custom(f: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        Self::Custom(CustomBackoff::new(f))
    }

    /// Calculate the delay before reconnect attempt `attempt` (1-indexed:
    /// the counter is incremented before this is called).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::Linear {
                base_delay,
                max_delay,
            } => base_delay.saturating_mul(attempt).min(*max_delay),
            Self::Custom(CustomBackoff(f)) => f(attempt),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Self::Linear {
            base_delay,
            max_delay,
        } = self
        {
            if base_delay.is_zero() {
                return Err(ConfigError::InvalidBackoff(
                    "base_delay must be > 0".to_string(),
                ));
            }
            if max_delay < base_delay {
                return Err(ConfigError::InvalidBackoff(
                    "max_delay must be >= base_delay".to_string(),
                ));
            }
        }
        Ok(())
    }
}
